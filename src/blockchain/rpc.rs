use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ethers::{
    providers::{Http, Middleware, Provider, ProviderError, Ws},
    types::{transaction::eip2718::TypedTransaction, Address, BlockNumber, Bytes, H256, U256},
};
use futures_util::{Stream, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::types::{BlockInfo, ChainError, ChainResult, PendingTx, ReceiptInfo};

/// 한 번에 핸들러로 넘기는 펜딩 트랜잭션 최대 개수
const PENDING_BATCH_SIZE: usize = 64;
const PENDING_CHANNEL_CAPACITY: usize = 256;

/// 체인 엔드포인트 조회/제출 인터페이스
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn chain_id(&self) -> ChainResult<u64>;

    async fn get_balance(&self, address: Address) -> ChainResult<U256>;

    /// pending=true면 멤풀에 있는 트랜잭션까지 포함한 nonce
    async fn get_transaction_count(&self, address: Address, pending: bool) -> ChainResult<u64>;

    async fn estimate_gas(&self, tx: &TypedTransaction) -> ChainResult<U256>;

    /// eth_call 시뮬레이션
    async fn call(&self, tx: &TypedTransaction) -> ChainResult<Bytes>;

    async fn send_raw_transaction(&self, raw: Bytes) -> ChainResult<H256>;

    async fn get_latest_block(&self) -> ChainResult<BlockInfo>;

    async fn max_priority_fee(&self) -> ChainResult<U256>;

    async fn get_transaction_receipt(&self, hash: H256) -> ChainResult<Option<ReceiptInfo>>;

    /// 펜딩 트랜잭션 구독. 스트림이 끊기면 채널이 닫힌다
    async fn subscribe_pending_transactions(&self) -> ChainResult<mpsc::Receiver<Vec<PendingTx>>>;

    async fn is_connected(&self) -> bool {
        self.get_latest_block().await.is_ok()
    }
}

/// 체인 연결을 만드는 팩토리. 오케스트레이터가 재시도 정책과 함께 사용
#[async_trait]
pub trait ChainConnector: Send + Sync {
    async fn connect(&self) -> ChainResult<Arc<dyn ChainClient>>;

    fn endpoint(&self) -> String;
}

fn map_provider_error(error: ProviderError) -> ChainError {
    match error {
        ProviderError::JsonRpcClientError(inner) => {
            if let Some(rpc) = inner.as_error_response() {
                ChainError::classify(rpc.message.clone())
            } else {
                ChainError::classify(inner.to_string())
            }
        }
        ProviderError::HTTPError(e) => ChainError::Connectivity(e.to_string()),
        other => ChainError::classify(other.to_string()),
    }
}

/// ethers Provider 기반 ChainClient 구현
/// HTTP는 조회/제출, WebSocket은 펜딩 트랜잭션 구독에 사용
pub struct EthersChainClient {
    http_provider: Arc<Provider<Http>>,
    ws_url: Option<String>,
    chain_id: u64,
    request_timeout: Duration,
    connect_timeout: Duration,
}

impl EthersChainClient {
    pub async fn connect(
        http_url: &str,
        ws_url: Option<String>,
        request_timeout: Duration,
        connect_timeout: Duration,
    ) -> ChainResult<Self> {
        info!("🔌 블록체인 RPC 클라이언트 초기화: {}", http_url);

        let http_provider = Provider::<Http>::try_from(http_url)
            .map_err(|e| ChainError::Connectivity(format!("invalid RPC url {}: {}", http_url, e)))?;
        let http_provider = Arc::new(http_provider);

        let chain_id = tokio::time::timeout(connect_timeout, http_provider.get_chainid())
            .await
            .map_err(|_| ChainError::Timeout)?
            .map_err(map_provider_error)?
            .as_u64();
        info!("🔗 체인 ID: {}", chain_id);

        Ok(Self {
            http_provider,
            ws_url,
            chain_id,
            request_timeout,
            connect_timeout,
        })
    }

    async fn request<T, F>(&self, fut: F) -> ChainResult<T>
    where
        F: Future<Output = Result<T, ProviderError>>,
    {
        tokio::time::timeout(self.request_timeout, fut)
            .await
            .map_err(|_| ChainError::Timeout)?
            .map_err(map_provider_error)
    }

    pub fn get_provider(&self) -> Arc<Provider<Http>> {
        self.http_provider.clone()
    }
}

async fn forward_batches<S>(stream: S, sender: mpsc::Sender<Vec<PendingTx>>)
where
    S: Stream<Item = PendingTx>,
{
    let mut batches = Box::pin(stream.ready_chunks(PENDING_BATCH_SIZE));
    while let Some(batch) = batches.next().await {
        if sender.send(batch).await.is_err() {
            debug!("펜딩 트랜잭션 수신자 종료 - 구독 해제");
            break;
        }
    }
}

#[async_trait]
impl ChainClient for EthersChainClient {
    async fn chain_id(&self) -> ChainResult<u64> {
        Ok(self.chain_id)
    }

    async fn get_balance(&self, address: Address) -> ChainResult<U256> {
        self.request(self.http_provider.get_balance(address, None)).await
    }

    async fn get_transaction_count(&self, address: Address, pending: bool) -> ChainResult<u64> {
        let block = if pending { BlockNumber::Pending } else { BlockNumber::Latest };
        let count = self
            .request(self.http_provider.get_transaction_count(address, Some(block.into())))
            .await?;
        Ok(count.as_u64())
    }

    async fn estimate_gas(&self, tx: &TypedTransaction) -> ChainResult<U256> {
        let gas = self.request(self.http_provider.estimate_gas(tx, None)).await?;
        debug!("가스 추정: {} gas", gas);
        Ok(gas)
    }

    async fn call(&self, tx: &TypedTransaction) -> ChainResult<Bytes> {
        self.request(self.http_provider.call(tx, None)).await
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> ChainResult<H256> {
        let pending = self.request(self.http_provider.send_raw_transaction(raw)).await?;
        Ok(pending.tx_hash())
    }

    async fn get_latest_block(&self) -> ChainResult<BlockInfo> {
        let block = self
            .request(self.http_provider.get_block(BlockNumber::Latest))
            .await?
            .ok_or_else(|| ChainError::Rpc("최신 블록을 가져올 수 없습니다".to_string()))?;

        Ok(BlockInfo {
            number: block.number.map(|n| n.as_u64()).unwrap_or_default(),
            base_fee: block.base_fee_per_gas.unwrap_or_default(),
            gas_used: block.gas_used,
            gas_limit: block.gas_limit,
        })
    }

    async fn max_priority_fee(&self) -> ChainResult<U256> {
        self.request(
            self.http_provider
                .request::<_, U256>("eth_maxPriorityFeePerGas", ()),
        )
        .await
    }

    async fn get_transaction_receipt(&self, hash: H256) -> ChainResult<Option<ReceiptInfo>> {
        let receipt = self
            .request(self.http_provider.get_transaction_receipt(hash))
            .await?;

        Ok(receipt.map(|r| ReceiptInfo {
            tx_hash: r.transaction_hash,
            block_number: r.block_number.map(|n| n.as_u64()),
            gas_used: r.gas_used,
            effective_gas_price: r.effective_gas_price,
            status: r.status.map(|s| s.as_u64() == 1),
        }))
    }

    async fn subscribe_pending_transactions(&self) -> ChainResult<mpsc::Receiver<Vec<PendingTx>>> {
        let ws_url = self
            .ws_url
            .clone()
            .ok_or_else(|| ChainError::Connectivity("WebSocket URL이 설정되지 않았습니다".to_string()))?;

        info!("🔌 WebSocket 연결 중: {}", ws_url);
        let ws = tokio::time::timeout(self.connect_timeout, Ws::connect(ws_url.as_str()))
            .await
            .map_err(|_| ChainError::Timeout)?
            .map_err(|e| ChainError::Connectivity(e.to_string()))?;
        let provider = Arc::new(Provider::new(ws));

        let (sender, receiver) = mpsc::channel(PENDING_CHANNEL_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel::<ChainResult<()>>();

        tokio::spawn(async move {
            // 전체 트랜잭션 구독을 우선 시도하고, 지원하지 않는 노드는 해시 구독 후 조회
            match provider.subscribe_full_pending_txs().await {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    forward_batches(stream.map(PendingTx::from), sender).await;
                }
                Err(full_err) => {
                    warn!("⚠️ 전체 펜딩 트랜잭션 구독 불가, 해시 구독으로 전환: {}", full_err);
                    match provider.subscribe_pending_txs().await {
                        Ok(stream) => {
                            let _ = ready_tx.send(Ok(()));
                            let lookup = provider.clone();
                            let txs = stream
                                .then(move |hash| {
                                    let lookup = lookup.clone();
                                    async move { lookup.get_transaction(hash).await.ok().flatten() }
                                })
                                .filter_map(|tx| async move { tx.map(PendingTx::from) });
                            forward_batches(txs, sender).await;
                        }
                        Err(e) => {
                            let _ = ready_tx.send(Err(map_provider_error(e)));
                        }
                    }
                }
            }
            debug!("펜딩 트랜잭션 구독 종료");
        });

        match ready_rx.await {
            Ok(Ok(())) => Ok(receiver),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ChainError::Connectivity("구독 태스크가 비정상 종료되었습니다".to_string())),
        }
    }
}

/// 설정 기반 ethers 커넥터
#[derive(Debug, Clone)]
pub struct EthersConnector {
    http_url: String,
    ws_url: Option<String>,
    request_timeout: Duration,
    connect_timeout: Duration,
}

impl EthersConnector {
    pub fn from_config(config: &Config) -> Self {
        Self {
            http_url: config.network.rpc_url.clone(),
            ws_url: config.network.ws_url.clone(),
            request_timeout: Duration::from_millis(config.execution.submit_timeout_ms),
            connect_timeout: Duration::from_millis(config.connection.connect_timeout_ms),
        }
    }
}

#[async_trait]
impl ChainConnector for EthersConnector {
    async fn connect(&self) -> ChainResult<Arc<dyn ChainClient>> {
        let client = EthersChainClient::connect(
            &self.http_url,
            self.ws_url.clone(),
            self.request_timeout,
            self.connect_timeout,
        )
        .await?;
        Ok(Arc::new(client))
    }

    fn endpoint(&self) -> String {
        self.http_url.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_error_mapping() {
        let err = map_provider_error(ProviderError::CustomError(
            "replacement transaction underpriced".to_string(),
        ));
        assert!(matches!(err, ChainError::Underpriced(_)));

        let err = map_provider_error(ProviderError::CustomError("nonce too low".to_string()));
        assert!(matches!(err, ChainError::NonceTooLow(_)));
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_url() {
        let result = EthersChainClient::connect(
            "not a url",
            None,
            Duration::from_millis(50),
            Duration::from_millis(50),
        )
        .await;
        assert!(matches!(result, Err(ChainError::Connectivity(_))));
    }

    #[test]
    fn test_connector_from_config() {
        let config = Config::default();
        let connector = EthersConnector::from_config(&config);
        assert_eq!(connector.endpoint(), config.network.rpc_url);
    }
}
