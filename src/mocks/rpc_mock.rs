use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ethers::types::{transaction::eip2718::TypedTransaction, Address, Bytes, H256, U256};
use ethers::utils::keccak256;
use rand::Rng;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{get_mock_config, MockConfig};
use crate::blockchain::{ChainClient, ChainConnector};
use crate::types::{eth_to_wei, BlockInfo, ChainError, ChainResult, PendingTx, ReceiptInfo};

const MOCK_GAS_LIMIT: u64 = 30_000_000;

/// 제출 시 mock이 보일 동작
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitBehavior {
    Succeed,
    Fail(ChainError),
    /// 응답하지 않음 (호출자 타임아웃 유도)
    Hang,
}

/// 제출된 raw 트랜잭션 기록
#[derive(Debug, Clone)]
pub struct SubmittedTx {
    pub raw: Bytes,
    pub hash: H256,
    pub accepted: bool,
}

/// 스크립트 가능한 ChainClient mock
pub struct MockChainClient {
    mock_config: MockConfig,
    balance: RwLock<U256>,
    confirmed_nonce: AtomicU64,
    pending_nonce: AtomicU64,
    block: RwLock<BlockInfo>,
    priority_fee: RwLock<U256>,
    estimate: RwLock<ChainResult<U256>>,
    call_error: RwLock<Option<ChainError>>,
    submit_script: Mutex<VecDeque<SubmitBehavior>>,
    submitted: Mutex<Vec<SubmittedTx>>,
    receipts: RwLock<HashMap<H256, ReceiptInfo>>,
    auto_receipts: RwLock<bool>,
    pending_sender: Mutex<Option<mpsc::Sender<Vec<PendingTx>>>>,
    subscribe_failures: AtomicU32,
    nonce_failures: AtomicU32,
    subscribe_calls: AtomicUsize,
    send_attempts: AtomicUsize,
    block_requests: AtomicUsize,
}

impl MockChainClient {
    pub fn new() -> Self {
        Self::with_config(MockConfig::default())
    }

    pub fn from_env() -> Self {
        Self::with_config(get_mock_config())
    }

    pub fn with_config(mock_config: MockConfig) -> Self {
        let gas_limit = U256::from(MOCK_GAS_LIMIT);
        let gas_used = U256::from((MOCK_GAS_LIMIT as f64 * mock_config.block_gas_ratio) as u64);
        let block = BlockInfo {
            number: 18_000_000,
            base_fee: U256::from(mock_config.base_fee),
            gas_used,
            gas_limit,
        };

        debug!("🎭 MockChainClient initialized (chain {})", mock_config.chain_id);

        Self {
            balance: RwLock::new(eth_to_wei(mock_config.balance_eth)),
            confirmed_nonce: AtomicU64::new(0),
            pending_nonce: AtomicU64::new(0),
            block: RwLock::new(block),
            priority_fee: RwLock::new(U256::from(mock_config.priority_fee)),
            estimate: RwLock::new(Ok(U256::from(50_000u64))),
            call_error: RwLock::new(None),
            submit_script: Mutex::new(VecDeque::new()),
            submitted: Mutex::new(Vec::new()),
            receipts: RwLock::new(HashMap::new()),
            auto_receipts: RwLock::new(true),
            pending_sender: Mutex::new(None),
            subscribe_failures: AtomicU32::new(0),
            nonce_failures: AtomicU32::new(0),
            subscribe_calls: AtomicUsize::new(0),
            send_attempts: AtomicUsize::new(0),
            block_requests: AtomicUsize::new(0),
            mock_config,
        }
    }

    pub async fn set_balance(&self, balance: U256) {
        *self.balance.write().await = balance;
    }

    /// 체인 nonce 설정 (latest/pending 동일)
    pub fn set_nonce(&self, nonce: u64) {
        self.confirmed_nonce.store(nonce, Ordering::SeqCst);
        self.pending_nonce.store(nonce, Ordering::SeqCst);
    }

    pub fn set_nonces(&self, confirmed: u64, pending: u64) {
        self.confirmed_nonce.store(confirmed, Ordering::SeqCst);
        self.pending_nonce.store(pending, Ordering::SeqCst);
    }

    pub async fn set_block(&self, block: BlockInfo) {
        *self.block.write().await = block;
    }

    pub async fn set_estimate(&self, estimate: ChainResult<U256>) {
        *self.estimate.write().await = estimate;
    }

    pub async fn set_call_error(&self, error: Option<ChainError>) {
        *self.call_error.write().await = error;
    }

    pub async fn set_auto_receipts(&self, enabled: bool) {
        *self.auto_receipts.write().await = enabled;
    }

    pub async fn insert_receipt(&self, receipt: ReceiptInfo) {
        self.receipts.write().await.insert(receipt.tx_hash, receipt);
    }

    /// 다음 제출들의 동작을 순서대로 지정. 스크립트가 비면 성공
    pub async fn script_submissions(&self, behaviors: Vec<SubmitBehavior>) {
        self.submit_script.lock().await.extend(behaviors);
    }

    /// 다음 N번의 nonce 조회를 실패시킴
    pub fn fail_next_nonce_queries(&self, count: u32) {
        self.nonce_failures.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_subscriptions(&self, count: u32) {
        self.subscribe_failures.store(count, Ordering::SeqCst);
    }

    pub async fn submitted(&self) -> Vec<SubmittedTx> {
        self.submitted.lock().await.clone()
    }

    pub fn send_attempts(&self) -> usize {
        self.send_attempts.load(Ordering::SeqCst)
    }

    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    pub fn block_requests(&self) -> usize {
        self.block_requests.load(Ordering::SeqCst)
    }

    /// 현재 구독자에게 펜딩 트랜잭션 배치 전달
    pub async fn push_pending(&self, batch: Vec<PendingTx>) -> bool {
        let sender = self.pending_sender.lock().await.clone();
        match sender {
            Some(sender) => sender.send(batch).await.is_ok(),
            None => false,
        }
    }

    /// WebSocket 끊김 흉내
    pub async fn drop_subscription(&self) {
        self.pending_sender.lock().await.take();
    }

    async fn latency(&self) {
        if self.mock_config.network_latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.mock_config.network_latency_ms)).await;
        }
    }

    /// mock 모드 실행용 펜딩 트랜잭션 생성기
    pub fn start_pending_generation(self: Arc<Self>, tokens: HashSet<Address>, cancel: CancellationToken) {
        let tokens: Vec<Address> = tokens.into_iter().collect();
        let interval_ms = self.mock_config.pending_interval_ms.max(1);
        let monitored_rate = self.mock_config.monitored_tx_rate;

        tokio::spawn(async move {
            info!("🎭 [MOCK] 펜딩 트랜잭션 생성 시작");
            let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }

                let batch = generate_mock_batch(&tokens, monitored_rate);
                if !self.push_pending(batch).await {
                    debug!("🎭 [MOCK] 구독자 없음 - 배치 폐기");
                }
            }
            info!("🎭 [MOCK] 펜딩 트랜잭션 생성 종료");
        });
    }
}

impl Default for MockChainClient {
    fn default() -> Self {
        Self::new()
    }
}

fn generate_mock_batch(tokens: &[Address], monitored_rate: f64) -> Vec<PendingTx> {
    let mut rng = rand::thread_rng();
    let count = rng.gen_range(1..10);
    (0..count)
        .map(|_| {
            let to = if !tokens.is_empty() && rng.gen::<f64>() < monitored_rate {
                tokens[rng.gen_range(0..tokens.len())]
            } else {
                Address::random()
            };
            PendingTx {
                hash: H256::random(),
                from: Address::random(),
                to: Some(to),
                value: eth_to_wei(rng.gen_range(0.01..25.0)),
                gas_price: Some(U256::from(rng.gen_range(10_000_000_000u64..60_000_000_000u64))),
                max_fee_per_gas: None,
                gas: U256::from(rng.gen_range(21_000u64..300_000u64)),
                input: Bytes::default(),
                nonce: U256::from(rng.gen_range(0u64..500)),
            }
        })
        .collect()
}

#[async_trait]
impl ChainClient for MockChainClient {
    async fn chain_id(&self) -> ChainResult<u64> {
        Ok(self.mock_config.chain_id)
    }

    async fn get_balance(&self, _address: Address) -> ChainResult<U256> {
        self.latency().await;
        Ok(*self.balance.read().await)
    }

    async fn get_transaction_count(&self, _address: Address, pending: bool) -> ChainResult<u64> {
        self.latency().await;
        let remaining = self.nonce_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.nonce_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(ChainError::Rpc("mock nonce query failed".to_string()));
        }
        Ok(if pending {
            self.pending_nonce.load(Ordering::SeqCst)
        } else {
            self.confirmed_nonce.load(Ordering::SeqCst)
        })
    }

    async fn estimate_gas(&self, _tx: &TypedTransaction) -> ChainResult<U256> {
        self.estimate.read().await.clone()
    }

    async fn call(&self, _tx: &TypedTransaction) -> ChainResult<Bytes> {
        match self.call_error.read().await.clone() {
            Some(error) => Err(error),
            None => Ok(Bytes::default()),
        }
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> ChainResult<H256> {
        self.send_attempts.fetch_add(1, Ordering::SeqCst);
        self.latency().await;

        let behavior = self
            .submit_script
            .lock()
            .await
            .pop_front()
            .unwrap_or(SubmitBehavior::Succeed);
        let hash = H256::from(keccak256(&raw));

        match behavior {
            SubmitBehavior::Succeed => {
                self.submitted.lock().await.push(SubmittedTx { raw, hash, accepted: true });
                self.pending_nonce.fetch_add(1, Ordering::SeqCst);
                if *self.auto_receipts.read().await {
                    let block_number = self.block.read().await.number + 1;
                    self.receipts.write().await.insert(
                        hash,
                        ReceiptInfo {
                            tx_hash: hash,
                            block_number: Some(block_number),
                            gas_used: Some(U256::from(21_000u64)),
                            effective_gas_price: Some(U256::from(self.mock_config.base_fee)),
                            status: Some(true),
                        },
                    );
                }
                Ok(hash)
            }
            SubmitBehavior::Fail(error) => {
                self.submitted.lock().await.push(SubmittedTx { raw, hash, accepted: false });
                Err(error)
            }
            SubmitBehavior::Hang => {
                self.submitted.lock().await.push(SubmittedTx { raw, hash, accepted: false });
                futures::future::pending::<()>().await;
                Err(ChainError::Timeout)
            }
        }
    }

    async fn get_latest_block(&self) -> ChainResult<BlockInfo> {
        self.block_requests.fetch_add(1, Ordering::SeqCst);
        self.latency().await;
        Ok(self.block.read().await.clone())
    }

    async fn max_priority_fee(&self) -> ChainResult<U256> {
        Ok(*self.priority_fee.read().await)
    }

    async fn get_transaction_receipt(&self, hash: H256) -> ChainResult<Option<ReceiptInfo>> {
        Ok(self.receipts.read().await.get(&hash).cloned())
    }

    async fn subscribe_pending_transactions(&self) -> ChainResult<mpsc::Receiver<Vec<PendingTx>>> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);

        let remaining = self.subscribe_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.subscribe_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(ChainError::Connectivity("mock websocket unavailable".to_string()));
        }

        let (sender, receiver) = mpsc::channel(256);
        *self.pending_sender.lock().await = Some(sender);
        Ok(receiver)
    }
}

/// 처음 N번 연결에 실패하는 커넥터
pub struct MockConnector {
    client: Arc<MockChainClient>,
    failures_before_success: AtomicU32,
    attempts: AtomicU32,
}

impl MockConnector {
    pub fn new(client: Arc<MockChainClient>, failures_before_success: u32) -> Self {
        Self {
            client,
            failures_before_success: AtomicU32::new(failures_before_success),
            attempts: AtomicU32::new(0),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChainConnector for MockConnector {
    async fn connect(&self) -> ChainResult<Arc<dyn ChainClient>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures_before_success.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_before_success.store(remaining - 1, Ordering::SeqCst);
            return Err(ChainError::Connectivity("mock endpoint unreachable".to_string()));
        }
        Ok(self.client.clone())
    }

    fn endpoint(&self) -> String {
        "mock://chain".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_submit_script_is_consumed_in_order() {
        let client = MockChainClient::new();
        client
            .script_submissions(vec![SubmitBehavior::Fail(ChainError::Timeout), SubmitBehavior::Succeed])
            .await;

        assert_eq!(
            client.send_raw_transaction(Bytes::from(vec![1u8])).await,
            Err(ChainError::Timeout)
        );
        let hash = client.send_raw_transaction(Bytes::from(vec![2u8])).await.unwrap();
        assert_eq!(hash, H256::from(keccak256([2u8])));
        assert_eq!(client.send_attempts(), 2);
        assert!(client.get_transaction_receipt(hash).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_subscription_failures_then_success() {
        let client = MockChainClient::new();
        client.fail_next_subscriptions(1);

        assert!(client.subscribe_pending_transactions().await.is_err());
        let mut rx = client.subscribe_pending_transactions().await.unwrap();
        assert!(client.push_pending(generate_mock_batch(&[], 0.0)).await);
        assert!(rx.recv().await.is_some());

        client.drop_subscription().await;
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_connector_fails_then_connects() {
        let connector = MockConnector::new(Arc::new(MockChainClient::new()), 2);
        assert!(connector.connect().await.is_err());
        assert!(connector.connect().await.is_err());
        assert!(connector.connect().await.is_ok());
        assert_eq!(connector.attempts(), 3);
    }
}
