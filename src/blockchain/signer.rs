use async_trait::async_trait;
use ethers::{
    signers::{LocalWallet, Signer},
    types::{transaction::eip2718::TypedTransaction, Address, Bytes},
};
use tracing::info;

use crate::types::{ExecutorError, ExecutorResult};

/// 서명 자격 증명. 키 생성은 하지 않고 외부에서 받은 것만 보관
#[async_trait]
pub trait TxSigner: Send + Sync {
    fn address(&self) -> Address;

    /// 서명된 raw 트랜잭션 바이트 반환
    async fn sign(&self, tx: &TypedTransaction) -> ExecutorResult<Bytes>;
}

/// ethers LocalWallet 기반 서명자
pub struct WalletSigner {
    wallet: LocalWallet,
}

impl WalletSigner {
    pub fn from_private_key(private_key: &str, chain_id: u64) -> ExecutorResult<Self> {
        let wallet: LocalWallet = private_key
            .trim()
            .parse()
            .map_err(|e| ExecutorError::Config(format!("Invalid private key: {}", e)))?;
        let wallet = wallet.with_chain_id(chain_id);
        info!("🔑 Wallet 초기화 완료: {:?}", wallet.address());
        Ok(Self { wallet })
    }
}

impl std::fmt::Debug for WalletSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalletSigner")
            .field("address", &self.wallet.address())
            .finish()
    }
}

#[async_trait]
impl TxSigner for WalletSigner {
    fn address(&self) -> Address {
        self.wallet.address()
    }

    async fn sign(&self, tx: &TypedTransaction) -> ExecutorResult<Bytes> {
        let signature = self
            .wallet
            .sign_transaction(tx)
            .await
            .map_err(|e| ExecutorError::Signing(e.to_string()))?;
        Ok(tx.rlp_signed(&signature))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TransactionRequest;
    use ethers::types::U256;

    const TEST_KEY: &str = "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

    #[test]
    fn test_invalid_private_key_is_config_error() {
        let result = WalletSigner::from_private_key("not-a-key", 1);
        assert!(matches!(result, Err(ExecutorError::Config(_))));
    }

    #[tokio::test]
    async fn test_sign_produces_typed_envelope() {
        let signer = WalletSigner::from_private_key(TEST_KEY, 1).unwrap();
        let req = TransactionRequest {
            from: signer.address(),
            to: Address::repeat_byte(0x22),
            value: U256::from(1),
            data: Bytes::default(),
            gas_limit: U256::from(21_000),
            max_fee: U256::from(30_000_000_000u64),
            priority_fee: U256::from(1_000_000_000u64),
            chain_id: 1,
            nonce: U256::zero(),
        };

        let raw = signer.sign(&req.to_typed()).await.unwrap();
        // EIP-1559 타입 프리픽스
        assert_eq!(raw[0], 0x02);

        let bumped = TransactionRequest { max_fee: U256::from(33_000_000_000u64), ..req };
        let raw_bumped = signer.sign(&bumped.to_typed()).await.unwrap();
        assert_ne!(raw, raw_bumped);
    }
}
