use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use ethers::types::{transaction::eip2718::TypedTransaction, Address, Bytes};

use crate::blockchain::TxSigner;
use crate::types::{ExecutorError, ExecutorResult};

/// 서명 대신 미서명 RLP를 반환하는 mock. 수수료가 바뀌면 바이트도 바뀐다
pub struct MockSigner {
    address: Address,
    fail: AtomicBool,
}

impl MockSigner {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            fail: AtomicBool::new(false),
        }
    }

    pub fn random() -> Self {
        Self::new(Address::random())
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl TxSigner for MockSigner {
    fn address(&self) -> Address {
        self.address
    }

    async fn sign(&self, tx: &TypedTransaction) -> ExecutorResult<Bytes> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ExecutorError::Signing("mock signer failure".to_string()));
        }
        Ok(tx.rlp())
    }
}
