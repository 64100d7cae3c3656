use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use ethers::types::{
    transaction::eip2718::TypedTransaction, Address, Bytes, Eip1559TransactionRequest,
    Transaction as EthersTransaction, H256, U256,
};
use serde::{Deserialize, Serialize};

/// 멤풀에서 관찰한 펜딩 트랜잭션 (필요한 필드만 유지)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingTx {
    pub hash: H256,
    pub from: Address,
    pub to: Option<Address>,
    pub value: U256,
    pub gas_price: Option<U256>,
    pub max_fee_per_gas: Option<U256>,
    pub gas: U256,
    pub input: Bytes,
    pub nonce: U256,
}

impl PendingTx {
    /// 레거시/EIP-1559 어느 쪽이든 실제 지불 의사가 있는 가스 가격
    pub fn effective_gas_price(&self) -> U256 {
        self.max_fee_per_gas.or(self.gas_price).unwrap_or_default()
    }
}

impl From<EthersTransaction> for PendingTx {
    fn from(tx: EthersTransaction) -> Self {
        Self {
            hash: tx.hash,
            from: tx.from,
            to: tx.to,
            value: tx.value,
            gas_price: tx.gas_price,
            max_fee_per_gas: tx.max_fee_per_gas,
            gas: tx.gas,
            input: tx.input,
            nonce: tx.nonce,
        }
    }
}

/// 기회 유형
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OpportunityKind {
    PendingTx,
    ArbitrageSpread,
}

impl fmt::Display for OpportunityKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            OpportunityKind::PendingTx => write!(f, "pending_tx"),
            OpportunityKind::ArbitrageSpread => write!(f, "arbitrage_spread"),
        }
    }
}

/// TxpoolMonitor가 만들고 TransactionCore가 소비하는 실행 후보
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: String,
    pub kind: OpportunityKind,
    /// 관련 토큰 주소
    pub token: Address,
    /// 사전 점수화된 예상 수익 (ETH)
    pub projected_profit: f64,
    pub source_tx: PendingTx,
    pub detected_at: DateTime<Utc>,
}

impl Opportunity {
    pub fn new(kind: OpportunityKind, token: Address, projected_profit: f64, source_tx: PendingTx) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            token,
            projected_profit,
            source_tx,
            detected_at: Utc::now(),
        }
    }
}

/// 수익성 계산 입력값. 토큰이 없으면 ETH 단위로 간주
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfitInputs {
    pub amount_in: f64,
    pub amount_out: f64,
    pub input_token: Option<String>,
    pub output_token: Option<String>,
    /// 예상 가스 사용량. 없으면 트랜잭션의 gas_limit 사용
    pub gas_used: Option<u64>,
    /// 가스 가격 (gwei). 없으면 동적 가스 가격 사용
    pub gas_price_gwei: Option<f64>,
}

/// 실행 의도. TransactionCore가 이것으로부터 TransactionRequest를 만든다
#[derive(Debug, Clone, Default)]
pub struct TxIntent {
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
    pub gas_limit: Option<U256>,
    pub profit: ProfitInputs,
    pub source_tx: Option<H256>,
    pub opportunity_id: Option<String>,
}

/// 트랜잭션 처리 단계
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxPhase {
    Built,
    Simulated,
    Signed,
    Submitted,
    Confirmed,
    Retried,
    Abandoned,
}

/// 서명 직전의 완성된 트랜잭션 요청 (EIP-1559)
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionRequest {
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
    pub gas_limit: U256,
    pub max_fee: U256,
    pub priority_fee: U256,
    pub chain_id: u64,
    pub nonce: U256,
}

impl TransactionRequest {
    pub fn to_typed(&self) -> TypedTransaction {
        Eip1559TransactionRequest::new()
            .from(self.from)
            .to(self.to)
            .value(self.value)
            .data(self.data.clone())
            .gas(self.gas_limit)
            .max_fee_per_gas(self.max_fee)
            .max_priority_fee_per_gas(self.priority_fee)
            .chain_id(self.chain_id)
            .nonce(self.nonce)
            .into()
    }

    /// 최대 가스 비용 (wei)
    pub fn max_gas_cost(&self) -> U256 {
        self.gas_limit.saturating_mul(self.max_fee)
    }
}

/// 최신 블록 요약
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlockInfo {
    pub number: u64,
    pub base_fee: U256,
    pub gas_used: U256,
    pub gas_limit: U256,
}

impl BlockInfo {
    pub fn gas_ratio(&self) -> f64 {
        if self.gas_limit.is_zero() {
            return 0.0;
        }
        u256_to_f64(self.gas_used) / u256_to_f64(self.gas_limit)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReceiptInfo {
    pub tx_hash: H256,
    pub block_number: Option<u64>,
    pub gas_used: Option<U256>,
    pub effective_gas_price: Option<U256>,
    /// true=성공, false=revert
    pub status: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Success,
    Reverted,
    Dropped,
}

/// 종료 상태에 도달한 트랜잭션 기록 (영속화 대상)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub tx_hash: H256,
    pub chain_id: u64,
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub gas_price: U256,
    pub gas_used: Option<U256>,
    pub block_number: Option<u64>,
    pub status: TxStatus,
    pub recorded_at: DateTime<Utc>,
}

/// 안전성 검사 결과
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SafetyCheckResult {
    pub passed: bool,
    pub checks_passed: usize,
    pub checks_total: usize,
    pub detail: BTreeMap<String, serde_json::Value>,
}

impl SafetyCheckResult {
    pub fn record(&mut self, name: &str, ok: bool, value: serde_json::Value) {
        self.checks_total += 1;
        if ok {
            self.checks_passed += 1;
        }
        self.detail.insert(
            name.to_string(),
            serde_json::json!({ "passed": ok, "value": value }),
        );
        self.passed = self.checks_passed == self.checks_total;
    }

    pub fn failed_checks(&self) -> Vec<String> {
        self.detail
            .iter()
            .filter(|(_, v)| v.get("passed").and_then(|p| p.as_bool()) == Some(false))
            .map(|(k, _)| k.clone())
            .collect()
    }
}

/// 재시도 가능한 오류의 원인
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    Timeout,
    Underpriced,
}

impl fmt::Display for RetryReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RetryReason::Timeout => write!(f, "timeout"),
            RetryReason::Underpriced => write!(f, "underpriced"),
        }
    }
}

/// 오류 처리 방향
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Retryable(RetryReason),
    Fatal(String),
}

/// 체인 엔드포인트 오류 분류
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Transaction underpriced: {0}")]
    Underpriced(String),

    #[error("Nonce too low: {0}")]
    NonceTooLow(String),

    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("Malformed transaction: {0}")]
    Malformed(String),

    #[error("Execution reverted: {0}")]
    Reverted(String),

    #[error("RPC error: {0}")]
    Rpc(String),
}

impl ChainError {
    /// 노드가 돌려준 오류 메시지를 분류
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();

        if lower.contains("underpriced")
            || lower.contains("fee too low")
            || lower.contains("less than block base fee")
        {
            ChainError::Underpriced(message)
        } else if lower.contains("nonce too low") {
            ChainError::NonceTooLow(message)
        } else if lower.contains("insufficient funds") {
            ChainError::InsufficientFunds(message)
        } else if lower.contains("timed out") || lower.contains("timeout") {
            ChainError::Timeout
        } else if lower.contains("execution reverted") || lower.contains("revert") {
            ChainError::Reverted(message)
        } else if lower.contains("intrinsic gas too low")
            || lower.contains("invalid")
            || lower.contains("rlp")
        {
            ChainError::Malformed(message)
        } else if lower.contains("connection")
            || lower.contains("error sending request")
            || lower.contains("closed")
            || lower.contains("refused")
        {
            ChainError::Connectivity(message)
        } else {
            ChainError::Rpc(message)
        }
    }

    /// 제출 재시도 루프에서의 처리 방향. timeout/underpriced만 재시도 대상
    pub fn disposition(&self) -> Disposition {
        match self {
            ChainError::Timeout => Disposition::Retryable(RetryReason::Timeout),
            ChainError::Underpriced(_) => Disposition::Retryable(RetryReason::Underpriced),
            other => Disposition::Fatal(other.to_string()),
        }
    }
}

pub type ChainResult<T> = Result<T, ChainError>;

/// 가격 피드 오류
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PriceFeedError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Price request timed out")]
    Timeout,

    #[error("Failed to parse price response: {0}")]
    Parse(String),

    #[error("Unknown token: {0}")]
    UnknownToken(String),
}

pub type PriceFeedResult<T> = Result<T, PriceFeedError>;

/// 실행기 수준 오류 (오케스트레이터로 전파되는 것들)
#[derive(thiserror::Error, Debug)]
pub enum ExecutorError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Bootstrap error: {0}")]
    Bootstrap(String),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("Invalid lifecycle transition: {0}")]
    Lifecycle(String),
}

pub type ExecutorResult<T> = Result<T, ExecutorError>;

const WEI_PER_ETH: f64 = 1e18;
const WEI_PER_GWEI: f64 = 1e9;

/// U256 → f64 (정밀도 손실 허용, 패닉 없음)
pub fn u256_to_f64(value: U256) -> f64 {
    if value <= U256::from(u128::MAX) {
        value.as_u128() as f64
    } else {
        value.to_string().parse().unwrap_or(f64::MAX)
    }
}

pub fn wei_to_eth(wei: U256) -> f64 {
    u256_to_f64(wei) / WEI_PER_ETH
}

pub fn wei_to_gwei(wei: U256) -> f64 {
    u256_to_f64(wei) / WEI_PER_GWEI
}

pub fn gwei_to_wei(gwei: f64) -> U256 {
    U256::from((gwei.max(0.0) * WEI_PER_GWEI).round() as u128)
}

pub fn eth_to_wei(eth: f64) -> U256 {
    U256::from((eth.max(0.0) * WEI_PER_ETH).round() as u128)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_error_classification() {
        assert_eq!(
            ChainError::classify("replacement transaction underpriced").disposition(),
            Disposition::Retryable(RetryReason::Underpriced)
        );
        assert_eq!(
            ChainError::classify("request timed out").disposition(),
            Disposition::Retryable(RetryReason::Timeout)
        );
        assert!(matches!(
            ChainError::classify("insufficient funds for gas * price + value"),
            ChainError::InsufficientFunds(_)
        ));
        assert!(matches!(
            ChainError::classify("nonce too low"),
            ChainError::NonceTooLow(_)
        ));
        assert!(matches!(
            ChainError::classify("rlp: expected input list"),
            ChainError::Malformed(_)
        ));
        assert!(matches!(
            ChainError::classify("insufficient funds").disposition(),
            Disposition::Fatal(_)
        ));
    }

    #[test]
    fn test_safety_check_result_counts() {
        let mut result = SafetyCheckResult::default();
        result.record("profit", true, serde_json::json!(0.5));
        assert!(result.passed);
        result.record("balance", false, serde_json::json!(0.0));
        result.record("gas_price", true, serde_json::json!(20.0));

        assert_eq!(result.checks_total, 3);
        assert_eq!(result.checks_passed, 2);
        assert!(!result.passed);
        assert_eq!(result.failed_checks(), vec!["balance".to_string()]);
    }

    #[test]
    fn test_unit_conversions() {
        assert_eq!(gwei_to_wei(1.5), U256::from(1_500_000_000u64));
        assert!((wei_to_eth(U256::exp10(18)) - 1.0).abs() < 1e-12);
        assert!((wei_to_gwei(U256::from(20_000_000_000u64)) - 20.0).abs() < 1e-9);
        assert_eq!(eth_to_wei(-1.0), U256::zero());
    }

    #[test]
    fn test_transaction_request_to_typed() {
        let req = TransactionRequest {
            from: Address::repeat_byte(1),
            to: Address::repeat_byte(2),
            value: U256::from(10),
            data: Bytes::default(),
            gas_limit: U256::from(21_000),
            max_fee: U256::from(30_000_000_000u64),
            priority_fee: U256::from(2_000_000_000u64),
            chain_id: 1,
            nonce: U256::from(7),
        };
        let typed = req.to_typed();
        assert_eq!(typed.nonce(), Some(&U256::from(7)));
        assert_eq!(typed.gas(), Some(&U256::from(21_000)));
        assert_eq!(req.max_gas_cost(), U256::from(21_000u64) * U256::from(30_000_000_000u64));
    }
}
