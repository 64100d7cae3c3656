use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use dashmap::DashMap;
use ethers::types::{Address, Bytes, H256, U256};
use serde::Serialize;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::nonce_core::NonceCore;
use crate::blockchain::{ChainClient, TxSigner};
use crate::config::{Config, RetryPolicy};
use crate::constants::{ETH_TRANSFER_GAS, GAS_ESTIMATE_BUFFER, GAS_RETRY_BUMP};
use crate::monitoring::ExecutionStats;
use crate::safety::{SafetyCandidate, SafetyNet};
use crate::storage::TransactionStore;
use crate::types::{
    gwei_to_wei, u256_to_f64, wei_to_gwei, ChainError, ChainResult, Disposition, ExecutorError,
    ExecutorResult, RetryReason, SafetyCheckResult, TransactionRecord, TransactionRequest,
    TxIntent, TxPhase, TxStatus,
};

/// 실행을 포기한 이유
#[derive(Debug, Clone, PartialEq)]
pub enum AbandonReason {
    CircuitOpen,
    NonceUnavailable(String),
    BuildFailed(String),
    SafetyRejected(SafetyCheckResult),
    SimulationFailed(String),
    /// 시뮬레이션까지만 수행 (브로드캐스트 안 함)
    DryRun,
    Rejected(ChainError),
    SigningFailed(String),
    GasCeiling,
    RetriesExhausted,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Submitted(H256),
    Abandoned(AbandonReason),
}

/// 실행 한 건의 전체 결과
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub outcome: ExecutionOutcome,
    pub nonce: Option<u64>,
    pub attempts: u32,
    /// 시도별 max fee (wei)
    pub fee_history: Vec<U256>,
    pub phases: Vec<TxPhase>,
}

impl ExecutionReport {
    fn new() -> Self {
        Self {
            outcome: ExecutionOutcome::Abandoned(AbandonReason::Cancelled),
            nonce: None,
            attempts: 0,
            fee_history: Vec::new(),
            phases: Vec::new(),
        }
    }

    pub fn tx_hash(&self) -> Option<H256> {
        match self.outcome {
            ExecutionOutcome::Submitted(hash) => Some(hash),
            ExecutionOutcome::Abandoned(_) => None,
        }
    }
}

/// 영수증 추적. 스폰된 태스크로 옮길 수 있도록 Arc만 보관
#[derive(Clone)]
struct ReceiptTracker {
    chain: Arc<dyn ChainClient>,
    nonce_core: Arc<NonceCore>,
    store: Arc<dyn TransactionStore>,
    stats: Arc<ExecutionStats>,
    pending_fees: Arc<DashMap<u64, (U256, U256)>>,
    timeout: Duration,
    poll_interval: Duration,
}

impl ReceiptTracker {
    async fn watch(&self, hash: H256, request: TransactionRequest, cancel: CancellationToken) -> Option<TxStatus> {
        let deadline = Instant::now() + self.timeout;

        let (status, receipt) = loop {
            match self.chain.get_transaction_receipt(hash).await {
                Ok(Some(receipt)) => {
                    let status = match receipt.status {
                        Some(false) => TxStatus::Reverted,
                        _ => TxStatus::Success,
                    };
                    break (status, Some(receipt));
                }
                Ok(None) => {}
                Err(e) => debug!("영수증 조회 실패 {:?}: {}", hash, e),
            }

            if Instant::now() >= deadline {
                break (TxStatus::Dropped, None);
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        };

        let nonce = request.nonce.low_u64();
        self.pending_fees.remove(&nonce);
        self.stats.record_receipt(status);

        match status {
            TxStatus::Success => info!("✅ 트랜잭션 포함 {:?} (nonce {})", hash, nonce),
            TxStatus::Reverted => warn!("⚠️ 트랜잭션 revert {:?} (nonce {})", hash, nonce),
            TxStatus::Dropped => {
                warn!("⚠️ 트랜잭션 영수증 없음, 드롭으로 처리 {:?} (nonce {})", hash, nonce);
                if let Err(e) = self.nonce_core.resync(request.from).await {
                    error!("❌ 드롭 후 nonce 재동기화 실패: {}", e);
                }
            }
        }

        let record = TransactionRecord {
            tx_hash: hash,
            chain_id: request.chain_id,
            from: request.from,
            to: request.to,
            value: request.value,
            gas_price: receipt
                .as_ref()
                .and_then(|r| r.effective_gas_price)
                .unwrap_or(request.max_fee),
            gas_used: receipt.as_ref().and_then(|r| r.gas_used),
            block_number: receipt.as_ref().and_then(|r| r.block_number),
            status,
            recorded_at: chrono::Utc::now(),
        };
        if let Err(e) = self.store.record(&record).await {
            error!("❌ 트랜잭션 기록 저장 실패: {}", e);
        }
        Some(status)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TransactionCoreStatus {
    pub account: String,
    pub dry_run: bool,
    pub pending_receipts: usize,
}

/// nonce 할당 → 빌드 → 안전성 검사 → 시뮬레이션 → 서명/제출 재시도
pub struct TransactionCore {
    chain: Arc<dyn ChainClient>,
    signer: Arc<dyn TxSigner>,
    nonce_core: Arc<NonceCore>,
    safety: Arc<SafetyNet>,
    stats: Arc<ExecutionStats>,
    policy: RetryPolicy,
    chain_id: u64,
    default_gas_limit: U256,
    dry_run: bool,
    track_receipts: bool,
    receipts: ReceiptTracker,
    watchers: StdMutex<JoinSet<()>>,
    cancel: CancellationToken,
}

impl TransactionCore {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &Config,
        chain_id: u64,
        chain: Arc<dyn ChainClient>,
        signer: Arc<dyn TxSigner>,
        nonce_core: Arc<NonceCore>,
        safety: Arc<SafetyNet>,
        store: Arc<dyn TransactionStore>,
        stats: Arc<ExecutionStats>,
        cancel: CancellationToken,
    ) -> Self {
        let policy = config.retry_policy();
        info!(
            "⚙️ TransactionCore 초기화 (최대 시도 {}, 배수 {}, 상한 {:.1} gwei{})",
            policy.max_attempts,
            policy.fee_multiplier,
            wei_to_gwei(policy.max_fee_per_gas),
            if config.execution.dry_run { ", dry-run" } else { "" }
        );

        let receipts = ReceiptTracker {
            chain: chain.clone(),
            nonce_core: nonce_core.clone(),
            store,
            stats: stats.clone(),
            pending_fees: Arc::new(DashMap::new()),
            timeout: Duration::from_secs(config.execution.receipt_timeout_secs),
            poll_interval: Duration::from_millis(config.execution.receipt_poll_interval_ms.max(1)),
        };

        Self {
            chain,
            signer,
            nonce_core,
            safety,
            stats,
            policy,
            chain_id,
            default_gas_limit: U256::from(config.execution.default_gas_limit),
            dry_run: config.execution.dry_run,
            track_receipts: config.execution.track_receipts,
            receipts,
            watchers: StdMutex::new(JoinSet::new()),
            cancel,
        }
    }

    pub fn account(&self) -> Address {
        self.signer.address()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn execute_transaction(&self, intent: TxIntent) -> Option<H256> {
        self.execute_intent(intent).await.tx_hash()
    }

    pub async fn execute_intent(&self, intent: TxIntent) -> ExecutionReport {
        let account = self.signer.address();
        let mut report = ExecutionReport::new();
        self.stats.record_started();

        let outcome = self.execute_inner(&intent, account, &mut report).await;
        if let ExecutionOutcome::Abandoned(reason) = &outcome {
            self.stats
                .record_abandoned(matches!(reason, AbandonReason::SafetyRejected(_)));
            warn!(
                "🚫 실행 포기 (기회 {}): {:?}",
                intent.opportunity_id.as_deref().unwrap_or("-"),
                reason
            );
            report.phases.push(TxPhase::Abandoned);
        } else {
            self.stats.record_submitted();
        }
        report.outcome = outcome;
        report
    }

    async fn execute_inner(&self, intent: &TxIntent, account: Address, report: &mut ExecutionReport) -> ExecutionOutcome {
        if self.cancel.is_cancelled() {
            return ExecutionOutcome::Abandoned(AbandonReason::Cancelled);
        }
        if !self.safety.is_safe_to_proceed(account).await {
            return ExecutionOutcome::Abandoned(AbandonReason::CircuitOpen);
        }

        let nonce = match self.nonce_core.allocate(account).await {
            Ok(nonce) => nonce,
            Err(e) => return ExecutionOutcome::Abandoned(AbandonReason::NonceUnavailable(e.to_string())),
        };
        report.nonce = Some(nonce);

        let outcome = self.execute_with_nonce(intent, account, nonce, report).await;
        if let ExecutionOutcome::Abandoned(reason) = &outcome {
            self.nonce_core.release(account, nonce).await;
            if matches!(reason, AbandonReason::Rejected(ChainError::NonceTooLow(_))) {
                if let Err(e) = self.nonce_core.resync(account).await {
                    error!("❌ nonce 재동기화 실패: {}", e);
                }
            }
        }
        outcome
    }

    /// 가스 한도: intent 값 → estimate × 1.2 → 기본값
    async fn resolve_gas_limit(&self, intent: &TxIntent, probe: &TransactionRequest) -> U256 {
        if let Some(limit) = intent.gas_limit {
            return limit;
        }
        match self.chain.estimate_gas(&probe.to_typed()).await {
            Ok(estimate) => {
                let buffered = u256_to_f64(estimate) * GAS_ESTIMATE_BUFFER;
                U256::from(buffered.ceil() as u64)
            }
            Err(e) => {
                debug!("가스 추정 실패, 기본값 사용: {}", e);
                self.default_gas_limit
            }
        }
    }

    /// (max fee, priority fee) wei
    async fn current_fees(&self) -> ChainResult<(U256, U256)> {
        let max_fee = gwei_to_wei(self.safety.get_dynamic_gas_price().await?);
        let priority = match self.chain.max_priority_fee().await {
            Ok(fee) => fee,
            Err(_) => gwei_to_wei(crate::constants::DEFAULT_PRIORITY_FEE_GWEI),
        };
        Ok((max_fee, priority.min(max_fee)))
    }

    async fn build_request(&self, intent: &TxIntent, account: Address, nonce: u64) -> ChainResult<TransactionRequest> {
        let (max_fee, priority_fee) = self.current_fees().await?;
        let mut request = TransactionRequest {
            from: account,
            to: intent.to,
            value: intent.value,
            data: intent.data.clone(),
            gas_limit: self.default_gas_limit,
            max_fee,
            priority_fee,
            chain_id: self.chain_id,
            nonce: U256::from(nonce),
        };
        request.gas_limit = self.resolve_gas_limit(intent, &request).await;
        Ok(request)
    }

    async fn execute_with_nonce(
        &self,
        intent: &TxIntent,
        account: Address,
        nonce: u64,
        report: &mut ExecutionReport,
    ) -> ExecutionOutcome {
        let mut request = match self.build_request(intent, account, nonce).await {
            Ok(request) => request,
            Err(e) => return ExecutionOutcome::Abandoned(AbandonReason::BuildFailed(e.to_string())),
        };
        report.phases.push(TxPhase::Built);

        let candidate = SafetyCandidate {
            request: request.clone(),
            profit: intent.profit.clone(),
            source_tx: intent.source_tx,
        };
        let safety = self.safety.check_transaction_safety(&candidate).await;
        if !safety.passed {
            return ExecutionOutcome::Abandoned(AbandonReason::SafetyRejected(safety));
        }

        if let Err(e) = self.chain.call(&request.to_typed()).await {
            return ExecutionOutcome::Abandoned(AbandonReason::SimulationFailed(e.to_string()));
        }
        report.phases.push(TxPhase::Simulated);

        if self.dry_run {
            info!("🧪 dry-run: nonce {} 시뮬레이션 성공, 제출 생략", nonce);
            return ExecutionOutcome::Abandoned(AbandonReason::DryRun);
        }

        for attempt in 1..=self.policy.max_attempts {
            if self.cancel.is_cancelled() {
                return ExecutionOutcome::Abandoned(AbandonReason::Cancelled);
            }
            report.attempts = attempt;
            report.fee_history.push(request.max_fee);

            let raw = match self.signer.sign(&request.to_typed()).await {
                Ok(raw) => raw,
                Err(e) => return ExecutionOutcome::Abandoned(AbandonReason::SigningFailed(e.to_string())),
            };
            report.phases.push(TxPhase::Signed);

            match self.submit(raw).await {
                Ok(hash) => {
                    report.phases.push(TxPhase::Submitted);
                    self.nonce_core.confirm(account, nonce).await;
                    self.receipts
                        .pending_fees
                        .insert(nonce, (request.max_fee, request.priority_fee));
                    info!(
                        "📤 트랜잭션 제출 {:?} (nonce {}, 시도 {}, {:.2} gwei)",
                        hash,
                        nonce,
                        attempt,
                        wei_to_gwei(request.max_fee)
                    );
                    self.spawn_receipt_watcher(hash, request);
                    return ExecutionOutcome::Submitted(hash);
                }
                Err(e) => match e.disposition() {
                    Disposition::Fatal(message) => {
                        warn!("❌ 제출 거절 (nonce {}): {}", nonce, message);
                        return ExecutionOutcome::Abandoned(AbandonReason::Rejected(e));
                    }
                    Disposition::Retryable(reason) => {
                        warn!("🔁 제출 재시도 필요 ({}/{}): {}", attempt, self.policy.max_attempts, reason);
                        if reason == RetryReason::Underpriced {
                            self.safety.invalidate_caches().await;
                        }
                        if attempt == self.policy.max_attempts {
                            break;
                        }

                        let Some(next_fee) = self.policy.next_fee(request.max_fee) else {
                            return ExecutionOutcome::Abandoned(AbandonReason::GasCeiling);
                        };
                        request.priority_fee = scale_priority(request.priority_fee, request.max_fee, next_fee);
                        request.max_fee = next_fee;
                        report.phases.push(TxPhase::Retried);
                        self.stats.record_retry();

                        tokio::select! {
                            _ = self.cancel.cancelled() => {
                                return ExecutionOutcome::Abandoned(AbandonReason::Cancelled);
                            }
                            _ = tokio::time::sleep(self.policy.retry_delay) => {}
                        }
                    }
                },
            }
        }

        ExecutionOutcome::Abandoned(AbandonReason::RetriesExhausted)
    }

    async fn submit(&self, raw: Bytes) -> ChainResult<H256> {
        match tokio::time::timeout(self.policy.submit_timeout, self.chain.send_raw_transaction(raw)).await {
            Ok(result) => result,
            Err(_) => Err(ChainError::Timeout),
        }
    }

    fn spawn_receipt_watcher(&self, hash: H256, request: TransactionRequest) {
        if !self.track_receipts {
            return;
        }
        let tracker = self.receipts.clone();
        let cancel = self.cancel.clone();
        match self.watchers.lock() {
            Ok(mut watchers) => {
                // 끝난 태스크 회수
                while watchers.try_join_next().is_some() {}
                watchers.spawn(async move {
                    tracker.watch(hash, request, cancel).await;
                });
            }
            Err(_) => error!("❌ 영수증 추적 태스크 등록 실패"),
        }
    }

    /// 영수증을 기다려 기록하고 상태를 반환. 취소되면 None
    pub async fn watch_receipt(&self, hash: H256, request: TransactionRequest) -> Option<TxStatus> {
        self.receipts.watch(hash, request, self.cancel.clone()).await
    }

    /// 같은 nonce로 자기 자신에게 0 ETH를 보내 기존 트랜잭션을 대체
    pub async fn cancel_transaction(&self, nonce: u64) -> ExecutorResult<H256> {
        let account = self.signer.address();
        let (current_max, current_priority) = self.current_fees().await?;
        let (base_max, base_priority) = self
            .receipts
            .pending_fees
            .get(&nonce)
            .map(|entry| *entry.value())
            .unwrap_or((current_max, current_priority));

        let max_fee = bump(base_max.max(current_max)).min(self.policy.max_fee_per_gas);
        let priority_fee = bump(base_priority.max(current_priority)).min(max_fee);

        let request = TransactionRequest {
            from: account,
            to: account,
            value: U256::zero(),
            data: Bytes::default(),
            gas_limit: U256::from(ETH_TRANSFER_GAS),
            max_fee,
            priority_fee,
            chain_id: self.chain_id,
            nonce: U256::from(nonce),
        };

        let raw = self.signer.sign(&request.to_typed()).await?;
        let hash = self.submit(raw).await.map_err(ExecutorError::from)?;
        self.receipts.pending_fees.insert(nonce, (max_fee, priority_fee));
        info!("🧹 취소 트랜잭션 제출 {:?} (nonce {}, {:.2} gwei)", hash, nonce, wei_to_gwei(max_fee));
        self.spawn_receipt_watcher(hash, request);
        Ok(hash)
    }

    pub fn status(&self) -> TransactionCoreStatus {
        TransactionCoreStatus {
            account: format!("{:?}", self.signer.address()),
            dry_run: self.dry_run,
            pending_receipts: self.receipts.pending_fees.len(),
        }
    }

    /// 진행 중인 영수증 추적을 중단
    pub async fn stop(&self) {
        self.cancel.cancel();
        let mut watchers = match self.watchers.lock() {
            Ok(mut watchers) => std::mem::take(&mut *watchers),
            Err(_) => return,
        };
        watchers.shutdown().await;
        info!("🛑 TransactionCore 중지");
    }
}

fn bump(fee: U256) -> U256 {
    let bumped = U256::from((u256_to_f64(fee) * GAS_RETRY_BUMP).ceil() as u128);
    bumped.max(fee + U256::one())
}

/// max fee 상승 비율만큼 priority fee도 올리되 max fee를 넘지 않음
fn scale_priority(priority: U256, current_max: U256, next_max: U256) -> U256 {
    if current_max.is_zero() {
        return priority.min(next_max);
    }
    (priority.saturating_mul(next_max) / current_max).min(next_max)
}
