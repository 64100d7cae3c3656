use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use ethers::types::{Address, H256, U256};
use rust_decimal::prelude::ToPrimitive;
use serde_json::json;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::blockchain::ChainClient;
use crate::config::{Config, SafetyConfig};
use crate::constants::{
    DEFAULT_GAS_LIMIT, MAX_SLIPPAGE_PCT, MIN_SLIPPAGE_PCT, SLIPPAGE_HIGH_CONGESTION, SLIPPAGE_TIERS,
};
use crate::monitoring::{AlertLevel, AlertSink, MarketMonitor};
use crate::types::{
    eth_to_wei, wei_to_eth, wei_to_gwei, ChainResult, ProfitInputs, SafetyCheckResult,
    TransactionRequest,
};

/// RPC 오류 시 사용하는 혼잡도
const FALLBACK_CONGESTION: f64 = 0.5;

/// 안전성 검사 대상
#[derive(Debug, Clone)]
pub struct SafetyCandidate {
    pub request: TransactionRequest,
    pub profit: ProfitInputs,
    pub source_tx: Option<H256>,
}

/// 수익 계산 내역 (ETH)
#[derive(Debug, Clone, PartialEq)]
pub struct ProfitBreakdown {
    pub gross: f64,
    pub gas_cost: f64,
    pub slippage_cost: f64,
    pub net: f64,
}

#[derive(Debug, Clone)]
struct CachedValue {
    value: f64,
    at: Instant,
}

#[derive(Debug, Clone, Default)]
struct CircuitState {
    open: bool,
    reason: Option<String>,
}

/// 제출 전 안전 게이트
pub struct SafetyNet {
    chain: Arc<dyn ChainClient>,
    market: Arc<MarketMonitor>,
    alerts: Arc<dyn AlertSink>,
    config: SafetyConfig,
    min_profit: f64,
    max_gas_price_gwei: f64,
    gas_price_cache: Mutex<Option<CachedValue>>,
    congestion_cache: Mutex<Option<CachedValue>>,
    /// (블록 번호, gas ratio)
    gas_ratio_history: Mutex<VecDeque<(u64, f64)>>,
    evaluated_sources: DashMap<H256, Instant>,
    circuit: RwLock<CircuitState>,
}

impl SafetyNet {
    pub fn new(
        config: &Config,
        chain: Arc<dyn ChainClient>,
        market: Arc<MarketMonitor>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        info!("🛡️ SafetyNet 초기화 (최소 수익 {} ETH, 가스 상한 {} gwei)",
              config.execution.min_profit, config.execution.max_gas_price_gwei);
        Self {
            chain,
            market,
            alerts,
            config: config.safety.clone(),
            min_profit: config.execution.min_profit,
            max_gas_price_gwei: config.execution.max_gas_price_gwei,
            gas_price_cache: Mutex::new(None),
            congestion_cache: Mutex::new(None),
            gas_ratio_history: Mutex::new(VecDeque::new()),
            evaluated_sources: DashMap::new(),
            circuit: RwLock::new(CircuitState::default()),
        }
    }

    pub async fn get_balance(&self, account: Address) -> ChainResult<U256> {
        self.chain.get_balance(account).await
    }

    /// 서킷 브레이커, 최소 잔액, 기본 수수료를 확인
    pub async fn is_safe_to_proceed(&self, account: Address) -> bool {
        {
            let circuit = self.circuit.read().await;
            if circuit.open {
                warn!("⛔ 서킷 브레이커 작동 중: {}", circuit.reason.as_deref().unwrap_or("unknown"));
                return false;
            }
        }

        let balance = match self.chain.get_balance(account).await {
            Ok(balance) => balance,
            Err(e) => {
                warn!("⚠️ 잔액 조회 실패: {}", e);
                return false;
            }
        };
        if balance < eth_to_wei(self.config.min_balance_eth) {
            let reason = format!(
                "잔액 {:.4} ETH가 최소 기준 {} ETH 미만",
                wei_to_eth(balance),
                self.config.min_balance_eth
            );
            self.trip_circuit(&reason).await;
            return false;
        }

        match self.chain.get_latest_block().await {
            Ok(block) if wei_to_gwei(block.base_fee) > self.max_gas_price_gwei => {
                warn!("⚠️ 기본 수수료 {:.1} gwei가 상한 초과", wei_to_gwei(block.base_fee));
                false
            }
            Ok(_) => true,
            Err(e) => {
                warn!("⚠️ 블록 조회 실패: {}", e);
                false
            }
        }
    }

    pub async fn trip_circuit(&self, reason: &str) {
        let mut circuit = self.circuit.write().await;
        if circuit.open {
            return;
        }
        circuit.open = true;
        circuit.reason = Some(reason.to_string());
        drop(circuit);
        self.alerts
            .alert(AlertLevel::Critical, &format!("서킷 브레이커 작동: {}", reason));
    }

    pub async fn reset_circuit(&self) {
        let mut circuit = self.circuit.write().await;
        if !circuit.open {
            return;
        }
        *circuit = CircuitState::default();
        drop(circuit);
        self.alerts.alert(AlertLevel::Info, "서킷 브레이커 해제");
    }

    pub async fn circuit_reason(&self) -> Option<String> {
        self.circuit.read().await.reason.clone()
    }

    /// 혼잡도에 따른 슬리피지 허용치 (%)
    pub fn adjust_slippage_tolerance(&self, congestion: f64) -> f64 {
        slippage_for_congestion(congestion)
    }

    /// 0.0 ~ 1.0. TTL 동안 캐시, RPC 오류 시 0.5
    pub async fn get_network_congestion(&self) -> f64 {
        let ttl = Duration::from_secs(self.config.congestion_ttl_secs);
        let mut cache = self.congestion_cache.lock().await;
        if let Some(cached) = cache.as_ref() {
            if cached.at.elapsed() < ttl {
                return cached.value;
            }
        }

        let block = match self.chain.get_latest_block().await {
            Ok(block) => block,
            Err(e) => {
                warn!("⚠️ 혼잡도 계산 실패, 기본값 사용: {}", e);
                return FALLBACK_CONGESTION;
            }
        };

        let gas_ratio = block.gas_ratio().clamp(0.0, 1.0);
        let trend = {
            let mut history = self.gas_ratio_history.lock().await;
            if history.back().map(|(n, _)| *n) != Some(block.number) {
                history.push_back((block.number, gas_ratio));
            }
            while history.len() > self.config.congestion_history.max(2) {
                history.pop_front();
            }
            match (history.front(), history.back()) {
                (Some((_, first)), Some((_, last))) => (last - first).clamp(0.0, 1.0),
                _ => 0.0,
            }
        };
        let pending_factor = if self.max_gas_price_gwei > 0.0 {
            (wei_to_gwei(block.base_fee) / self.max_gas_price_gwei).min(1.0)
        } else {
            0.0
        };

        let congestion = (gas_ratio * 0.5 + pending_factor * 0.3 + trend * 0.2).clamp(0.0, 1.0);
        debug!("🌐 네트워크 혼잡도 {:.3} (gas {:.2}, fee {:.2}, trend {:.2})",
               congestion, gas_ratio, pending_factor, trend);

        *cache = Some(CachedValue {
            value: congestion,
            at: Instant::now(),
        });
        congestion
    }

    /// base + priority × (1 + 혼잡도) gwei, [최소, 상한]으로 제한. TTL 동안 캐시
    pub async fn get_dynamic_gas_price(&self) -> ChainResult<f64> {
        let ttl = Duration::from_secs(self.config.gas_price_ttl_secs);
        let mut cache = self.gas_price_cache.lock().await;
        if let Some(cached) = cache.as_ref() {
            if cached.at.elapsed() < ttl {
                return Ok(cached.value);
            }
        }

        let block = self.chain.get_latest_block().await?;
        let priority_gwei = match self.chain.max_priority_fee().await {
            Ok(fee) => wei_to_gwei(fee),
            Err(e) => {
                debug!("priority fee 조회 실패, 기본값 사용: {}", e);
                self.config.default_priority_fee_gwei
            }
        };
        let congestion = self.get_network_congestion().await;

        let raw = wei_to_gwei(block.base_fee) + priority_gwei * (1.0 + congestion);
        let price = raw.clamp(
            self.config.min_gas_price_gwei.min(self.max_gas_price_gwei),
            self.max_gas_price_gwei,
        );
        debug!("⛽ 동적 가스 가격 {:.2} gwei (raw {:.2})", price, raw);

        *cache = Some(CachedValue {
            value: price,
            at: Instant::now(),
        });
        Ok(price)
    }

    /// underpriced 거절 이후 다음 조회가 새 값을 가져오도록 캐시 폐기
    pub async fn invalidate_caches(&self) {
        self.gas_price_cache.lock().await.take();
        self.congestion_cache.lock().await.take();
        debug!("🧹 가스/혼잡도 캐시 폐기");
    }

    async fn token_price_eth(&self, token: Option<&str>) -> Option<f64> {
        match token.map(|t| t.to_uppercase()) {
            None => Some(1.0),
            Some(t) if t == "ETH" || t == "WETH" => Some(1.0),
            Some(t) => self
                .market
                .get_token_price_in(&t, "ETH")
                .await
                .and_then(|p| p.to_f64()),
        }
    }

    /// 가격을 알 수 없는 토큰이 있으면 None
    pub async fn calculate_profit(
        &self,
        inputs: &ProfitInputs,
        default_gas_used: u64,
        default_gas_price_gwei: Option<f64>,
    ) -> Option<ProfitBreakdown> {
        let price_in = self.token_price_eth(inputs.input_token.as_deref()).await?;
        let price_out = self.token_price_eth(inputs.output_token.as_deref()).await?;

        let gas_price_gwei = match inputs.gas_price_gwei.or(default_gas_price_gwei) {
            Some(price) => price,
            None => self.get_dynamic_gas_price().await.ok()?,
        };
        let gas_used = inputs.gas_used.unwrap_or(default_gas_used);

        let gross = inputs.amount_out * price_out - inputs.amount_in * price_in;
        let gas_cost = gas_used as f64 * gas_price_gwei * 1e-9;
        let slippage_pct = self.adjust_slippage_tolerance(self.get_network_congestion().await);
        let slippage_cost = gross.max(0.0) * slippage_pct / 100.0;

        Some(ProfitBreakdown {
            gross,
            gas_cost,
            slippage_cost,
            net: gross - gas_cost - slippage_cost,
        })
    }

    pub async fn ensure_profit(&self, inputs: &ProfitInputs) -> bool {
        match self.calculate_profit(inputs, DEFAULT_GAS_LIMIT, None).await {
            Some(breakdown) => {
                let ok = breakdown.net >= self.min_profit;
                if !ok {
                    debug!("💸 수익 부족: {:.6} ETH < {} ETH", breakdown.net, self.min_profit);
                }
                ok
            }
            None => {
                warn!("⚠️ 토큰 가격을 알 수 없어 수익 계산 불가");
                false
            }
        }
    }

    fn is_duplicate_source(&self, source: H256) -> bool {
        let ttl = Duration::from_secs(self.config.cache_ttl_secs);
        let now = Instant::now();
        self.evaluated_sources
            .retain(|_, seen| now.saturating_duration_since(*seen) < ttl);

        match self.evaluated_sources.entry(source) {
            dashmap::mapref::entry::Entry::Occupied(_) => true,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(now);
                false
            }
        }
    }

    /// 5개 검사를 모두 수행 (중간에 멈추지 않음)
    pub async fn check_transaction_safety(&self, candidate: &SafetyCandidate) -> SafetyCheckResult {
        let request = &candidate.request;
        let mut result = SafetyCheckResult::default();
        let max_fee_gwei = wei_to_gwei(request.max_fee);

        // 1. profit
        let breakdown = self
            .calculate_profit(&candidate.profit, request.gas_limit.low_u64(), Some(max_fee_gwei))
            .await;
        let profit_ok = breakdown
            .as_ref()
            .map(|b| b.net >= self.min_profit)
            .unwrap_or(false);
        result.record(
            "profit",
            profit_ok,
            json!({
                "net_eth": breakdown.as_ref().map(|b| b.net),
                "min_profit_eth": self.min_profit,
            }),
        );

        // 2. gas price
        result.record(
            "gas_price",
            max_fee_gwei <= self.max_gas_price_gwei,
            json!({ "gwei": max_fee_gwei, "max_gwei": self.max_gas_price_gwei }),
        );

        // 3. balance
        let required = request.value.saturating_add(request.max_gas_cost());
        match self.get_balance(request.from).await {
            Ok(balance) => result.record(
                "balance",
                balance >= required,
                json!({ "balance_eth": wei_to_eth(balance), "required_eth": wei_to_eth(required) }),
            ),
            Err(e) => result.record("balance", false, json!({ "error": e.to_string() })),
        }

        // 4. slippage / congestion
        let congestion = self.get_network_congestion().await;
        let tolerance = self.adjust_slippage_tolerance(congestion);
        result.record(
            "slippage",
            tolerance <= self.config.max_slippage_pct
                && congestion <= self.config.max_network_congestion,
            json!({ "tolerance_pct": tolerance, "congestion": congestion }),
        );

        // 5. duplicate
        let duplicate = candidate
            .source_tx
            .map(|h| self.is_duplicate_source(h))
            .unwrap_or(false);
        result.record(
            "duplicate",
            !duplicate,
            json!({ "source_tx": candidate.source_tx.map(|h| format!("{:?}", h)) }),
        );

        if !result.passed {
            warn!("🛡️ 안전성 검사 실패 {}/{}: {:?}",
                  result.checks_passed, result.checks_total, result.failed_checks());
        }
        result
    }

    pub async fn stop(&self) {
        self.evaluated_sources.clear();
        self.invalidate_caches().await;
        info!("🛡️ SafetyNet 종료");
    }
}

pub(crate) fn slippage_for_congestion(congestion: f64) -> f64 {
    let tolerance = SLIPPAGE_TIERS
        .iter()
        .find(|(upper, _)| congestion < *upper)
        .map(|(_, pct)| *pct)
        .unwrap_or(SLIPPAGE_HIGH_CONGESTION);
    tolerance.clamp(MIN_SLIPPAGE_PCT, MAX_SLIPPAGE_PCT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{MockChainClient, MockPriceFeed};
    use crate::monitoring::CollectingAlertSink;
    use crate::types::{gwei_to_wei, BlockInfo};

    struct Fixture {
        chain: Arc<MockChainClient>,
        alerts: Arc<CollectingAlertSink>,
        safety: SafetyNet,
    }

    fn fixture() -> Fixture {
        let config = Config::load_test_config();
        let chain = Arc::new(MockChainClient::new());
        let feed = Arc::new(MockPriceFeed::new());
        let market = Arc::new(MarketMonitor::new(&config, feed));
        let alerts = Arc::new(CollectingAlertSink::new());
        let safety = SafetyNet::new(&config, chain.clone(), market, alerts.clone());
        Fixture { chain, alerts, safety }
    }

    fn eth_inputs(amount_out: f64) -> ProfitInputs {
        ProfitInputs {
            amount_in: 0.0,
            amount_out,
            gas_used: Some(100_000),
            gas_price_gwei: Some(10.0),
            ..Default::default()
        }
    }

    fn request(from: Address, max_fee_gwei: f64) -> TransactionRequest {
        TransactionRequest {
            from,
            to: Address::random(),
            value: U256::zero(),
            data: Default::default(),
            gas_limit: U256::from(100_000u64),
            max_fee: gwei_to_wei(max_fee_gwei),
            priority_fee: gwei_to_wei(1.0),
            chain_id: 1337,
            nonce: U256::zero(),
        }
    }

    #[tokio::test]
    async fn test_ensure_profit_threshold() {
        let f = fixture();
        // 수익 1.0 ETH, 가스 0.001 ETH
        assert!(f.safety.ensure_profit(&eth_inputs(1.0)).await);
        // 수익 0.0015 - 가스 0.001 < 0.001
        assert!(!f.safety.ensure_profit(&eth_inputs(0.0015)).await);
    }

    #[tokio::test]
    async fn test_profit_breakdown_applies_slippage() {
        let f = fixture();
        let breakdown = f.safety.calculate_profit(&eth_inputs(1.0), 0, None).await.unwrap();
        assert!((breakdown.gas_cost - 0.001).abs() < 1e-12);
        // 혼잡도 0.27 → 슬리피지 0.1%
        assert!((breakdown.slippage_cost - 0.001).abs() < 1e-12);
        assert!((breakdown.net - 0.998).abs() < 1e-9);
    }

    #[test]
    fn test_slippage_tiers() {
        assert_eq!(slippage_for_congestion(0.0), 0.1);
        assert_eq!(slippage_for_congestion(0.29), 0.1);
        assert_eq!(slippage_for_congestion(0.3), 0.5);
        assert_eq!(slippage_for_congestion(0.7), 1.0);
        assert_eq!(slippage_for_congestion(0.95), 2.0);
    }

    #[tokio::test]
    async fn test_check_transaction_safety_passes_all() {
        let f = fixture();
        let from = Address::random();
        let candidate = SafetyCandidate {
            request: request(from, 20.0),
            profit: eth_inputs(0.5),
            source_tx: Some(H256::random()),
        };

        let result = f.safety.check_transaction_safety(&candidate).await;
        assert!(result.passed);
        assert_eq!(result.checks_total, 5);
        assert_eq!(result.checks_passed, 5);
    }

    #[tokio::test]
    async fn test_check_transaction_safety_runs_every_check() {
        let f = fixture();
        f.chain.set_balance(U256::zero()).await;
        let candidate = SafetyCandidate {
            request: request(Address::random(), 150.0),
            profit: eth_inputs(0.0),
            source_tx: None,
        };

        let result = f.safety.check_transaction_safety(&candidate).await;
        assert!(!result.passed);
        assert_eq!(result.checks_total, 5);
        assert_eq!(result.checks_passed, 2);
        assert_eq!(result.passed, result.checks_passed == result.checks_total);
        let failed = result.failed_checks();
        assert!(failed.contains(&"profit".to_string()));
        assert!(failed.contains(&"gas_price".to_string()));
        assert!(failed.contains(&"balance".to_string()));
    }

    #[tokio::test]
    async fn test_duplicate_source_rejected() {
        let f = fixture();
        let source = H256::random();
        let candidate = SafetyCandidate {
            request: request(Address::random(), 20.0),
            profit: eth_inputs(0.5),
            source_tx: Some(source),
        };

        assert!(f.safety.check_transaction_safety(&candidate).await.passed);
        let second = f.safety.check_transaction_safety(&candidate).await;
        assert!(!second.passed);
        assert_eq!(second.failed_checks(), vec!["duplicate".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gas_price_cached_until_invalidated() {
        let f = fixture();
        let first = f.safety.get_dynamic_gas_price().await.unwrap();
        // 15 + 1.5 × (1 + 0.27)
        assert!((first - 16.905).abs() < 1e-6);
        let requests = f.chain.block_requests();

        f.chain
            .set_block(BlockInfo {
                number: 18_000_001,
                base_fee: gwei_to_wei(40.0),
                gas_used: U256::from(15_000_000u64),
                gas_limit: U256::from(30_000_000u64),
            })
            .await;
        assert_eq!(f.safety.get_dynamic_gas_price().await.unwrap(), first);
        assert_eq!(f.chain.block_requests(), requests);

        f.safety.invalidate_caches().await;
        let refreshed = f.safety.get_dynamic_gas_price().await.unwrap();
        assert!(refreshed > first);

        tokio::time::advance(Duration::from_secs(11)).await;
        f.safety.get_dynamic_gas_price().await.unwrap();
        assert!(f.chain.block_requests() > requests + 1);
    }

    #[tokio::test]
    async fn test_gas_price_clamped_to_cap() {
        let f = fixture();
        f.chain
            .set_block(BlockInfo {
                number: 1,
                base_fee: gwei_to_wei(500.0),
                gas_used: U256::from(1u64),
                gas_limit: U256::from(2u64),
            })
            .await;
        assert_eq!(f.safety.get_dynamic_gas_price().await.unwrap(), 100.0);
    }

    #[tokio::test]
    async fn test_congestion_tracks_gas_trend() {
        let f = fixture();
        let base = f.safety.get_network_congestion().await;
        assert!((base - 0.27).abs() < 1e-9);

        f.chain
            .set_block(BlockInfo {
                number: 18_000_001,
                base_fee: gwei_to_wei(15.0),
                gas_used: U256::from(27_000_000u64),
                gas_limit: U256::from(30_000_000u64),
            })
            .await;
        f.safety.invalidate_caches().await;
        // 0.9×0.5 + 0.15×0.3 + 0.45×0.2
        let rising = f.safety.get_network_congestion().await;
        assert!((rising - 0.585).abs() < 1e-9);
        assert!((f.safety.adjust_slippage_tolerance(FALLBACK_CONGESTION) - 0.5).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_circuit_breaker_on_low_balance() {
        let f = fixture();
        let account = Address::random();
        assert!(f.safety.is_safe_to_proceed(account).await);

        f.chain.set_balance(eth_to_wei(0.001)).await;
        assert!(!f.safety.is_safe_to_proceed(account).await);
        assert!(f.safety.circuit_reason().await.is_some());
        assert_eq!(f.alerts.count(AlertLevel::Critical), 1);

        // 잔액이 회복돼도 해제 전까지 차단
        f.chain.set_balance(eth_to_wei(5.0)).await;
        assert!(!f.safety.is_safe_to_proceed(account).await);

        f.safety.reset_circuit().await;
        assert!(f.safety.is_safe_to_proceed(account).await);
        assert_eq!(f.alerts.count(AlertLevel::Info), 1);
    }
}
