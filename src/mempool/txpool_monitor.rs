use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use ethers::types::{Address, H256};
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::filters::{is_own_transaction, is_swap_call, references_monitored_token, TokenMatch};
use super::memory::MemoryProbe;
use crate::blockchain::ChainClient;
use crate::config::{BackoffPolicy, Config, TxpoolConfig};
use crate::constants::DEFAULT_VOLATILITY;
use crate::core::NonceCore;
use crate::monitoring::MarketMonitor;
use crate::safety::SafetyNet;
use crate::types::{
    wei_to_eth, ChainResult, ExecutorResult, Opportunity, OpportunityKind, PendingTx, ProfitInputs,
};

/// calldata로만 토큰을 참조하는 비스왑 트랜잭션의 가중치
const INDIRECT_PRICE_FACTOR: f64 = 0.5;

/// 처리한 해시 집합. 크기와 TTL로 제한
struct SeenCache {
    entries: HashMap<H256, Instant>,
    order: VecDeque<H256>,
    capacity: usize,
    ttl: Duration,
}

impl SeenCache {
    fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
            ttl,
        }
    }

    /// 처음 보는 해시면 true
    fn insert(&mut self, hash: H256, now: Instant) -> bool {
        self.expire(now);
        if self.entries.contains_key(&hash) {
            return false;
        }
        while self.entries.len() >= self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
        self.entries.insert(hash, now);
        self.order.push_back(hash);
        true
    }

    fn expire(&mut self, now: Instant) {
        while let Some(oldest) = self.order.front() {
            match self.entries.get(oldest) {
                Some(seen) if now.saturating_duration_since(*seen) < self.ttl => break,
                _ => {
                    if let Some(oldest) = self.order.pop_front() {
                        self.entries.remove(&oldest);
                    }
                }
            }
        }
    }

    fn shrink(&mut self, keep: usize) {
        while self.order.len() > keep {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[derive(Debug, Default)]
struct TxpoolCounters {
    received: AtomicU64,
    duplicates: AtomicU64,
    matched: AtomicU64,
    enqueued: AtomicU64,
    below_threshold: AtomicU64,
    own_transactions: AtomicU64,
    errors: AtomicU64,
    resubscribes: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TxpoolStats {
    pub received: u64,
    pub duplicates: u64,
    pub matched: u64,
    pub enqueued: u64,
    pub below_threshold: u64,
    pub own_transactions: u64,
    pub errors: u64,
    pub resubscribes: u64,
    pub seen_cache_size: usize,
    pub paused: bool,
}

/// 펜딩 트랜잭션 구독 → 필터 → 사전 점수 → 큐
pub struct TxpoolMonitor {
    chain: Arc<dyn ChainClient>,
    nonce_core: Arc<NonceCore>,
    market: Arc<MarketMonitor>,
    safety: Arc<SafetyNet>,
    probe: Arc<dyn MemoryProbe>,
    account: Address,
    tokens: HashSet<Address>,
    symbols: HashMap<Address, String>,
    config: TxpoolConfig,
    backoff: BackoffPolicy,
    connect_timeout: Duration,
    queue: mpsc::Sender<Opportunity>,
    seen: StdMutex<SeenCache>,
    paused: watch::Sender<bool>,
    running: AtomicBool,
    failed: AtomicBool,
    counters: TxpoolCounters,
    cancel: Mutex<Option<CancellationToken>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TxpoolMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &Config,
        chain: Arc<dyn ChainClient>,
        nonce_core: Arc<NonceCore>,
        market: Arc<MarketMonitor>,
        safety: Arc<SafetyNet>,
        probe: Arc<dyn MemoryProbe>,
        account: Address,
        queue: mpsc::Sender<Opportunity>,
    ) -> ExecutorResult<Self> {
        let tokens = config
            .monitored_token_addresses()
            .map_err(|e| crate::types::ExecutorError::Config(e.to_string()))?;
        let symbols = config
            .tokens
            .iter()
            .filter_map(|(symbol, address)| {
                address.parse::<Address>().ok().map(|a| (a, symbol.to_uppercase()))
            })
            .collect();

        info!("👀 TxpoolMonitor 초기화 (감시 토큰 {}개)", tokens.len());

        Ok(Self {
            chain,
            nonce_core,
            market,
            safety,
            probe,
            account,
            tokens,
            symbols,
            seen: StdMutex::new(SeenCache::new(
                config.txpool.processed_cache_size,
                Duration::from_secs(config.txpool.processed_cache_ttl_secs),
            )),
            config: config.txpool.clone(),
            backoff: config.connection_backoff(),
            connect_timeout: Duration::from_millis(config.connection.connect_timeout_ms),
            queue,
            paused: watch::channel(false).0,
            running: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            counters: TxpoolCounters::default(),
            cancel: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// 구독 루프와 메모리 감시 태스크 시작
    pub async fn start(self: &Arc<Self>, parent: &CancellationToken) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("⚠️ TxpoolMonitor 이미 실행 중");
            return;
        }
        self.failed.store(false, Ordering::SeqCst);

        let cancel = parent.child_token();
        *self.cancel.lock().await = Some(cancel.clone());

        let subscription = {
            let monitor = Arc::clone(self);
            let cancel = cancel.clone();
            tokio::spawn(async move { monitor.run_subscription(cancel).await })
        };
        let memory = {
            let monitor = Arc::clone(self);
            tokio::spawn(async move { monitor.run_memory_monitor(cancel).await })
        };

        self.tasks.lock().await.extend([subscription, memory]);
        info!("🚀 TxpoolMonitor 시작");
    }

    pub async fn stop(&self) {
        if let Some(cancel) = self.cancel.lock().await.take() {
            cancel.cancel();
        }
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    error!("❌ TxpoolMonitor 태스크 종료 오류: {}", e);
                }
            }
        }
        self.running.store(false, Ordering::SeqCst);
        info!("🛑 TxpoolMonitor 중지");
    }

    async fn run_subscription(self: Arc<Self>, cancel: CancellationToken) {
        let mut failures = 0u32;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let subscribed = tokio::select! {
                _ = cancel.cancelled() => break,
                result = tokio::time::timeout(self.connect_timeout, self.chain.subscribe_pending_transactions()) => result,
            };

            match subscribed {
                Ok(Ok(mut receiver)) => {
                    failures = 0;
                    info!("📡 펜딩 트랜잭션 구독 연결");
                    self.consume(&mut receiver, &cancel).await;
                    if cancel.is_cancelled() {
                        break;
                    }
                    self.counters.resubscribes.fetch_add(1, Ordering::Relaxed);
                    warn!("⚠️ 펜딩 트랜잭션 스트림 종료, 재구독");
                }
                Ok(Err(e)) => {
                    failures += 1;
                    warn!("⚠️ 구독 실패 ({}/{}): {}", failures, self.backoff.attempts, e);
                }
                Err(_) => {
                    failures += 1;
                    warn!("⚠️ 구독 타임아웃 ({}/{})", failures, self.backoff.attempts);
                }
            }

            if failures >= self.backoff.attempts.max(1) {
                error!("❌ 구독 재시도 한도 초과, TxpoolMonitor 중단");
                self.failed.store(true, Ordering::SeqCst);
                break;
            }

            let delay = self.backoff.delay_for(failures.max(1));
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.running.store(false, Ordering::SeqCst);
    }

    async fn consume(&self, receiver: &mut mpsc::Receiver<Vec<PendingTx>>, cancel: &CancellationToken) {
        let mut paused = self.paused.subscribe();
        loop {
            if *paused.borrow_and_update() {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    changed = paused.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
                continue;
            }

            // 대기 중 일시정지되면 배치를 받기 전에 깨어난다
            let batch = tokio::select! {
                _ = cancel.cancelled() => return,
                changed = paused.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    continue;
                }
                batch = receiver.recv() => batch,
            };
            let Some(batch) = batch else {
                return;
            };

            debug!("📥 펜딩 트랜잭션 {}건 수신", batch.len());
            for tx in batch {
                let hash = tx.hash;
                match self.process_pending(tx).await {
                    Ok(Some(opportunity)) => {
                        let sent = tokio::select! {
                            _ = cancel.cancelled() => return,
                            sent = self.queue.send(opportunity) => sent,
                        };
                        match sent {
                            Ok(()) => {
                                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(_) => {
                                warn!("⚠️ 기회 큐가 닫힘, 구독 처리 중단");
                                return;
                            }
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        self.counters.errors.fetch_add(1, Ordering::Relaxed);
                        warn!("⚠️ 트랜잭션 처리 실패 {:?}: {}", hash, e);
                    }
                }
            }
        }
    }

    fn mark_seen(&self, hash: H256) -> bool {
        match self.seen.lock() {
            Ok(mut seen) => seen.insert(hash, Instant::now()),
            Err(_) => true,
        }
    }

    /// 단일 트랜잭션 처리. 큐에 넣을 기회가 있으면 반환
    pub async fn process_pending(&self, tx: PendingTx) -> ChainResult<Option<Opportunity>> {
        self.counters.received.fetch_add(1, Ordering::Relaxed);

        if !self.mark_seen(tx.hash) {
            self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        if is_own_transaction(&tx, self.account) {
            self.counters.own_transactions.fetch_add(1, Ordering::Relaxed);
            self.nonce_core
                .observe_external(self.account, tx.nonce.low_u64())
                .await?;
            return Ok(None);
        }

        let Some(token_match) = references_monitored_token(&tx, &self.tokens) else {
            return Ok(None);
        };
        self.counters.matched.fetch_add(1, Ordering::Relaxed);

        if tx.value.is_zero() || wei_to_eth(tx.value) < self.config.min_tx_value_eth {
            self.counters.below_threshold.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        let score = self.pre_score(&tx, token_match).await;
        if score <= 0.0 {
            self.counters.below_threshold.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        // 최소 수익 미달 후보는 큐에 넣지 않는다
        let expected = ProfitInputs {
            amount_out: score,
            ..ProfitInputs::default()
        };
        if !self.safety.ensure_profit(&expected).await {
            self.counters.below_threshold.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        debug!("🎯 후보 발견 {:?} (점수 {:.6} ETH)", tx.hash, score);
        Ok(Some(Opportunity::new(
            OpportunityKind::PendingTx,
            token_match.token(),
            score,
            tx,
        )))
    }

    /// value × 변동성 × 가격 가중치 − 가스 비용 (ETH)
    async fn pre_score(&self, tx: &PendingTx, token_match: TokenMatch) -> f64 {
        let token = token_match.token();
        let symbol = self
            .symbols
            .get(&token)
            .cloned()
            .unwrap_or_else(|| format!("{:?}", token));
        let volatility = self
            .market
            .get_market_features(&symbol)
            .await
            .map(|f| f.volatility)
            .unwrap_or(DEFAULT_VOLATILITY);

        let price_factor = match token_match {
            TokenMatch::Direct(_) => 1.0,
            TokenMatch::Calldata(_) if is_swap_call(&tx.input) => 1.0,
            TokenMatch::Calldata(_) => INDIRECT_PRICE_FACTOR,
        };
        let gas_cost = wei_to_eth(tx.gas.saturating_mul(tx.effective_gas_price()));

        wei_to_eth(tx.value) * volatility * price_factor - gas_cost
    }

    async fn run_memory_monitor(self: Arc<Self>, cancel: CancellationToken) {
        let period = Duration::from_secs(self.config.memory_check_interval_secs.max(1));
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => self.check_memory(),
            }
        }
    }

    /// 메모리 사용량이 임계값을 넘으면 구독 처리를 멈춘다
    pub fn check_memory(&self) {
        let Some(used_mb) = self.probe.used_memory_mb() else {
            return;
        };
        let over = used_mb > self.config.memory_threshold_mb;

        let mut was_paused = false;
        self.paused.send_if_modified(|paused| {
            was_paused = *paused;
            let changed = *paused != over;
            *paused = over;
            changed
        });

        if over && !was_paused {
            warn!("🧠 메모리 사용량 {}MB > {}MB, 구독 처리 일시정지", used_mb, self.config.memory_threshold_mb);
            if let Ok(mut seen) = self.seen.lock() {
                let keep = seen.len() / 2;
                seen.shrink(keep);
            }
        } else if !over && was_paused {
            info!("🧠 메모리 사용량 {}MB, 구독 처리 재개", used_mb);
        }
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// 구독 재시도 한도를 넘겨 중단된 상태
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> TxpoolStats {
        let c = &self.counters;
        TxpoolStats {
            received: c.received.load(Ordering::Relaxed),
            duplicates: c.duplicates.load(Ordering::Relaxed),
            matched: c.matched.load(Ordering::Relaxed),
            enqueued: c.enqueued.load(Ordering::Relaxed),
            below_threshold: c.below_threshold.load(Ordering::Relaxed),
            own_transactions: c.own_transactions.load(Ordering::Relaxed),
            errors: c.errors.load(Ordering::Relaxed),
            resubscribes: c.resubscribes.load(Ordering::Relaxed),
            seen_cache_size: self.seen.lock().map(|s| s.len()).unwrap_or(0),
            paused: self.is_paused(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mempool::FixedMemoryProbe;
    use crate::mocks::{MockChainClient, MockPriceFeed};
    use crate::monitoring::TracingAlertSink;
    use crate::types::{eth_to_wei, gwei_to_wei};
    use ethers::types::{Bytes, U256};

    struct Fixture {
        chain: Arc<MockChainClient>,
        nonce_core: Arc<NonceCore>,
        probe: Arc<FixedMemoryProbe>,
        monitor: Arc<TxpoolMonitor>,
        queue: mpsc::Receiver<Opportunity>,
        account: Address,
        weth: Address,
    }

    fn fixture() -> Fixture {
        fixture_with(|_| {})
    }

    fn fixture_with(customize: impl FnOnce(&mut Config)) -> Fixture {
        let mut config = Config::load_test_config();
        config.txpool.memory_check_interval_secs = 1;
        config.txpool.memory_threshold_mb = 1_000;
        customize(&mut config);

        let chain = Arc::new(MockChainClient::new());
        let nonce_core = Arc::new(NonceCore::new(chain.clone()));
        let market = Arc::new(MarketMonitor::new(&config, Arc::new(MockPriceFeed::with_defaults())));
        let safety = Arc::new(SafetyNet::new(&config, chain.clone(), market.clone(), Arc::new(TracingAlertSink)));
        let probe = Arc::new(FixedMemoryProbe::new(100));
        let account = Address::random();
        let (sender, queue) = mpsc::channel(16);

        let monitor = TxpoolMonitor::new(
            &config,
            chain.clone(),
            nonce_core.clone(),
            market,
            safety,
            probe.clone(),
            account,
            sender,
        )
        .unwrap();

        Fixture {
            chain,
            nonce_core,
            probe,
            monitor: Arc::new(monitor),
            queue,
            account,
            weth: crate::constants::WETH.parse().unwrap(),
        }
    }

    fn pending_to(to: Address, value_eth: f64) -> PendingTx {
        PendingTx {
            hash: H256::random(),
            from: Address::random(),
            to: Some(to),
            value: eth_to_wei(value_eth),
            gas_price: Some(gwei_to_wei(20.0)),
            max_fee_per_gas: None,
            gas: U256::from(100_000u64),
            input: Bytes::default(),
            nonce: U256::zero(),
        }
    }

    async fn recv(queue: &mut mpsc::Receiver<Opportunity>) -> Option<Opportunity> {
        tokio::time::timeout(Duration::from_secs(2), queue.recv()).await.ok().flatten()
    }

    #[tokio::test]
    async fn test_filters_and_scores() {
        let f = fixture();

        // 10 ETH × 변동성 0.075 − 가스 0.002 > 0
        let hit = f.monitor.process_pending(pending_to(f.weth, 10.0)).await.unwrap();
        let opportunity = hit.unwrap();
        assert_eq!(opportunity.token, f.weth);
        assert!(opportunity.projected_profit > 0.7);

        let unrelated = f.monitor.process_pending(pending_to(Address::random(), 10.0)).await.unwrap();
        assert!(unrelated.is_none());

        // 가스 비용이 기대 효과보다 큼
        let dust = f.monitor.process_pending(pending_to(f.weth, 0.001)).await.unwrap();
        assert!(dust.is_none());

        let stats = f.monitor.stats();
        assert_eq!(stats.received, 3);
        assert_eq!(stats.matched, 2);
        assert_eq!(stats.below_threshold, 1);
    }

    #[tokio::test]
    async fn test_candidates_below_min_profit_not_enqueued() {
        let f = fixture_with(|config| config.execution.min_profit = 0.01);

        // 0.1 ETH × 변동성 0.075 − 가스 0.002 = 0.0055 > 0 이지만 최소 수익 0.01 미달
        let small = f.monitor.process_pending(pending_to(f.weth, 0.1)).await.unwrap();
        assert!(small.is_none());

        let large = f.monitor.process_pending(pending_to(f.weth, 10.0)).await.unwrap();
        assert!(large.is_some());

        let stats = f.monitor.stats();
        assert_eq!(stats.matched, 2);
        assert_eq!(stats.below_threshold, 1);
    }

    #[tokio::test]
    async fn test_zero_value_skipped_before_scoring() {
        let f = fixture();
        let mut swap = pending_to(f.weth, 0.0);
        swap.gas_price = Some(U256::zero());
        swap.gas = U256::zero();

        assert!(f.monitor.process_pending(swap).await.unwrap().is_none());
        assert_eq!(f.monitor.stats().below_threshold, 1);
    }

    #[tokio::test]
    async fn test_duplicate_hashes_skipped() {
        let f = fixture();
        let tx = pending_to(f.weth, 10.0);

        assert!(f.monitor.process_pending(tx.clone()).await.unwrap().is_some());
        assert!(f.monitor.process_pending(tx).await.unwrap().is_none());
        assert_eq!(f.monitor.stats().duplicates, 1);
    }

    #[test]
    fn test_seen_cache_bounded_and_expiring() {
        let start = Instant::now();
        let mut cache = SeenCache::new(2, Duration::from_secs(10));
        let (a, b, c) = (H256::random(), H256::random(), H256::random());

        assert!(cache.insert(a, start));
        assert!(cache.insert(b, start));
        assert!(cache.insert(c, start));
        assert_eq!(cache.len(), 2);
        // 가장 오래된 a가 밀려남
        assert!(cache.insert(a, start));

        let later = start + Duration::from_secs(11);
        assert!(cache.insert(b, later));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_subscription_enqueues_and_isolates_errors() {
        let mut f = fixture();
        f.nonce_core.initialize(f.account).await.unwrap();
        let cancel = CancellationToken::new();
        f.monitor.start(&cancel).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        f.chain.fail_next_nonce_queries(1);
        let mut own = pending_to(Address::random(), 0.0);
        own.from = f.account;
        own.nonce = U256::from(5u64);
        let good = pending_to(f.weth, 10.0);
        let good_hash = good.hash;

        assert!(f.chain.push_pending(vec![own, good]).await);
        let opportunity = recv(&mut f.queue).await.unwrap();
        assert_eq!(opportunity.source_tx.hash, good_hash);
        assert_eq!(f.monitor.stats().errors, 1);

        f.monitor.stop().await;
        assert!(!f.monitor.is_running());
    }

    #[tokio::test]
    async fn test_own_transaction_triggers_resync() {
        let f = fixture();
        f.nonce_core.initialize(f.account).await.unwrap();
        f.chain.set_nonces(3, 4);

        let mut own = pending_to(Address::random(), 0.0);
        own.from = f.account;
        own.nonce = U256::from(3u64);
        assert!(f.monitor.process_pending(own).await.unwrap().is_none());

        let state = f.nonce_core.state(f.account).await.unwrap();
        assert_eq!(state.next, 4);
        assert_eq!(f.monitor.stats().own_transactions, 1);
    }

    #[tokio::test]
    async fn test_resubscribes_after_stream_ends() {
        let mut f = fixture();
        let cancel = CancellationToken::new();
        f.monitor.start(&cancel).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.chain.subscribe_calls(), 1);

        f.chain.fail_next_subscriptions(1);
        f.chain.drop_subscription().await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(f.chain.subscribe_calls(), 3);

        assert!(f.chain.push_pending(vec![pending_to(f.weth, 10.0)]).await);
        assert!(recv(&mut f.queue).await.is_some());
        assert_eq!(f.monitor.stats().resubscribes, 1);

        cancel.cancel();
        f.monitor.stop().await;
    }

    #[tokio::test]
    async fn test_subscription_gives_up_after_retry_budget() {
        let f = fixture();
        f.chain.fail_next_subscriptions(10);
        let cancel = CancellationToken::new();
        f.monitor.start(&cancel).await;

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(f.monitor.has_failed());
        assert!(!f.monitor.is_running());
        assert_eq!(f.chain.subscribe_calls(), 3);
        f.monitor.stop().await;
    }

    #[tokio::test]
    async fn test_memory_pressure_pauses_processing() {
        let mut f = fixture();
        let cancel = CancellationToken::new();
        f.monitor.start(&cancel).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        f.probe.set(4_096);
        f.monitor.check_memory();
        assert!(f.monitor.is_paused());

        f.chain.push_pending(vec![pending_to(f.weth, 10.0)]).await;
        assert!(tokio::time::timeout(Duration::from_millis(300), f.queue.recv()).await.is_err());

        f.probe.set(100);
        f.monitor.check_memory();
        assert!(!f.monitor.is_paused());
        assert!(recv(&mut f.queue).await.is_some());

        f.monitor.stop().await;
    }
}
