use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use dashmap::DashMap;
use ethers::types::{Address, U256};
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex, RwLock, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::nonce_core::NonceCore;
use super::transaction_core::TransactionCore;
use crate::blockchain::{ChainClient, ChainConnector, TxSigner};
use crate::config::Config;
use crate::mempool::{MemoryProbe, SysinfoProbe, TxpoolMonitor, TxpoolStats};
use crate::monitoring::{AlertLevel, AlertSink, ExecutionStats, ExecutionStatsSnapshot, MarketMonitor, TracingAlertSink};
use crate::oracle::PriceFeed;
use crate::safety::SafetyNet;
use crate::storage::{self, TransactionStore};
use crate::types::{ChainError, ExecutorError, ExecutorResult, Opportunity, TxIntent, ProfitInputs};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LifecycleState {
    Disconnected,
    Connecting,
    Bootstrapped,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            LifecycleState::Disconnected => "disconnected",
            LifecycleState::Connecting => "connecting",
            LifecycleState::Bootstrapped => "bootstrapped",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Stopped => "stopped",
        };
        write!(f, "{}", name)
    }
}

/// 큐에서 꺼낸 기회를 실행 의도로 바꾼다. None이면 건너뜀
pub trait OpportunityPlanner: Send + Sync {
    fn plan(&self, opportunity: &Opportunity) -> Option<TxIntent>;
}

/// 원본 트랜잭션과 같은 대상/calldata로 0 ETH 호출을 만든다
pub struct MirrorPlanner {
    min_profit: f64,
}

impl MirrorPlanner {
    pub fn new(min_profit: f64) -> Self {
        Self { min_profit }
    }
}

impl OpportunityPlanner for MirrorPlanner {
    fn plan(&self, opportunity: &Opportunity) -> Option<TxIntent> {
        if opportunity.projected_profit < self.min_profit {
            debug!("기회 {} 예상 수익 부족 ({:.6} ETH)", opportunity.id, opportunity.projected_profit);
            return None;
        }
        let source = &opportunity.source_tx;
        Some(TxIntent {
            to: source.to.unwrap_or(opportunity.token),
            value: U256::zero(),
            data: source.input.clone(),
            gas_limit: None,
            profit: ProfitInputs {
                amount_out: opportunity.projected_profit,
                ..Default::default()
            },
            source_tx: Some(source.hash),
            opportunity_id: Some(opportunity.id.clone()),
        })
    }
}

/// 부트스트랩이 끝난 컴포넌트 묶음
struct Components {
    chain: Arc<dyn ChainClient>,
    nonce_core: Arc<NonceCore>,
    market: Arc<MarketMonitor>,
    safety: Arc<SafetyNet>,
    txpool: Arc<TxpoolMonitor>,
    tx_core: Arc<TransactionCore>,
    queue: mpsc::Sender<Opportunity>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NonceSnapshot {
    pub confirmed: u64,
    pub next: u64,
    pub in_flight: usize,
    pub released: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct MainCoreStatus {
    pub state: LifecycleState,
    pub account: String,
    pub uptime_secs: u64,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub nonce: Option<NonceSnapshot>,
    pub circuit_open: Option<String>,
    pub stats: ExecutionStatsSnapshot,
    pub txpool: Option<TxpoolStats>,
    pub component_health: BTreeMap<String, bool>,
}

/// 연결 → 부트스트랩 → 백그라운드 태스크 실행 → 정리
pub struct MainCore {
    config: Config,
    connector: Arc<dyn ChainConnector>,
    signer: Arc<dyn TxSigner>,
    feed: Arc<dyn PriceFeed>,
    probe: Arc<dyn MemoryProbe>,
    store: Arc<dyn TransactionStore>,
    alerts: Arc<dyn AlertSink>,
    planner: Arc<dyn OpportunityPlanner>,
    stats: Arc<ExecutionStats>,
    state: watch::Sender<LifecycleState>,
    components: RwLock<Option<Arc<Components>>>,
    queue_rx: Mutex<Option<mpsc::Receiver<Opportunity>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    health: Arc<DashMap<&'static str, bool>>,
    started_at: StdMutex<Option<Instant>>,
    cancel: CancellationToken,
}

impl MainCore {
    pub fn new(
        config: Config,
        connector: Arc<dyn ChainConnector>,
        signer: Arc<dyn TxSigner>,
        feed: Arc<dyn PriceFeed>,
    ) -> Self {
        let store = storage::from_config(&config.storage);
        let planner = Arc::new(MirrorPlanner::new(config.execution.min_profit));
        Self {
            connector,
            signer,
            feed,
            probe: Arc::new(SysinfoProbe::new()),
            store,
            alerts: Arc::new(TracingAlertSink),
            planner,
            stats: Arc::new(ExecutionStats::new()),
            state: watch::channel(LifecycleState::Disconnected).0,
            components: RwLock::new(None),
            queue_rx: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            health: Arc::new(DashMap::new()),
            started_at: StdMutex::new(None),
            cancel: CancellationToken::new(),
            config,
        }
    }

    pub fn with_memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn TransactionStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_alert_sink(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = alerts;
        self
    }

    pub fn with_planner(mut self, planner: Arc<dyn OpportunityPlanner>) -> Self {
        self.planner = planner;
        self
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// 이 토큰을 취소하면 run()이 정리 후 반환
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn stats(&self) -> Arc<ExecutionStats> {
        self.stats.clone()
    }

    pub fn account(&self) -> Address {
        self.signer.address()
    }

    fn set_state(&self, next: LifecycleState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!("🔁 상태 전이: {} -> {}", previous, next);
        }
    }

    async fn components(&self) -> ExecutorResult<Arc<Components>> {
        self.components
            .read()
            .await
            .clone()
            .ok_or_else(|| ExecutorError::Lifecycle(format!("컴포넌트 없음 (상태 {})", self.state())))
    }

    /// 지수 백오프로 체인 연결
    async fn connect(&self) -> ExecutorResult<Arc<dyn ChainClient>> {
        self.set_state(LifecycleState::Connecting);
        let backoff = self.config.connection_backoff();
        let timeout = Duration::from_millis(self.config.connection.connect_timeout_ms);
        let endpoint = self.connector.endpoint();
        let mut last_error = ChainError::Connectivity("no attempt".to_string());

        for attempt in 1..=backoff.attempts {
            if self.cancel.is_cancelled() {
                break;
            }
            info!("🔌 체인 연결 시도 {}/{}: {}", attempt, backoff.attempts, endpoint);
            match tokio::time::timeout(timeout, self.connector.connect()).await {
                Ok(Ok(client)) => {
                    info!("✅ 체인 연결 성공: {}", endpoint);
                    return Ok(client);
                }
                Ok(Err(e)) => last_error = e,
                Err(_) => last_error = ChainError::Timeout,
            }
            warn!("⚠️ 체인 연결 실패 ({}/{}): {}", attempt, backoff.attempts, last_error);

            if attempt < backoff.attempts {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(backoff.delay_for(attempt)) => {}
                }
            }
        }

        self.set_state(LifecycleState::Disconnected);
        Err(ExecutorError::Bootstrap(format!("{} 연결 실패: {}", endpoint, last_error)))
    }

    /// NonceCore → MarketMonitor → SafetyNet → TxpoolMonitor → TransactionCore
    pub async fn bootstrap(&self) -> ExecutorResult<()> {
        let state = self.state();
        if state != LifecycleState::Disconnected {
            return Err(ExecutorError::Lifecycle(format!("{} 상태에서 부트스트랩 불가", state)));
        }

        let chain = self.connect().await?;
        match self.build_components(chain).await {
            Ok(components) => {
                *self.components.write().await = Some(Arc::new(components));
                self.set_state(LifecycleState::Bootstrapped);
                info!("✅ 부트스트랩 완료");
                Ok(())
            }
            Err(e) => {
                error!("❌ 부트스트랩 실패: {}", e);
                self.set_state(LifecycleState::Disconnected);
                Err(e)
            }
        }
    }

    async fn build_components(&self, chain: Arc<dyn ChainClient>) -> ExecutorResult<Components> {
        let bootstrap_err = |stage: &str, e: &dyn fmt::Display| ExecutorError::Bootstrap(format!("{}: {}", stage, e));

        let chain_id = chain.chain_id().await.map_err(|e| bootstrap_err("chain id", &e))?;
        if chain_id != self.config.network.chain_id {
            warn!("⚠️ 체인 ID 불일치: 설정 {} / 노드 {}", self.config.network.chain_id, chain_id);
        }
        let account = self.signer.address();

        let nonce_core = Arc::new(NonceCore::new(chain.clone()));
        nonce_core
            .initialize(account)
            .await
            .map_err(|e| bootstrap_err("nonce", &e))?;

        let market = Arc::new(MarketMonitor::new(&self.config, self.feed.clone()));

        let safety = Arc::new(SafetyNet::new(
            &self.config,
            chain.clone(),
            market.clone(),
            self.alerts.clone(),
        ));
        match safety.get_balance(account).await {
            Ok(balance) => info!("💰 계정 {:?} 잔고 {:.4} ETH", account, crate::types::wei_to_eth(balance)),
            Err(e) => warn!("⚠️ 잔고 조회 실패: {}", e),
        }

        let (queue, queue_rx) = mpsc::channel(self.config.txpool.queue_capacity);
        let txpool = Arc::new(TxpoolMonitor::new(
            &self.config,
            chain.clone(),
            nonce_core.clone(),
            market.clone(),
            safety.clone(),
            self.probe.clone(),
            account,
            queue.clone(),
        )?);

        let tx_core = Arc::new(TransactionCore::new(
            &self.config,
            chain_id,
            chain.clone(),
            self.signer.clone(),
            nonce_core.clone(),
            safety.clone(),
            self.store.clone(),
            self.stats.clone(),
            self.cancel.child_token(),
        ));

        *self.queue_rx.lock().await = Some(queue_rx);
        Ok(Components {
            chain,
            nonce_core,
            market,
            safety,
            txpool,
            tx_core,
            queue,
        })
    }

    /// 백그라운드 태스크를 띄우고 Running으로 전이
    pub async fn start(&self) -> ExecutorResult<()> {
        if self.state() == LifecycleState::Disconnected {
            self.bootstrap().await?;
        }
        let state = self.state();
        if state != LifecycleState::Bootstrapped {
            return Err(ExecutorError::Lifecycle(format!("{} 상태에서 시작 불가", state)));
        }

        let components = self.components().await?;
        let queue_rx = self
            .queue_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| ExecutorError::Lifecycle("기회 큐 수신기 없음".to_string()))?;

        components.txpool.start(&self.cancel).await;

        let executor = tokio::spawn(run_executor(
            queue_rx,
            self.planner.clone(),
            components.tx_core.clone(),
            self.stats.clone(),
            self.config.execution.max_parallel_tasks,
            self.cancel.clone(),
        ));
        let health = tokio::spawn(run_health_check(
            components.clone(),
            self.config.clone(),
            self.signer.address(),
            self.stats.clone(),
            self.health.clone(),
            self.alerts.clone(),
            self.cancel.clone(),
        ));
        let prewarm = tokio::spawn(run_market_prewarm(
            components.market.clone(),
            self.config.monitored_tokens.clone(),
            Duration::from_secs(self.config.market.update_interval_secs.max(1)),
            self.cancel.clone(),
        ));
        self.tasks.lock().await.extend([executor, health, prewarm]);

        if let Ok(mut started_at) = self.started_at.lock() {
            *started_at = Some(Instant::now());
        }
        self.set_state(LifecycleState::Running);
        info!("🚀 MainCore 실행 중 (계정 {:?})", self.signer.address());
        Ok(())
    }

    /// 시작 후 취소 토큰이 발동할 때까지 대기하고 정리
    pub async fn run(&self) -> ExecutorResult<()> {
        if let Err(e) = self.start().await {
            self.stop().await;
            return Err(e);
        }
        self.cancel.cancelled().await;
        info!("🛑 종료 신호 수신");
        self.stop().await;
        Ok(())
    }

    /// 여러 번 호출해도 안전
    pub async fn stop(&self) {
        let state = self.state();
        if matches!(state, LifecycleState::Stopping | LifecycleState::Stopped) {
            return;
        }
        self.set_state(LifecycleState::Stopping);
        info!("🛑 MainCore 중지 중...");
        self.cancel.cancel();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        let aborts: Vec<_> = tasks.iter().map(|t| t.abort_handle()).collect();
        let shutdown = Duration::from_secs(self.config.connection.shutdown_timeout_secs);
        if tokio::time::timeout(shutdown, futures::future::join_all(tasks)).await.is_err() {
            warn!("⚠️ 종료 제한 시간 {:?} 초과, 남은 태스크 중단", shutdown);
            for abort in aborts {
                abort.abort();
            }
        }

        if let Some(components) = self.components.write().await.take() {
            components.txpool.stop().await;
            components.tx_core.stop().await;
            components.safety.stop().await;
            components.market.close();
        }
        self.queue_rx.lock().await.take();

        self.set_state(LifecycleState::Stopped);
        let stats = self.stats.snapshot();
        info!(
            "✅ MainCore 중지됨 (제출 {}, 포기 {}, 포함 {})",
            stats.submitted, stats.abandoned, stats.confirmed
        );
    }

    pub async fn status(&self) -> MainCoreStatus {
        let components = self.components.read().await.clone();
        let account = self.signer.address();
        let uptime_secs = self
            .started_at
            .lock()
            .ok()
            .and_then(|s| *s)
            .map(|s| s.elapsed().as_secs())
            .unwrap_or(0);

        let mut status = MainCoreStatus {
            state: self.state(),
            account: format!("{:?}", account),
            uptime_secs,
            queue_depth: 0,
            queue_capacity: self.config.txpool.queue_capacity,
            nonce: None,
            circuit_open: None,
            stats: self.stats.snapshot(),
            txpool: None,
            component_health: self
                .health
                .iter()
                .map(|e| (e.key().to_string(), *e.value()))
                .collect(),
        };

        if let Some(c) = components {
            status.queue_depth = c.queue.max_capacity() - c.queue.capacity();
            status.nonce = c.nonce_core.state(account).await.map(|s| NonceSnapshot {
                confirmed: s.confirmed,
                next: s.next,
                in_flight: s.in_flight.len(),
                released: s.released.len(),
            });
            status.circuit_open = c.safety.circuit_reason().await;
            status.txpool = Some(c.txpool.stats());
        }
        status
    }
}

/// 큐 → planner → TransactionCore. 동시 실행은 세마포어로 제한
async fn run_executor(
    mut queue: mpsc::Receiver<Opportunity>,
    planner: Arc<dyn OpportunityPlanner>,
    tx_core: Arc<TransactionCore>,
    stats: Arc<ExecutionStats>,
    max_parallel: usize,
    cancel: CancellationToken,
) {
    let permits = Arc::new(Semaphore::new(max_parallel.max(1)));
    let mut inflight = JoinSet::new();
    info!("⚙️ 실행기 시작 (동시 실행 {})", max_parallel);

    loop {
        let opportunity = tokio::select! {
            _ = cancel.cancelled() => break,
            next = queue.recv() => match next {
                Some(opportunity) => opportunity,
                None => break,
            },
        };
        stats.record_opportunity();

        let Some(intent) = planner.plan(&opportunity) else {
            continue;
        };

        let permit = tokio::select! {
            _ = cancel.cancelled() => break,
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let core = tx_core.clone();
        inflight.spawn(async move {
            let _permit = permit;
            core.execute_intent(intent).await;
        });
        while inflight.try_join_next().is_some() {}
    }

    // 진행 중인 실행은 취소 토큰을 보고 스스로 정리된다
    while inflight.join_next().await.is_some() {}
    info!("⚙️ 실행기 종료");
}

/// 체인 도달성 점검, 주기적 nonce 재동기화, 상태 로그
async fn run_health_check(
    components: Arc<Components>,
    config: Config,
    account: Address,
    stats: Arc<ExecutionStats>,
    health: Arc<DashMap<&'static str, bool>>,
    alerts: Arc<dyn AlertSink>,
    cancel: CancellationToken,
) {
    let probe_timeout = Duration::from_millis(config.connection.connect_timeout_ms);
    let mut health_tick = tokio::time::interval(Duration::from_secs(config.connection.health_check_interval_secs.max(1)));
    let mut resync_tick = tokio::time::interval(Duration::from_secs(config.connection.nonce_resync_interval_secs.max(1)));
    let mut status_tick = tokio::time::interval(Duration::from_secs(config.monitoring.status_interval_secs.max(1)));
    // 첫 tick은 즉시 발생하므로 재동기화/상태 로그는 한 주기 뒤부터
    resync_tick.tick().await;
    status_tick.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = health_tick.tick() => {
                let reachable = tokio::time::timeout(probe_timeout, components.chain.is_connected())
                    .await
                    .unwrap_or(false);
                if !reachable {
                    warn!("⚠️ 체인 엔드포인트 응답 없음");
                }
                health.insert("chain", reachable);

                let txpool_ok = components.txpool.is_running() && !components.txpool.has_failed();
                health.insert("txpool", txpool_ok);
                health.insert("safety", components.safety.circuit_reason().await.is_none());

                if components.txpool.has_failed() {
                    error!("❌ 펜딩 트랜잭션 구독 복구 실패, 종료 시작");
                    alerts.alert(AlertLevel::Critical, "txpool subscription failed permanently");
                    cancel.cancel();
                    break;
                }
            }
            _ = resync_tick.tick() => {
                if let Err(e) = components.nonce_core.resync(account).await {
                    warn!("⚠️ 주기적 nonce 재동기화 실패: {}", e);
                }
            }
            _ = status_tick.tick() => {
                let snapshot = stats.snapshot();
                let txpool = components.txpool.stats();
                info!(
                    "📊 상태: 수신 {} / 큐 {} / 제출 {} / 포기 {} (안전성 {}) / 포함 {} / 성공률 {:.1}%",
                    txpool.received,
                    txpool.enqueued,
                    snapshot.submitted,
                    snapshot.abandoned,
                    snapshot.safety_rejections,
                    snapshot.confirmed,
                    snapshot.success_rate() * 100.0
                );
            }
        }
    }
}

async fn run_market_prewarm(
    market: Arc<MarketMonitor>,
    tokens: Vec<String>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut tick = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                let warmed = market.prewarm(&tokens).await;
                debug!("📈 시세 예열 {}/{}", warmed, tokens.len());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mempool::FixedMemoryProbe;
    use crate::mocks::{MockChainClient, MockConnector, MockPriceFeed, MockSigner};
    use crate::monitoring::CollectingAlertSink;
    use crate::storage::MemoryStore;
    use crate::types::{eth_to_wei, gwei_to_wei, OpportunityKind, PendingTx};
    use ethers::types::{Bytes, H256};

    struct Fixture {
        chain: Arc<MockChainClient>,
        connector: Arc<MockConnector>,
        alerts: Arc<CollectingAlertSink>,
        core: Arc<MainCore>,
    }

    fn fixture_with(failures: u32, adjust: impl FnOnce(&mut Config)) -> Fixture {
        let mut config = Config::load_test_config();
        config.network.chain_id = 1337;
        adjust(&mut config);

        let chain = Arc::new(MockChainClient::new());
        let connector = Arc::new(MockConnector::new(chain.clone(), failures));
        let alerts = Arc::new(CollectingAlertSink::new());
        let core = MainCore::new(
            config,
            connector.clone(),
            Arc::new(MockSigner::random()),
            Arc::new(MockPriceFeed::with_defaults()),
        )
        .with_memory_probe(Arc::new(FixedMemoryProbe::new(100)))
        .with_store(Arc::new(MemoryStore::new()))
        .with_alert_sink(alerts.clone());

        Fixture {
            chain,
            connector,
            alerts,
            core: Arc::new(core),
        }
    }

    fn pending(to: Address, value_eth: f64) -> PendingTx {
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

    async fn wait_until<F: Fn() -> bool>(check: F) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_bootstrap_retries_connection() {
        let f = fixture_with(2, |_| {});
        f.core.bootstrap().await.unwrap();

        assert_eq!(f.connector.attempts(), 3);
        assert_eq!(f.core.state(), LifecycleState::Bootstrapped);

        let status = f.core.status().await;
        let nonce = status.nonce.unwrap();
        assert_eq!((nonce.confirmed, nonce.next), (0, 0));
        assert_eq!(status.queue_depth, 0);
        assert_eq!(status.uptime_secs, 0);
    }

    #[tokio::test]
    async fn test_connection_gives_up_after_retry_count() {
        let f = fixture_with(10, |_| {});
        let err = f.core.bootstrap().await.unwrap_err();

        assert!(matches!(err, ExecutorError::Bootstrap(_)));
        assert_eq!(f.connector.attempts(), 3);
        assert_eq!(f.core.state(), LifecycleState::Disconnected);
        assert!(f.core.status().await.nonce.is_none());
    }

    #[tokio::test]
    async fn test_bootstrap_failure_is_not_retried() {
        let f = fixture_with(0, |_| {});
        f.chain.fail_next_nonce_queries(1);

        let err = f.core.bootstrap().await.unwrap_err();
        assert!(matches!(err, ExecutorError::Bootstrap(_)));
        assert_eq!(f.connector.attempts(), 1);
        assert_eq!(f.core.state(), LifecycleState::Disconnected);
    }

    #[tokio::test]
    async fn test_pending_tx_flows_to_submission() {
        let f = fixture_with(0, |_| {});
        f.core.start().await.unwrap();
        assert_eq!(f.core.state(), LifecycleState::Running);
        let weth: Address = crate::constants::WETH.parse().unwrap();
        let batch = vec![pending(weth, 10.0), pending(Address::random(), 10.0)];
        let mut delivered = false;
        for _ in 0..200 {
            if f.chain.push_pending(batch.clone()).await {
                delivered = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(delivered);

        let stats = f.core.stats();
        assert!(wait_until(|| stats.snapshot().submitted == 1).await);
        assert_eq!(stats.snapshot().opportunities_received, 1);
        assert_eq!(f.chain.submitted().await.len(), 1);

        let status = f.core.status().await;
        assert_eq!(status.nonce.unwrap().next, 1);
        assert_eq!(status.txpool.unwrap().matched, 1);

        f.core.stop().await;
        assert_eq!(f.core.state(), LifecycleState::Stopped);
        assert!(f.core.status().await.nonce.is_none());
    }

    #[tokio::test]
    async fn test_run_returns_after_cancel() {
        let f = fixture_with(0, |_| {});
        let core = f.core.clone();
        let handle = tokio::spawn(async move { core.run().await });

        let mut state = f.core.subscribe_state();
        state.wait_for(|s| *s == LifecycleState::Running).await.unwrap();

        f.core.cancel_token().cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(f.core.state(), LifecycleState::Stopped);

        // 두 번째 stop은 아무 일도 하지 않음
        f.core.stop().await;
        assert_eq!(f.core.state(), LifecycleState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscription_failure_triggers_shutdown() {
        let f = fixture_with(0, |c| c.connection.health_check_interval_secs = 1);
        f.chain.fail_next_subscriptions(100);

        let core = f.core.clone();
        let handle = tokio::spawn(async move { core.run().await });
        tokio::time::timeout(Duration::from_secs(60), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(f.core.state(), LifecycleState::Stopped);
        assert_eq!(f.chain.subscribe_calls(), 3);
        assert_eq!(f.alerts.count(AlertLevel::Critical), 1);
    }

    #[tokio::test]
    async fn test_health_check_reports_chain_reachability() {
        let f = fixture_with(0, |_| {});
        f.core.start().await.unwrap();

        let mut reachable = false;
        for _ in 0..200 {
            let status = f.core.status().await;
            if status.component_health.get("chain") == Some(&true) {
                reachable = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(reachable);
        assert!(f.chain.block_requests() > 0);

        f.core.stop().await;
    }

    #[tokio::test]
    async fn test_start_twice_rejected() {
        let f = fixture_with(0, |_| {});
        f.core.start().await.unwrap();
        assert!(matches!(f.core.start().await, Err(ExecutorError::Lifecycle(_))));
        f.core.stop().await;
        assert!(matches!(f.core.bootstrap().await, Err(ExecutorError::Lifecycle(_))));
    }

    #[test]
    fn test_mirror_planner() {
        let planner = MirrorPlanner::new(0.01);
        let target = Address::random();
        let mut source = pending(target, 5.0);
        source.input = Bytes::from(vec![0x38, 0xed, 0x17, 0x39]);

        let opportunity = Opportunity::new(OpportunityKind::PendingTx, Address::random(), 0.2, source.clone());
        let intent = planner.plan(&opportunity).unwrap();
        assert_eq!(intent.to, target);
        assert_eq!(intent.value, U256::zero());
        assert_eq!(intent.data, source.input);
        assert_eq!(intent.source_tx, Some(source.hash));
        assert_eq!(intent.profit.amount_out, 0.2);

        let small = Opportunity::new(OpportunityKind::PendingTx, Address::random(), 0.001, source);
        assert!(planner.plan(&small).is_none());
    }
}
