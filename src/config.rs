use std::collections::{HashMap, HashSet};
use std::time::Duration;

use anyhow::{anyhow, Result};
use ethers::types::{Address, U256};
use serde::{Deserialize, Serialize};

use crate::types::gwei_to_wei;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub chain_id: u64,
    pub name: String,
    pub rpc_url: String,
    pub ws_url: Option<String>,
    pub block_time: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            chain_id: 1,
            name: "mainnet".to_string(),
            rpc_url: "https://eth-mainnet.g.alchemy.com/v2/YOUR_API_KEY".to_string(),
            ws_url: Some("wss://eth-mainnet.g.alchemy.com/v2/YOUR_API_KEY".to_string()),
            block_time: 12,
        }
    }
}

/// 트랜잭션 제출/재시도 관련 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// 최소 수익 (ETH)
    pub min_profit: f64,
    pub max_gas_price_gwei: f64,
    /// 제출 시도 총 횟수 (첫 시도 포함)
    pub mempool_max_retries: u32,
    pub mempool_retry_delay_ms: u64,
    /// 재시도마다 곱하는 가스 배수
    pub gas_multiplier: f64,
    pub submit_timeout_ms: u64,
    pub default_gas_limit: u64,
    pub max_parallel_tasks: usize,
    pub track_receipts: bool,
    pub receipt_timeout_secs: u64,
    pub receipt_poll_interval_ms: u64,
    /// true면 시뮬레이션까지만 수행하고 브로드캐스트하지 않음
    pub dry_run: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            min_profit: 0.001,
            max_gas_price_gwei: 100.0,
            mempool_max_retries: 3,
            mempool_retry_delay_ms: 500,
            gas_multiplier: 1.1,
            submit_timeout_ms: 10_000,
            default_gas_limit: crate::constants::DEFAULT_GAS_LIMIT,
            max_parallel_tasks: 5,
            track_receipts: true,
            receipt_timeout_secs: 120,
            receipt_poll_interval_ms: 2_000,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    pub cache_ttl_secs: u64,
    pub gas_price_ttl_secs: u64,
    pub congestion_ttl_secs: u64,
    pub max_network_congestion: f64,
    /// 혼잡도 보정 슬리피지 허용 상한 (%)
    pub max_slippage_pct: f64,
    /// 이 잔액 미만이면 서킷 브레이커 작동 (ETH)
    pub min_balance_eth: f64,
    pub min_gas_price_gwei: f64,
    pub default_priority_fee_gwei: f64,
    /// 혼잡도 추세 계산에 사용하는 블록 히스토리 길이
    pub congestion_history: usize,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 60,
            gas_price_ttl_secs: 10,
            congestion_ttl_secs: 10,
            max_network_congestion: 0.8,
            max_slippage_pct: 1.0,
            min_balance_eth: 0.01,
            min_gas_price_gwei: crate::constants::MIN_GAS_PRICE_GWEI,
            default_priority_fee_gwei: crate::constants::DEFAULT_PRIORITY_FEE_GWEI,
            congestion_history: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketConfig {
    pub cache_ttl_ms: u64,
    pub cleanup_interval_secs: u64,
    pub quote_currency: String,
    pub request_timeout_ms: u64,
    /// 모니터링 토큰 가격 사전 갱신 주기
    pub update_interval_secs: u64,
    pub binance_base_url: String,
    pub coingecko_base_url: String,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            cache_ttl_ms: 60_000,
            cleanup_interval_secs: 300,
            quote_currency: "USD".to_string(),
            request_timeout_ms: 5_000,
            update_interval_secs: 60,
            binance_base_url: "https://api.binance.com".to_string(),
            coingecko_base_url: "https://api.coingecko.com/api/v3".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TxpoolConfig {
    pub queue_capacity: usize,
    pub memory_threshold_mb: u64,
    pub memory_check_interval_secs: u64,
    pub processed_cache_size: usize,
    pub processed_cache_ttl_secs: u64,
    /// 최소 관심 트랜잭션 가치 (ETH)
    pub min_tx_value_eth: f64,
}

impl Default for TxpoolConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1_000,
            memory_threshold_mb: 2_048,
            memory_check_interval_secs: 60,
            processed_cache_size: 10_000,
            processed_cache_ttl_secs: 300,
            min_tx_value_eth: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub retry_count: u32,
    pub retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub connect_timeout_ms: u64,
    pub health_check_interval_secs: u64,
    pub nonce_resync_interval_secs: u64,
    pub shutdown_timeout_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            retry_count: 3,
            retry_delay_ms: 2_000,
            max_retry_delay_ms: 30_000,
            connect_timeout_ms: 10_000,
            health_check_interval_secs: 30,
            nonce_resync_interval_secs: 60,
            shutdown_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub enabled: bool,
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: "data/transactions.jsonl".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub log_level: String,
    pub status_interval_secs: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            status_interval_secs: 60,
        }
    }
}

#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WalletConfig {
    pub private_key: String,
}

impl std::fmt::Debug for WalletConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalletConfig")
            .field("private_key", &if self.private_key.is_empty() { "<unset>" } else { "<redacted>" })
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub network: NetworkConfig,
    pub wallet: WalletConfig,
    pub execution: ExecutionConfig,
    pub safety: SafetyConfig,
    pub market: MarketConfig,
    pub txpool: TxpoolConfig,
    pub connection: ConnectionConfig,
    pub storage: StorageConfig,
    pub monitoring: MonitoringConfig,
    pub tokens: HashMap<String, String>, // symbol -> address
    /// 감시 대상 토큰 (심볼 또는 주소)
    pub monitored_tokens: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        let mut tokens = HashMap::new();
        tokens.insert("WETH".to_string(), crate::constants::WETH.to_string());
        tokens.insert("USDC".to_string(), crate::constants::USDC.to_string());
        tokens.insert("USDT".to_string(), crate::constants::USDT.to_string());
        tokens.insert("DAI".to_string(), crate::constants::DAI.to_string());
        tokens.insert("WBTC".to_string(), crate::constants::WBTC.to_string());

        Self {
            network: NetworkConfig::default(),
            wallet: WalletConfig::default(),
            execution: ExecutionConfig::default(),
            safety: SafetyConfig::default(),
            market: MarketConfig::default(),
            txpool: TxpoolConfig::default(),
            connection: ConnectionConfig::default(),
            storage: StorageConfig::default(),
            monitoring: MonitoringConfig::default(),
            tokens,
            monitored_tokens: vec!["WETH".to_string(), "USDC".to_string(), "USDT".to_string()],
        }
    }
}

/// 제출 재시도 정책
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub fee_multiplier: f64,
    /// 수수료 상한 (wei)
    pub max_fee_per_gas: U256,
    pub submit_timeout: Duration,
}

impl RetryPolicy {
    /// 다음 시도에 사용할 수수료. 상한에 이미 도달했으면 None
    pub fn next_fee(&self, current: U256) -> Option<U256> {
        if current >= self.max_fee_per_gas {
            return None;
        }
        let scaled = crate::types::u256_to_f64(current) * self.fee_multiplier;
        let scaled = if scaled >= crate::types::u256_to_f64(self.max_fee_per_gas) {
            self.max_fee_per_gas
        } else {
            U256::from(scaled.round() as u128)
        };
        let bumped = scaled.max(current + U256::one());
        Some(bumped.min(self.max_fee_per_gas))
    }
}

/// 연결 재시도 정책 (지수 백오프)
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl BackoffPolicy {
    /// attempt는 1부터 시작
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Config {
    pub async fn load(path: &str) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub async fn save(&self, path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    pub fn get_token_address(&self, symbol: &str) -> Option<Address> {
        self.tokens
            .get(&symbol.to_uppercase())
            .and_then(|addr| addr.parse().ok())
    }

    /// monitored_tokens를 주소 집합으로 변환 (심볼은 tokens 맵으로 해석)
    pub fn monitored_token_addresses(&self) -> Result<HashSet<Address>> {
        self.monitored_tokens
            .iter()
            .map(|entry| {
                if entry.starts_with("0x") {
                    entry
                        .parse::<Address>()
                        .map_err(|e| anyhow!("Invalid monitored token address {}: {}", entry, e))
                } else {
                    self.get_token_address(entry)
                        .ok_or_else(|| anyhow!("Unknown monitored token symbol: {}", entry))
                }
            })
            .collect()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.execution.mempool_max_retries,
            retry_delay: Duration::from_millis(self.execution.mempool_retry_delay_ms),
            fee_multiplier: self.execution.gas_multiplier,
            max_fee_per_gas: gwei_to_wei(self.execution.max_gas_price_gwei),
            submit_timeout: Duration::from_millis(self.execution.submit_timeout_ms),
        }
    }

    pub fn connection_backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            attempts: self.connection.retry_count,
            initial_delay: Duration::from_millis(self.connection.retry_delay_ms),
            max_delay: Duration::from_millis(self.connection.max_retry_delay_ms),
        }
    }

    pub fn market_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.market.cache_ttl_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.network.rpc_url.is_empty() {
            return Err(anyhow!("Network RPC URL cannot be empty"));
        }

        if self.wallet.private_key.is_empty() || self.wallet.private_key == "your_private_key_here" {
            return Err(anyhow!("Wallet private key must be configured"));
        }

        if self.execution.min_profit < 0.0 {
            return Err(anyhow!("Minimum profit cannot be negative"));
        }

        if self.execution.max_gas_price_gwei <= 0.0 {
            return Err(anyhow!("Max gas price must be positive"));
        }

        if self.execution.mempool_max_retries == 0 {
            return Err(anyhow!("mempool_max_retries must be at least 1"));
        }

        if self.execution.gas_multiplier <= 1.0 {
            return Err(anyhow!("gas_multiplier must be greater than 1.0"));
        }

        if self.execution.max_parallel_tasks == 0 {
            return Err(anyhow!("max_parallel_tasks must be greater than 0"));
        }

        if self.txpool.queue_capacity == 0 {
            return Err(anyhow!("Txpool queue capacity must be greater than 0"));
        }

        if !(0.0..=1.0).contains(&self.safety.max_network_congestion) {
            return Err(anyhow!("max_network_congestion must be within [0, 1]"));
        }

        if self.safety.min_gas_price_gwei > self.execution.max_gas_price_gwei {
            return Err(anyhow!("min_gas_price_gwei exceeds max_gas_price_gwei"));
        }

        if self.connection.retry_count == 0 {
            return Err(anyhow!("Connection retry count must be at least 1"));
        }

        if self.monitored_tokens.is_empty() {
            return Err(anyhow!("At least one monitored token must be configured"));
        }
        self.monitored_token_addresses()?;

        Ok(())
    }

    #[cfg(test)]
    pub fn load_test_config() -> Self {
        let mut config = Self::default();
        config.wallet.private_key =
            "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318".to_string();
        config.execution.mempool_retry_delay_ms = 10;
        config.execution.track_receipts = false;
        config.connection.retry_delay_ms = 10;
        config.connection.max_retry_delay_ms = 40;
        config
    }
}
