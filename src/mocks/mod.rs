pub mod rpc_mock;
pub mod price_feed_mock;
pub mod signer_mock;

pub use price_feed_mock::MockPriceFeed;
pub use rpc_mock::{MockChainClient, MockConnector, SubmitBehavior};
pub use signer_mock::MockSigner;

use std::env;

/// Check if mock mode is enabled
pub fn is_mock_mode() -> bool {
    env::var("API_MODE").unwrap_or_default() == "mock"
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Get mock configuration values
pub fn get_mock_config() -> MockConfig {
    MockConfig {
        chain_id: env_or("MOCK_CHAIN_ID", 1337),
        base_fee: env_or("MOCK_BASE_FEE", 15_000_000_000u64),
        priority_fee: env_or("MOCK_PRIORITY_FEE", 1_500_000_000u64),
        block_gas_ratio: env_or("MOCK_BLOCK_GAS_RATIO", 0.45),
        balance_eth: env_or("MOCK_BALANCE_ETH", 10.0),
        pending_interval_ms: env_or("MOCK_PENDING_INTERVAL_MS", 200),
        monitored_tx_rate: env_or("MOCK_MONITORED_TX_RATE", 0.1),
        network_latency_ms: env_or("MOCK_NETWORK_LATENCY", 0),
    }
}

#[derive(Debug, Clone)]
pub struct MockConfig {
    pub chain_id: u64,
    pub base_fee: u64,
    pub priority_fee: u64,
    /// 블록 gas_used / gas_limit
    pub block_gas_ratio: f64,
    pub balance_eth: f64,
    pub pending_interval_ms: u64,
    /// 생성된 펜딩 트랜잭션 중 감시 토큰을 향하는 비율
    pub monitored_tx_rate: f64,
    pub network_latency_ms: u64,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            chain_id: 1337,
            base_fee: 15_000_000_000,
            priority_fee: 1_500_000_000,
            block_gas_ratio: 0.45,
            balance_eth: 10.0,
            pending_interval_ms: 200,
            monitored_tx_rate: 0.1,
            network_latency_ms: 0,
        }
    }
}
