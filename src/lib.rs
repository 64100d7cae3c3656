// xCrack on-chain executor library

pub mod config;
pub mod core;
pub mod mocks;
pub mod blockchain;
pub mod oracle;
pub mod storage;
pub mod mempool;
pub mod monitoring;
pub mod safety;

// Core types
pub mod types;
pub mod constants;

// Re-exports for convenience
pub use config::Config;
pub use core::{MainCore, NonceCore, TransactionCore};
pub use monitoring::MarketMonitor;
pub use safety::SafetyNet;
pub use mempool::TxpoolMonitor;
