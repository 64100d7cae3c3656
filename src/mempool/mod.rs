pub mod filters;
pub mod memory;
pub mod txpool_monitor;

pub use filters::{references_monitored_token, TokenMatch};
pub use memory::{FixedMemoryProbe, MemoryProbe, SysinfoProbe};
pub use txpool_monitor::{TxpoolMonitor, TxpoolStats};
