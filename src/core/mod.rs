pub mod nonce_core;
pub mod transaction_core;
pub mod main_core;

pub use nonce_core::{NonceCore, NonceState};
pub use transaction_core::{AbandonReason, ExecutionOutcome, ExecutionReport, TransactionCore};
pub use main_core::{LifecycleState, MainCore, MainCoreStatus, MirrorPlanner, OpportunityPlanner};
