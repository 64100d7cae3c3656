pub mod safety_net;

pub use safety_net::{ProfitBreakdown, SafetyCandidate, SafetyNet};
