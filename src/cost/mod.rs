pub mod gate;
pub mod ledger;
pub mod model;

pub use gate::{CostGate, GateCandidate, GateDecision, GatePolicy, RejectReason};
pub use ledger::{CallOutcome, CostLedger, CostLedgerEntry, LedgerSummary};
pub use model::{CostEstimate, CostModel};
