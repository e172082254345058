//! Node process
//!
//! - Router: classifies inbound messages and replies
//! - Transaction: 2PC coordinator and participant
//! - Election: Bully election, triggered by the heartbeat probe
//! - Txlog: coordinator-side phase log

pub mod election;
pub mod heartbeat;
pub mod router;
pub mod server;
pub mod state;
pub mod transaction;
pub mod txlog;

pub use election::{Election, ElectionOutcome};
pub use heartbeat::{Heartbeat, Probe};
pub use server::{NodeContext, NodeHandle, NodeServer};
pub use state::CoordinatorCell;
pub use transaction::{Participant, TransactionCoordinator, TxnOutcome};
pub use txlog::{RecoveryReport, TxnLog, TxnPhase, TxnRecord};
