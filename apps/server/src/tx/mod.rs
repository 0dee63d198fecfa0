//! The terminology operation layer: filter preparation, ValueSet expansion
//! and the per-request operation worker.

pub mod expansion;
pub mod filters;
pub mod worker;

pub use expansion::{ExpansionOutcome, ExpansionParams};
pub use filters::PrepContext;
pub use worker::{TxResources, Worker};
