//! Round-trip delivery tester for a running bridge.

pub mod display;
pub mod engine;
pub mod record;

pub use display::{format_elapsed, render_graph, render_table};
pub use engine::{ReconciliationEngine, RunParams, PROBE_CONSUMER_TAG, PROBE_TTL_MS};
pub use record::{Ledger, Observation, ProbeStatus, ReconciliationRecord, ReconciliationReport};
