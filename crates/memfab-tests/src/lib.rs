//! memfab Test & Validation Infrastructure
//!
//! Scenario suites that exercise the fabric across two in-process
//! environments, end-to-end runs of the demo flows, and property tests for
//! the wire codecs. The helpers here drive both sides of a transfer from
//! one thread, or push the serving side onto its own thread where a flow
//! demands a long-lived loop.

pub mod fabric_scenarios;
pub mod flow_scenarios;
pub mod harness;
pub mod proptest_handshake;

pub use fabric_scenarios::env_pair;
pub use harness::{drive_to_completion, init_test_logging, progress_both, progress_until};
