//! Integration tests for Tribe
//!
//! These tests open real sessions over loopback against the simulated
//! engine, gateway and mirror from `tribe-sim`, with the HTTP fetcher used
//! in production. Only engine launching is mocked.

#[path = "integration/support.rs"]
mod support;

#[path = "integration/control_link.rs"]
mod control_link;

#[path = "integration/failover.rs"]
mod failover;

#[path = "integration/alternate_engine.rs"]
mod alternate_engine;

#[path = "integration/metadata_mode.rs"]
mod metadata_mode;
