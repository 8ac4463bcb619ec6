//! Style Enforcement Tests
//!
//! Keeps module size and naming consistent across the tribe crates.

#[path = "style/naming_conventions.rs"]
mod naming_conventions;
