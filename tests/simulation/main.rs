//! Deterministic simulation tests for the policy.
//!
//! Run with: `cargo test --test simulation`

mod ordering;
mod restart;
mod starvation;
mod support;
mod throttling;
mod weights;
