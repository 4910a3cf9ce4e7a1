//! Property-based tests over random scenarios.
//!
//! Run with: `cargo test --test property`
//! `PROPTEST_CASES=<n>` raises the case count.

mod sim_random;
mod support;
