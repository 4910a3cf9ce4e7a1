//! Case-count scaling for the property suites.
//!
//! Integration tests cannot reach the crate's `cfg(test)` helpers, so this
//! applies the same rule as the unit tests' `proptest_cases`.

/// `PROPTEST_CASES` if set, `default` on CI, and at most 4 locally.
pub fn proptest_cases(default: u32) -> u32 {
    let env = std::env::var("PROPTEST_CASES")
        .ok()
        .and_then(|v| v.parse().ok());
    scaled_cases(default, env, std::env::var_os("CI").is_some())
}

fn scaled_cases(default: u32, env: Option<u32>, ci: bool) -> u32 {
    match env {
        Some(n) => n.max(1),
        None if ci => default.max(1),
        None => default.clamp(1, 4),
    }
}

#[test]
fn case_count_scales_with_environment() {
    assert_eq!(scaled_cases(16, None, false), 4);
    assert_eq!(scaled_cases(16, None, true), 16);
    assert_eq!(scaled_cases(16, Some(200), false), 200);
    assert_eq!(scaled_cases(16, Some(0), true), 1);
    assert_eq!(scaled_cases(0, None, true), 1);
}
