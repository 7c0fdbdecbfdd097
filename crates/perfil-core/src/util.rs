//! Small shared helpers.

/// Pseudo-random value in `[0, max)` from a clock-seeded xorshift.
///
/// Good enough for back-off jitter and rotation picks, not crypto; avoids
/// pulling in the `rand` crate.
pub fn xorshift_below(max: u64) -> u64 {
    if max == 0 {
        return 0;
    }
    let mut x = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    x % max
}

/// Estimate LLM tokens for a text: ceil(chars / 3).
///
/// The divisor 3 is calibrated for Portuguese-heavy corporate text, where
/// accented words tokenize shorter than the usual 4-chars-per-token rule.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(3)
}
