//! Time-block arithmetic for signing-key rotation.
//!
//! Time is divided into fixed windows of `block_size` seconds. Offset `0`
//! names the block containing `now`, `-1` the previous one and `+1` the next.

/// Start (epoch seconds) of the block at `offset` relative to `epoch_secs`.
///
/// `block_size` must be positive. Results outside `i64` saturate.
#[must_use]
pub fn block_start(epoch_secs: i64, block_size: i64, offset: i64) -> i64 {
    epoch_secs
        .div_euclid(block_size)
        .saturating_add(offset)
        .saturating_mul(block_size)
}

/// Store key for the block starting at `start`.
#[must_use]
pub fn block_key(namespace: &str, start: i64) -> String {
    format!("{namespace}:signing-keys:{start}")
}
