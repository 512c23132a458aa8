//! Adler32-style rolling checksum used for chunk matching.
//!
//! Two 16-bit sums (a, b) combined into a 32-bit value. `rotate` slides the
//! window by one byte in O(1): remove the outgoing byte, add the incoming one,
//! no re-scan of the window.

const MOD_ADLER: u32 = 65521;

/// Name recorded in signature/delta headers.
pub const ALGORITHM_NAME: &str = "adler32";

/// Compute the checksum of a full window from scratch.
pub fn compute(data: &[u8]) -> u32 {
    // Accumulate in u64 to defer all modular reductions to a single pair of
    // operations at the end, rather than reducing on every byte.
    let mut a: u64 = 1;
    let mut b: u64 = 0;
    for &byte in data {
        a += byte as u64;
        b += a;
    }
    let a = (a % MOD_ADLER as u64) as u32;
    let b = (b % MOD_ADLER as u64) as u32;
    (b << 16) | a
}

/// Slide the window one byte: remove `old_byte` from the front, append
/// `new_byte`. `window_len` is the (constant) window size in bytes.
///
/// Equivalent to `compute` over the shifted window.
pub fn rotate(checksum: u32, old_byte: u8, new_byte: u8, window_len: u32) -> u32 {
    let m = MOD_ADLER as i64;
    let a = (checksum & 0xffff) as i64;
    let b = (checksum >> 16) as i64;
    let old = old_byte as i64;
    let new = new_byte as i64;

    let a = (a - old + new).rem_euclid(m);
    let b = (b - window_len as i64 * old + a - 1).rem_euclid(m);

    ((b as u32) << 16) | a as u32
}
