//! Rolling checksum with O(1) window sliding
//!
//! - s1 = sum of all bytes
//! - s2 = n*byte[0] + (n-1)*byte[1] + ... + 1*byte[n-1]
//!
//! Sliding the window by one byte removes the leaving byte from s1 and its
//! n-weighted contribution from s2, then adds the new s1 to s2 (every byte
//! still in the window gains one unit of weight).

use super::RollingSignature;

/// Rolling checksum operations
pub struct RollingHash;

impl RollingHash {
    /// Compute the checksum of a full window
    pub fn init(window: &[u8]) -> RollingSignature {
        let mut s1: u64 = 0;
        let mut s2: u64 = 0;

        // s2 accumulates the running s1, which weights byte[i] by (n - i)
        for &byte in window {
            s1 += byte as u64;
            s2 += s1;
        }

        RollingSignature { s1, s2 }
    }

    /// Slide the window one byte: drop `previous_byte`, take in `next_byte`
    #[inline]
    pub fn roll(
        window_len: usize,
        previous_byte: u8,
        next_byte: u8,
        sig: RollingSignature,
    ) -> RollingSignature {
        let previous = previous_byte as u64;
        let next = next_byte as u64;

        // Exact for real windows; wrapping only keeps garbage input from panicking
        let s1 = sig.s1.wrapping_sub(previous).wrapping_add(next);
        let s2 = sig
            .s2
            .wrapping_sub(previous.wrapping_mul(window_len as u64))
            .wrapping_add(s1);

        RollingSignature { s1, s2 }
    }
}
