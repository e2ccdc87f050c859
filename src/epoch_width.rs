//! Epoch counter width.
//!
//! The default is a 64-bit monotone counter, wide enough that wraparound is
//! not a practical concern. Enabling the `epoch32` feature switches both
//! [`crate::qsbr`] and [`crate::ebr`] to a 32-bit counter; QSBR's unbounded
//! monotone counter then needs a wraparound-safe comparison, provided here
//! as [`epoch_ge`], instead of plain numeric `>=`. EBR never needs this: its
//! counter is always reduced modulo 3, so its comparisons are plain
//! equality checks regardless of the chosen width.

cfg_if::cfg_if! {
    if #[cfg(feature = "epoch32")] {
        /// The epoch counter's storage type.
        pub type Epoch = u32;
        type SignedEpoch = i32;
    } else {
        /// The epoch counter's storage type.
        pub type Epoch = u64;
        type SignedEpoch = i64;
    }
}

/// Returns `true` iff `a` is at or after `b` on the epoch's monotone
/// timeline, tolerating a single wraparound of the counter.
///
/// Plain numeric `a >= b` is unsound once a narrow counter has wrapped
/// around past its maximum value; this instead checks the sign bit of the
/// wrapping difference, which stays correct as long as `a` and `b` are
/// within half the counter's range of each other (true for QSBR's bounded
/// grace periods in any realistic deployment).
#[inline]
pub fn epoch_ge(a: Epoch, b: Epoch) -> bool {
    (a.wrapping_sub(b) as SignedEpoch) >= 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ge_is_reflexive_and_monotone() {
        assert!(epoch_ge(5, 5));
        assert!(epoch_ge(6, 5));
        assert!(!epoch_ge(5, 6));
    }

    #[test]
    fn ge_tolerates_wraparound() {
        let near_max = Epoch::MAX;
        assert!(epoch_ge(0, near_max));
        assert!(!epoch_ge(near_max, 0));
    }
}
