use std::collections::HashSet;

/// Lowest port `>= base` absent from `used`, `None` once the range is exhausted.
///
/// Nothing is remembered between calls: `used` must be the live snapshot
/// taken from the runtime in the current cycle.
pub fn allocate(base: u16, used: &HashSet<u16>) -> Option<u16> {
    (base..=u16::MAX).find(|port| !used.contains(port))
}
