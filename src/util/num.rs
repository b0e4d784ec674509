/// Round up `n` to the nearest multiple of `to`
///
/// # Panics
/// - In debug mode, if the result does not fit in a `usize`
pub fn round_up(n: usize, to: usize) -> usize {
    to * n.div_ceil(to)
}

/// Like [`round_up()`], but `None` instead of overflowing
pub fn checked_round_up(n: usize, to: usize) -> Option<usize> {
    n.checked_add(to - 1).map(|n| n / to * to)
}
