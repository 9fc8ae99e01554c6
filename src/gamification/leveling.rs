//! Experience-to-level curve.

/// Experience needed per level step.
pub const XP_PER_LEVEL: i64 = 100;

/// Level for an accumulated experience total: `max(1, xp / 100)`.
///
/// Negative totals count as zero. Level 2 starts at 200 xp, so the first
/// level spans [0, 199].
pub fn level_for(xp: i64) -> i64 {
    (xp.max(0) / XP_PER_LEVEL).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_boundaries() {
        assert_eq!(level_for(0), 1);
        assert_eq!(level_for(99), 1);
        assert_eq!(level_for(100), 1);
        assert_eq!(level_for(199), 1);
        assert_eq!(level_for(200), 2);
        assert_eq!(level_for(299), 2);
        assert_eq!(level_for(510), 5);
    }

    #[test]
    fn test_negative_clamps_to_first_level() {
        assert_eq!(level_for(-1), 1);
        assert_eq!(level_for(i64::MIN), 1);
    }

    #[test]
    fn test_matches_floor_formula() {
        for xp in (0..5_000).step_by(7) {
            assert_eq!(level_for(xp), std::cmp::max(1, xp / 100));
        }
    }
}
