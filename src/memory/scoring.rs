//! Decay scoring model.
//!
//! Decay is a deterministic function of a record's current state and is
//! recomputed, not accumulated, every time it is evaluated:
//!
//! ```text
//! base   = clamp(1 - (age_days / 365) * 0.5, 0, 1)    half-life ~1 year
//! decay  = base * (0.5 + importance * 0.5)            important items decay slower
//! access = 1 - min(access_count / 100, 0.3)           frequent access slows decay
//! decay  = clamp(decay * access, 0, 1)
//! ```

use chrono::{DateTime, Utc};

use crate::memory::types::MemoryRecord;

/// Importance assigned to records when the caller gives none.
pub const DEFAULT_IMPORTANCE_SCORE: f64 = 0.5;

/// Decay score assigned at creation.
pub const DEFAULT_DECAY_SCORE: f64 = 1.0;

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Compute the decay score for a record of the given age and usage.
pub fn compute_decay(age_days: f64, importance: f64, access_count: u64) -> f64 {
    let age_days = age_days.max(0.0);
    let base = (1.0 - (age_days / 365.0) * 0.5).clamp(0.0, 1.0);
    let decay = base * (0.5 + importance * 0.5);
    let access_factor = 1.0 - (access_count as f64 / 100.0).min(0.3);
    (decay * access_factor).clamp(0.0, 1.0)
}

/// Fractional age in days, floored at zero for clock skew.
pub fn age_in_days(created_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let seconds = (now - created_at).num_seconds().max(0);
    seconds as f64 / SECONDS_PER_DAY
}

/// Recompute a record's decay score as of `now`.
pub fn record_decay(record: &MemoryRecord, now: DateTime<Utc>) -> f64 {
    compute_decay(
        age_in_days(record.created_at, now),
        record.importance_score,
        record.access_count,
    )
}

/// Cosine similarity between two vectors, in f64 for stable ranking.
///
/// Mismatched lengths and zero vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += f64::from(*x) * f64::from(*y);
        norm_a += f64::from(*x) * f64::from(*x);
        norm_b += f64::from(*y) * f64::from(*y);
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::types::MemoryType;
    use proptest::prelude::*;

    #[test]
    fn test_fresh_record_decay() {
        // age 0: base = 1, so decay is the importance factor alone
        assert_eq!(compute_decay(0.0, 0.5, 0), 0.75);
        assert_eq!(compute_decay(0.0, 1.0, 0), 1.0);
        assert_eq!(compute_decay(0.0, 0.0, 0), 0.5);
    }

    #[test]
    fn test_decay_at_400_days() {
        // 400-day-old record, importance 0.2, never accessed
        let expected: f64 = ((1.0_f64 - (400.0 / 365.0) * 0.5).clamp(0.0, 1.0)
            * (0.5 + 0.2 * 0.5)
            * (1.0 - (0.0f64 / 100.0).min(0.3)))
        .clamp(0.0, 1.0);

        assert_eq!(compute_decay(400.0, 0.2, 0), expected);
        assert!((expected - 0.271).abs() < 0.001);
    }

    #[test]
    fn test_base_decay_floors_past_two_years() {
        assert_eq!(compute_decay(730.0, 1.0, 0), 0.0);
        assert_eq!(compute_decay(10_000.0, 1.0, 50), 0.0);
    }

    #[test]
    fn test_access_discount_caps_at_30_percent() {
        let at_cap = compute_decay(0.0, 1.0, 30);
        assert_eq!(at_cap, 0.7);
        assert_eq!(compute_decay(0.0, 1.0, 100), at_cap);
        assert_eq!(compute_decay(0.0, 1.0, 10_000), at_cap);
    }

    #[test]
    fn test_negative_age_clamped() {
        assert_eq!(compute_decay(-5.0, 0.5, 0), compute_decay(0.0, 0.5, 0));
    }

    #[test]
    fn test_record_decay_uses_created_at() {
        let now = Utc::now();
        let mut record = MemoryRecord::new(MemoryType::EpisodicConversation, "x");
        record.created_at = now - chrono::Duration::days(365);
        record.importance_score = 1.0;

        let decay = record_decay(&record, now);
        assert!((decay - 0.5).abs() < 0.001);
    }

    #[test]
    fn test_cosine_similarity() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 2.0], &[1.0, 2.0]) - 1.0).abs() < 1e-12);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-12);

        // degenerate inputs
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    proptest! {
        #[test]
        fn prop_decay_bounded(
            age in 0.0f64..20_000.0,
            importance in 0.0f64..=1.0,
            access in 0u64..10_000,
        ) {
            let decay = compute_decay(age, importance, access);
            prop_assert!((0.0..=1.0).contains(&decay));
        }

        #[test]
        fn prop_decay_non_increasing_in_age(
            age in 0.0f64..2_000.0,
            delta in 0.0f64..2_000.0,
            importance in 0.0f64..=1.0,
            access in 0u64..1_000,
        ) {
            let younger = compute_decay(age, importance, access);
            let older = compute_decay(age + delta, importance, access);
            prop_assert!(older <= younger);
        }

        #[test]
        fn prop_access_discount_monotone(
            age in 0.0f64..2_000.0,
            importance in 0.0f64..=1.0,
            access in 0u64..1_000,
            more in 0u64..1_000,
        ) {
            // the access factor only moves one way, and never below 0.7
            let cold = compute_decay(age, importance, access);
            let warm = compute_decay(age, importance, access + more);
            prop_assert!(warm <= cold);
            prop_assert!(warm >= cold * 0.7 - f64::EPSILON);
        }
    }
}
