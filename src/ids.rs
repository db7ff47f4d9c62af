//! Identifier generation, timestamps, and sparse sibling order keys.

use std::sync::atomic::{AtomicI64, Ordering};

/// Spacing between sibling keys after a renumbering pass.
pub const ORDER_GAP: i64 = 1000;

/// Generates a globally unique entity identifier.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

static LAST_TIMESTAMP: AtomicI64 = AtomicI64::new(0);

/// Milliseconds since the epoch, strictly increasing within this process.
///
/// Two calls in the same millisecond return consecutive values so that
/// `updated_at` always moves forward on a write.
pub fn now_millis() -> i64 {
    let wall = chrono::Utc::now().timestamp_millis();
    let mut prev = LAST_TIMESTAMP.load(Ordering::Relaxed);
    loop {
        let next = wall.max(prev + 1);
        match LAST_TIMESTAMP.compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(actual) => prev = actual,
        }
    }
}

/// Computes a key strictly between two neighbors.
///
/// `prev` is the key of the sibling the new node goes after (None = first),
/// `next` is the key of the sibling it goes before (None = last). Returns
/// `None` when the neighbors are adjacent or the arithmetic would overflow;
/// the caller must renumber the group.
pub fn key_between(prev: Option<i64>, next: Option<i64>) -> Option<i64> {
    match (prev, next) {
        (None, None) => Some(0),
        (Some(a), None) => a.checked_add(ORDER_GAP),
        (None, Some(b)) => b.checked_sub(ORDER_GAP),
        (Some(a), Some(b)) => {
            let span = b.checked_sub(a)?;
            if span >= 2 {
                Some(a + span / 2)
            } else {
                None
            }
        }
    }
}

/// Evenly spaced keys for `count` siblings: `GAP, 2*GAP, ...`.
pub fn spaced_keys(count: usize) -> impl Iterator<Item = i64> {
    (1..=count as i64).map(|i| i * ORDER_GAP)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        let a = new_id();
        let b = new_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 36);
    }

    #[test]
    fn test_timestamps_strictly_increase() {
        let mut last = now_millis();
        for _ in 0..1000 {
            let t = now_millis();
            assert!(t > last);
            last = t;
        }
    }

    #[test]
    fn test_empty_group_starts_at_zero() {
        assert_eq!(key_between(None, None), Some(0));
    }

    #[test]
    fn test_append_and_prepend_use_gap() {
        assert_eq!(key_between(Some(2000), None), Some(3000));
        assert_eq!(key_between(None, Some(1000)), Some(0));
        assert_eq!(key_between(None, Some(0)), Some(-1000));
    }

    #[test]
    fn test_midpoint_between_neighbors() {
        assert_eq!(key_between(Some(1000), Some(2000)), Some(1500));
        assert_eq!(key_between(Some(1), Some(3)), Some(2));
        assert_eq!(key_between(Some(-10), Some(10)), Some(0));
    }

    #[test]
    fn test_adjacent_keys_need_renumbering() {
        assert_eq!(key_between(Some(5), Some(6)), None);
        assert_eq!(key_between(Some(5), Some(5)), None);
    }

    #[test]
    fn test_overflow_needs_renumbering() {
        assert_eq!(key_between(Some(i64::MAX - 1), None), None);
        assert_eq!(key_between(None, Some(i64::MIN + 1)), None);
        assert_eq!(key_between(Some(i64::MIN), Some(i64::MAX)), None);
    }

    #[test]
    fn test_spaced_keys_are_multiples_of_gap() {
        let keys: Vec<i64> = spaced_keys(3).collect();
        assert_eq!(keys, vec![1000, 2000, 3000]);
        assert_eq!(spaced_keys(0).count(), 0);
    }
}
