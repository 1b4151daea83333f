// packages/pool/src/runtime/selector.rs
//! Worker selection for conversation threads
//!
//! Selection is a pure function of the thread id, the worker count, the
//! thread's current pin and the set of unavailable workers:
//!
//! 1. An in-range, available pin wins.
//! 2. Otherwise the thread id's FNV-1a hash modulo the worker count.
//! 3. If that worker is unavailable, the lowest-numbered available worker.
//! 4. If nothing is available, `Selection::NoWorkerAvailable`.
//!
//! Recording the result as the thread's new pin is the caller's job.

use crate::runtime::scoped_id::WorkerId;
use std::collections::BTreeSet;
use ulid::Ulid;

/// Caller-side (local) conversation thread identifier
pub type LocalThreadId = Ulid;

const FNV_OFFSET_BASIS: u64 = 14_695_981_039_346_656_037;
const FNV_PRIME: u64 = 1_099_511_628_211;

/// Outcome of worker selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    Routed(WorkerId),
    NoWorkerAvailable,
}

impl Selection {
    /// Collapse to a worker, sending "nothing available" to the primary
    pub fn or_primary(self) -> WorkerId {
        match self {
            Selection::Routed(worker_id) => worker_id,
            Selection::NoWorkerAvailable => WorkerId::PRIMARY,
        }
    }
}

/// 64-bit FNV-1a over `bytes`
pub fn deterministic_hash(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

/// Hash slot for a thread, ignoring availability
pub fn consistent_worker_id(thread_id: LocalThreadId, worker_count: usize) -> WorkerId {
    if worker_count <= 1 {
        return WorkerId::PRIMARY;
    }
    let hash = deterministic_hash(&thread_id.to_bytes());
    WorkerId((hash % worker_count as u64) as usize)
}

/// Pick the worker responsible for `thread_id`
pub fn select_worker(
    thread_id: LocalThreadId,
    worker_count: usize,
    pinned: Option<WorkerId>,
    unavailable: &BTreeSet<WorkerId>,
) -> Selection {
    let worker_count = worker_count.max(1);
    let is_available = |worker_id: &WorkerId| {
        worker_id.index() < worker_count && !unavailable.contains(worker_id)
    };

    if let Some(pinned) = pinned.filter(is_available) {
        return Selection::Routed(pinned);
    }

    let candidate = consistent_worker_id(thread_id, worker_count);
    if is_available(&candidate) {
        return Selection::Routed(candidate);
    }

    first_available(worker_count, unavailable)
}

/// Lowest-numbered worker not in `unavailable`
pub fn first_available(worker_count: usize, unavailable: &BTreeSet<WorkerId>) -> Selection {
    (0..worker_count.max(1))
        .map(WorkerId)
        .find(|worker_id| !unavailable.contains(worker_id))
        .map_or(Selection::NoWorkerAvailable, Selection::Routed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn thread(text: &str) -> LocalThreadId {
        Ulid::from_string(text).unwrap()
    }

    const THREAD_A: &str = "01HV8Z3K6Q9W2X4Y5Z6A7B8C9D";

    #[test]
    fn test_fnv_reference_values() {
        assert_eq!(deterministic_hash(&[]), FNV_OFFSET_BASIS);
        // FNV-1a 64 of "a"
        assert_eq!(deterministic_hash(b"a"), 0xaf63_dc4c_8601_ec8c);
    }

    #[test]
    fn test_consistent_worker_is_deterministic_and_bounded() {
        let id = thread(THREAD_A);
        let first = consistent_worker_id(id, 6);
        let second = consistent_worker_id(id, 6);
        assert_eq!(first, second);
        assert!(first.index() < 6);
        assert_eq!(consistent_worker_id(id, 1), WorkerId::PRIMARY);
    }

    #[test]
    fn test_available_pin_wins() {
        let selected = select_worker(thread(THREAD_A), 4, Some(WorkerId(2)), &BTreeSet::new());
        assert_eq!(selected, Selection::Routed(WorkerId(2)));
    }

    #[test]
    fn test_unavailable_pin_is_ignored() {
        let unavailable = BTreeSet::from([WorkerId(2)]);
        let selected = select_worker(thread(THREAD_A), 4, Some(WorkerId(2)), &unavailable);
        assert_ne!(selected, Selection::Routed(WorkerId(2)));
        assert!(matches!(selected, Selection::Routed(_)));
    }

    #[test]
    fn test_out_of_range_pin_is_ignored() {
        let id = thread(THREAD_A);
        let selected = select_worker(id, 2, Some(WorkerId(7)), &BTreeSet::new());
        assert_eq!(selected, Selection::Routed(consistent_worker_id(id, 2)));
    }

    #[test]
    fn test_unavailable_hash_slot_falls_to_lowest_available() {
        let id = thread(THREAD_A);
        let hashed = consistent_worker_id(id, 4);
        let unavailable = BTreeSet::from([hashed, WorkerId::PRIMARY]);
        let expected = (0..4)
            .map(WorkerId)
            .find(|w| !unavailable.contains(w))
            .unwrap();

        let selected = select_worker(id, 4, None, &unavailable);
        assert_eq!(selected, Selection::Routed(expected));
        assert_ne!(selected, Selection::Routed(hashed));
    }

    #[test]
    fn test_nothing_available() {
        let unavailable: BTreeSet<_> = (0..3).map(WorkerId).collect();
        let selected = select_worker(thread(THREAD_A), 3, Some(WorkerId(1)), &unavailable);
        assert_eq!(selected, Selection::NoWorkerAvailable);
        assert_eq!(selected.or_primary(), WorkerId::PRIMARY);
    }

    proptest! {
        #[test]
        fn prop_selection_is_deterministic(raw in any::<u128>(), workers in 1usize..16, down in 0usize..16) {
            let id = Ulid(raw);
            let unavailable = BTreeSet::from([WorkerId(down)]);
            let first = select_worker(id, workers, None, &unavailable);
            let second = select_worker(id, workers, None, &unavailable);
            prop_assert_eq!(first, second);
            if let Selection::Routed(worker_id) = first {
                prop_assert!(worker_id.index() < workers);
                prop_assert!(!unavailable.contains(&worker_id));
            }
        }
    }
}
