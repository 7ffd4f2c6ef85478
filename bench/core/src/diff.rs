//! Diff Engine
//!
//! Computes the minimal change-set for one arm and queues it as a diff
//! report.
//!
//! For every enabled attribute, in catalog order:
//!
//! | selection   | chosen index                                  | emitted when                 |
//! |-------------|-----------------------------------------------|------------------------------|
//! | `Fixed(i)`  | `i`                                           | `i != last_emitted`          |
//! | `Change`    | uniform over the domain minus `last_emitted`  | always                       |
//! | `Random`    | uniform over the whole domain                 | `chosen != last_emitted`     |
//!
//! `last_emitted` is only recorded after the report carrying it has been
//! queued, and the whole computation runs under the arm's lock.

use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::Rng;
use tracing::debug;

use crate::attributes::{arm_label, attribute, Selection, ATTRIBUTES, IS_SELECTED};
use crate::messages::{AttributeChange, DiffReport, OutboundMessage};
use crate::queue::OutboundQueue;
use crate::state::{ArmState, ArmStateStore, StateError};

/// Arms exchanged by the swap pedal ("Arm 1" and "Arm 2")
pub const SWAP_PEDAL_ARMS: (usize, usize) = (0, 1);

/// Pick a value different from `previous`
///
/// Falls back to index 0 when the domain leaves no alternative.
pub fn choose_change<R: Rng + ?Sized>(
    domain_len: usize,
    previous: Option<usize>,
    rng: &mut R,
) -> usize {
    let candidates: Vec<usize> = (0..domain_len).filter(|&i| Some(i) != previous).collect();
    candidates.choose(rng).copied().unwrap_or(0)
}

/// Pick a value uniformly from the whole domain
pub fn choose_random<R: Rng + ?Sized>(domain_len: usize, rng: &mut R) -> usize {
    if domain_len == 0 {
        return 0;
    }
    rng.gen_range(0..domain_len)
}

/// Compute the change-set of one arm without recording anything
pub fn plan_changes<R: Rng + ?Sized>(state: &ArmState, rng: &mut R) -> Vec<AttributeChange> {
    let mut changes = Vec::new();

    for (attr_idx, entry) in state.iter() {
        if !entry.enabled {
            continue;
        }
        let attribute = &ATTRIBUTES[attr_idx];
        let previous = entry.last_emitted;

        let emitted = match entry.selection {
            Selection::Fixed(value) => (Some(value) != previous).then_some(value),
            Selection::Change => Some(choose_change(attribute.domain_len(), previous, rng)),
            Selection::Random => {
                let value = choose_random(attribute.domain_len(), rng);
                (Some(value) != previous).then_some(value)
            }
        };

        if let Some(value) = emitted {
            changes.push(AttributeChange { attribute, value });
        }
    }

    changes
}

/// Queues per-arm diff reports computed from the [`ArmStateStore`]
#[derive(Debug, Clone)]
pub struct DiffEngine {
    store: Arc<ArmStateStore>,
    queue: Arc<OutboundQueue>,
}

impl DiffEngine {
    /// Create an engine over a store, feeding a queue
    #[must_use]
    pub fn new(store: Arc<ArmStateStore>, queue: Arc<OutboundQueue>) -> Self {
        Self { store, queue }
    }

    /// The store this engine reads and records into
    #[must_use]
    pub fn store(&self) -> &Arc<ArmStateStore> {
        &self.store
    }

    /// Diff one arm and queue the report if anything changed
    ///
    /// Returns the queued report, or `None` for an empty change-set.
    pub fn send_arm_state(&self, arm: usize) -> Result<Option<DiffReport>, StateError> {
        self.send_arm_state_with(arm, &mut rand::thread_rng())
    }

    /// [`send_arm_state`](Self::send_arm_state) with a caller-supplied RNG
    pub fn send_arm_state_with<R: Rng + ?Sized>(
        &self,
        arm: usize,
        rng: &mut R,
    ) -> Result<Option<DiffReport>, StateError> {
        let mut state = self.store.lock(arm)?;
        self.diff_locked(arm, &mut state, rng)
    }

    /// Plan, queue and record one arm's report on an already locked state
    fn diff_locked<R: Rng + ?Sized>(
        &self,
        arm: usize,
        state: &mut ArmState,
        rng: &mut R,
    ) -> Result<Option<DiffReport>, StateError> {
        let changes = plan_changes(state, rng);
        if changes.is_empty() {
            debug!(arm = %arm_label(arm), "No attribute changed, nothing queued");
            return Ok(None);
        }

        let report = DiffReport {
            arm_index: arm,
            changes,
        };
        let json = OutboundMessage::Report(report.clone()).to_json()?;
        self.queue.enqueue(json);

        for change in &report.changes {
            if let Some(attr_idx) = ATTRIBUTES.iter().position(|a| a == change.attribute) {
                state.get_mut(attr_idx).last_emitted = Some(change.value);
            }
        }

        debug!(
            arm = %arm_label(arm),
            attributes = report.changes.len(),
            "Diff report queued"
        );
        Ok(Some(report))
    }

    /// Exchange `is_selected` between arm 1 and arm 2, then diff both
    ///
    /// Reports are queued arm 1 first.
    pub fn swap_pedal(&self) -> Result<(Option<DiffReport>, Option<DiffReport>), StateError> {
        self.swap_pedal_with(&mut rand::thread_rng())
    }

    /// [`swap_pedal`](Self::swap_pedal) with a caller-supplied RNG
    pub fn swap_pedal_with<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
    ) -> Result<(Option<DiffReport>, Option<DiffReport>), StateError> {
        let (first, second) = SWAP_PEDAL_ARMS;
        let (attr_idx, _) = attribute(IS_SELECTED)?;
        // Both arms stay locked until both reports are queued.
        let (mut a, mut b) = self.store.lock_pair(first, second)?;
        let a_selection = a.get(attr_idx).selection;
        a.get_mut(attr_idx).selection = b.get(attr_idx).selection;
        b.get_mut(attr_idx).selection = a_selection;

        let first_report = self.diff_locked(first, &mut a, rng)?;
        let second_report = self.diff_locked(second, &mut b, rng)?;
        Ok((first_report, second_report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn engine() -> (DiffEngine, Arc<ArmStateStore>, Arc<OutboundQueue>) {
        let store = Arc::new(ArmStateStore::new());
        let queue = Arc::new(OutboundQueue::new());
        (
            DiffEngine::new(Arc::clone(&store), Arc::clone(&queue)),
            store,
            queue,
        )
    }

    fn drain(queue: &OutboundQueue) -> Vec<serde_json::Value> {
        std::iter::from_fn(|| queue.try_dequeue())
            .map(|json| serde_json::from_str(&json).unwrap())
            .collect()
    }

    #[test]
    fn test_change_never_repeats_previous() {
        let mut rng = StdRng::seed_from_u64(7);
        for domain_len in [2, 3, 5, 17] {
            for previous in 0..domain_len {
                for _ in 0..1000 {
                    let value = choose_change(domain_len, Some(previous), &mut rng);
                    assert_ne!(value, previous);
                    assert!(value < domain_len);
                }
            }
        }
    }

    #[test]
    fn test_change_single_value_domain_falls_back_to_zero() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(choose_change(1, Some(0), &mut rng), 0);
        assert_eq!(choose_change(1, None, &mut rng), 0);
    }

    #[test]
    fn test_change_without_previous_covers_domain() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut seen = [false; 3];
        for _ in 0..200 {
            seen[choose_change(3, None, &mut rng)] = true;
        }
        assert_eq!(seen, [true; 3]);
    }

    #[test]
    fn test_disabled_attributes_never_reported() {
        let (engine, store, queue) = engine();
        store
            .set_attribute_selection(0, "esu_state", Selection::Change, false)
            .unwrap();
        store
            .set_attribute_selection(0, "is_drape", Selection::Fixed(1), true)
            .unwrap();

        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..20 {
            if let Some(report) = engine.send_arm_state_with(0, &mut rng).unwrap() {
                assert_eq!(report.value_of("esu_state"), None);
            }
        }
        for message in drain(&queue) {
            assert!(message.get("esu_state").is_none());
        }
        assert_eq!(store.last_emitted(0, "esu_state").unwrap(), None);
    }

    #[test]
    fn test_no_enabled_attributes_queues_nothing() {
        let (engine, _store, queue) = engine();
        let report = engine.send_arm_state(3).unwrap();
        assert!(report.is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_fixed_selection_is_idempotent() {
        let (engine, store, queue) = engine();
        store
            .set_attribute_selection(1, "homing_type", Selection::Fixed(3), true)
            .unwrap();

        let first = engine.send_arm_state(1).unwrap().unwrap();
        assert_eq!(first.value_of("homing_type"), Some(3));
        assert_eq!(store.last_emitted(1, "homing_type").unwrap(), Some(3));

        let second = engine.send_arm_state(1).unwrap();
        assert!(second.is_none());

        let messages = drain(&queue);
        assert_eq!(messages.len(), 1);
        assert_eq!(
            messages[0],
            serde_json::json!({"REPORT_TO_GUI": 0, "arm_index": 1, "homing_type": 3})
        );
    }

    #[test]
    fn test_fixed_selection_change_is_reported() {
        let (engine, store, _queue) = engine();
        store
            .set_attribute_selection(0, "manual_type", Selection::Fixed(1), true)
            .unwrap();
        engine.send_arm_state(0).unwrap();

        store.set_selection(0, "manual_type", Selection::Fixed(2)).unwrap();
        let report = engine.send_arm_state(0).unwrap().unwrap();
        assert_eq!(report.value_of("manual_type"), Some(2));
    }

    #[test]
    fn test_change_selection_always_reports_a_transition() {
        let (engine, store, queue) = engine();
        store
            .set_attribute_selection(2, "is_clutched", Selection::Change, true)
            .unwrap();

        let mut rng = StdRng::seed_from_u64(5);
        let mut previous = None;
        for _ in 0..50 {
            let report = engine.send_arm_state_with(2, &mut rng).unwrap().unwrap();
            let value = report.value_of("is_clutched").unwrap();
            assert_ne!(Some(value), previous);
            assert_eq!(store.last_emitted(2, "is_clutched").unwrap(), Some(value));
            previous = Some(value);
        }
        assert_eq!(queue.len(), 50);
    }

    #[test]
    fn test_random_selection_gates_repeats() {
        let (engine, store, queue) = engine();
        store
            .set_attribute_selection(0, "is_tracking", Selection::Random, true)
            .unwrap();

        let mut rng = StdRng::seed_from_u64(42);
        let mut silent = 0;
        let mut reported = 0;
        for _ in 0..200 {
            let before = store.last_emitted(0, "is_tracking").unwrap();
            match engine.send_arm_state_with(0, &mut rng).unwrap() {
                Some(report) => {
                    let value = report.value_of("is_tracking").unwrap();
                    assert_ne!(Some(value), before);
                    assert_eq!(store.last_emitted(0, "is_tracking").unwrap(), Some(value));
                    reported += 1;
                }
                None => {
                    assert_eq!(store.last_emitted(0, "is_tracking").unwrap(), before);
                    silent += 1;
                }
            }
        }
        // Two-value domain: repeats are common, and so are transitions.
        assert!(silent > 0);
        assert!(reported > 0);
        assert_eq!(queue.len(), reported);
    }

    #[test]
    fn test_report_keys_follow_catalog_order() {
        let (engine, store, queue) = engine();
        store
            .set_attribute_selection(3, "is_trocar", Selection::Fixed(1), true)
            .unwrap();
        store
            .set_attribute_selection(3, "is_connected", Selection::Fixed(0), true)
            .unwrap();
        store
            .set_attribute_selection(3, "esu_state", Selection::Fixed(1), true)
            .unwrap();

        engine.send_arm_state(3).unwrap();
        let json = queue.try_dequeue().unwrap();
        assert_eq!(
            json,
            r#"{"REPORT_TO_GUI":0,"arm_index":3,"is_connected":0,"esu_state":1,"is_trocar":1}"#
        );
    }

    #[test]
    fn test_unknown_arm() {
        let (engine, _store, _queue) = engine();
        assert!(matches!(
            engine.send_arm_state(9),
            Err(StateError::UnknownArm(9))
        ));
    }

    #[test]
    fn test_swap_pedal_exchanges_selection_and_reports_both_arms() {
        let (engine, store, queue) = engine();
        store
            .set_attribute_selection(0, IS_SELECTED, Selection::Fixed(1), true)
            .unwrap();
        store
            .set_attribute_selection(1, IS_SELECTED, Selection::Fixed(0), true)
            .unwrap();

        let (first, second) = engine.swap_pedal().unwrap();

        assert_eq!(store.selection(0, IS_SELECTED).unwrap(), Selection::Fixed(0));
        assert_eq!(store.selection(1, IS_SELECTED).unwrap(), Selection::Fixed(1));
        assert_eq!(first.unwrap().value_of(IS_SELECTED), Some(0));
        assert_eq!(second.unwrap().value_of(IS_SELECTED), Some(1));

        let messages = drain(&queue);
        assert_eq!(
            messages,
            vec![
                serde_json::json!({"REPORT_TO_GUI": 0, "arm_index": 0, "is_selected": 0}),
                serde_json::json!({"REPORT_TO_GUI": 0, "arm_index": 1, "is_selected": 1}),
            ]
        );
    }

    #[test]
    fn test_swap_pedal_keeps_enabled_flags() {
        let (engine, store, _queue) = engine();
        store
            .set_attribute_selection(0, IS_SELECTED, Selection::Fixed(1), true)
            .unwrap();
        store
            .set_attribute_selection(1, IS_SELECTED, Selection::Change, false)
            .unwrap();

        let (_, second) = engine.swap_pedal().unwrap();

        assert_eq!(store.selection(0, IS_SELECTED).unwrap(), Selection::Change);
        assert!(store.attribute_state(0, IS_SELECTED).unwrap().enabled);
        assert!(!store.attribute_state(1, IS_SELECTED).unwrap().enabled);
        assert!(second.is_none());
    }

    #[test]
    fn test_concurrent_swap_pedals_keep_pairs_together() {
        let (engine, store, queue) = engine();
        store
            .set_attribute_selection(0, IS_SELECTED, Selection::Change, true)
            .unwrap();
        store
            .set_attribute_selection(1, IS_SELECTED, Selection::Change, true)
            .unwrap();

        let workers: Vec<_> = (0..2)
            .map(|_| {
                let engine = engine.clone();
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        engine.swap_pedal().unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let arms: Vec<u64> = drain(&queue)
            .iter()
            .map(|m| m["arm_index"].as_u64().unwrap())
            .collect();
        assert_eq!(arms.len(), 2000);
        assert!(arms.chunks(2).all(|pair| pair == [0, 1]));
    }

    #[test]
    fn test_concurrent_diffs_on_one_arm_stay_consistent() {
        let (engine, store, queue) = engine();
        store
            .set_attribute_selection(0, "esu_state", Selection::Change, true)
            .unwrap();

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let engine = engine.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        engine.send_arm_state(0).unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        // Serialized under the arm lock: every queued value differs from the one before it.
        let values: Vec<u64> = drain(&queue)
            .iter()
            .map(|m| m["esu_state"].as_u64().unwrap())
            .collect();
        assert_eq!(values.len(), 200);
        assert!(values.windows(2).all(|w| w[0] != w[1]));
    }
}
