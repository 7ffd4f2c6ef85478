//! Arm State Store
//!
//! Per-arm, per-attribute selection mode, enabled flag and last-emitted
//! value. Entries for every arm and attribute exist from construction:
//! mode `random`, disabled, nothing emitted yet.
//!
//! # Locking
//!
//! Each arm sits behind its own mutex. The diff engine holds an arm's lock
//! for the whole read-selection → compute → enqueue → record sequence, so
//! concurrent diffs of the same arm (operator vs. scheduler) serialize
//! instead of interleaving. Different arms never contend.

use parking_lot::{Mutex, MutexGuard};
use thiserror::Error;

use crate::attributes::{attribute, Selection, ATTRIBUTES, NUM_ARMS};

/// Errors raised by selection commands and diffing
#[derive(Debug, Error)]
pub enum StateError {
    /// Arm index outside `0..NUM_ARMS`
    #[error("Unknown arm index {0}")]
    UnknownArm(usize),

    /// Attribute name not in the catalog
    #[error("Unknown attribute: {0}")]
    UnknownAttribute(String),

    /// Value text that is neither a meta-option nor a real value
    #[error("Unknown value {value:?} for attribute {attribute}")]
    UnknownValue {
        /// Attribute the value was given for
        attribute: String,
        /// The rejected text
        value: String,
    },

    /// Fixed selection pointing past the end of the attribute's domain
    #[error("Value index {index} out of range for attribute {attribute} ({len} values)")]
    ValueOutOfRange {
        /// Attribute the selection was given for
        attribute: &'static str,
        /// The rejected index
        index: usize,
        /// Size of the attribute's domain
        len: usize,
    },

    /// A diff report could not be serialized
    #[error("Failed to serialize diff report: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// State of one attribute on one arm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AttributeState {
    /// How the next value is chosen
    pub selection: Selection,
    /// Disabled attributes are never reported
    pub enabled: bool,
    /// Domain position last put on the queue, if any
    pub last_emitted: Option<usize>,
}

/// State of every attribute of one arm, parallel to [`ATTRIBUTES`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArmState {
    attributes: Vec<AttributeState>,
}

impl Default for ArmState {
    fn default() -> Self {
        Self {
            attributes: vec![AttributeState::default(); ATTRIBUTES.len()],
        }
    }
}

impl ArmState {
    /// State of the attribute at a catalog position
    #[must_use]
    pub fn get(&self, attr_idx: usize) -> &AttributeState {
        &self.attributes[attr_idx]
    }

    /// Mutable state of the attribute at a catalog position
    pub fn get_mut(&mut self, attr_idx: usize) -> &mut AttributeState {
        &mut self.attributes[attr_idx]
    }

    /// Iterate `(catalog position, state)` pairs in report order
    pub fn iter(&self) -> impl Iterator<Item = (usize, &AttributeState)> {
        self.attributes.iter().enumerate()
    }

    /// Whether any attribute is enabled
    #[must_use]
    pub fn has_enabled(&self) -> bool {
        self.attributes.iter().any(|a| a.enabled)
    }
}

/// Catalog position of `attribute_name`, rejecting fixed values outside its domain
fn checked_selection(attribute_name: &str, selection: Selection) -> Result<usize, StateError> {
    let (attr_idx, attr) = attribute(attribute_name)?;
    match selection {
        Selection::Fixed(index) if index >= attr.domain_len() => {
            Err(StateError::ValueOutOfRange {
                attribute: attr.name(),
                index,
                len: attr.domain_len(),
            })
        }
        _ => Ok(attr_idx),
    }
}

/// Per-arm state for all arms
#[derive(Debug)]
pub struct ArmStateStore {
    arms: Vec<Mutex<ArmState>>,
}

impl Default for ArmStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ArmStateStore {
    /// Create the store with every arm at its initial state
    #[must_use]
    pub fn new() -> Self {
        Self {
            arms: (0..NUM_ARMS).map(|_| Mutex::new(ArmState::default())).collect(),
        }
    }

    /// Number of arms in the store
    #[must_use]
    pub fn arm_count(&self) -> usize {
        self.arms.len()
    }

    /// Lock one arm for a read-modify-write sequence
    pub fn lock(&self, arm: usize) -> Result<MutexGuard<'_, ArmState>, StateError> {
        self.arms
            .get(arm)
            .map(|arm| arm.lock())
            .ok_or(StateError::UnknownArm(arm))
    }

    /// Lock two distinct arms, always in ascending index order
    pub fn lock_pair(
        &self,
        a: usize,
        b: usize,
    ) -> Result<(MutexGuard<'_, ArmState>, MutexGuard<'_, ArmState>), StateError> {
        if a == b {
            return Err(StateError::UnknownArm(b));
        }
        let (low, high) = if a < b { (a, b) } else { (b, a) };
        let low_guard = self.lock(low)?;
        let high_guard = self.lock(high)?;
        if a < b {
            Ok((low_guard, high_guard))
        } else {
            Ok((high_guard, low_guard))
        }
    }

    /// Set an attribute's selection mode and enabled flag
    pub fn set_attribute_selection(
        &self,
        arm: usize,
        attribute_name: &str,
        selection: Selection,
        enabled: bool,
    ) -> Result<(), StateError> {
        let attr_idx = checked_selection(attribute_name, selection)?;
        let mut state = self.lock(arm)?;
        let entry = state.get_mut(attr_idx);
        entry.selection = selection;
        entry.enabled = enabled;
        Ok(())
    }

    /// Change only the selection mode, keeping the enabled flag
    pub fn set_selection(
        &self,
        arm: usize,
        attribute_name: &str,
        selection: Selection,
    ) -> Result<(), StateError> {
        let attr_idx = checked_selection(attribute_name, selection)?;
        self.lock(arm)?.get_mut(attr_idx).selection = selection;
        Ok(())
    }

    /// Change only the enabled flag, keeping the selection mode
    pub fn set_enabled(
        &self,
        arm: usize,
        attribute_name: &str,
        enabled: bool,
    ) -> Result<(), StateError> {
        let (attr_idx, _) = attribute(attribute_name)?;
        self.lock(arm)?.get_mut(attr_idx).enabled = enabled;
        Ok(())
    }

    /// Current state of one attribute
    pub fn attribute_state(
        &self,
        arm: usize,
        attribute_name: &str,
    ) -> Result<AttributeState, StateError> {
        let (attr_idx, _) = attribute(attribute_name)?;
        Ok(*self.lock(arm)?.get(attr_idx))
    }

    /// Current selection mode of one attribute
    pub fn selection(&self, arm: usize, attribute_name: &str) -> Result<Selection, StateError> {
        self.attribute_state(arm, attribute_name)
            .map(|s| s.selection)
    }

    /// Whether one attribute takes part in diffs
    pub fn is_enabled(&self, arm: usize, attribute_name: &str) -> Result<bool, StateError> {
        self.attribute_state(arm, attribute_name)
            .map(|s| s.enabled)
    }

    /// Last emitted domain position of one attribute
    pub fn last_emitted(
        &self,
        arm: usize,
        attribute_name: &str,
    ) -> Result<Option<usize>, StateError> {
        self.attribute_state(arm, attribute_name)
            .map(|s| s.last_emitted)
    }

    /// Copy of one arm's full state
    pub fn snapshot(&self, arm: usize) -> Result<ArmState, StateError> {
        Ok(self.lock(arm)?.clone())
    }

    /// Arms with at least one enabled attribute, ascending
    #[must_use]
    pub fn active_arms(&self) -> Vec<usize> {
        self.arms
            .iter()
            .enumerate()
            .filter(|(_, arm)| arm.lock().has_enabled())
            .map(|(idx, _)| idx)
            .collect()
    }
}
