//! Outbound Messages
//!
//! JSON payloads the bench sends to its peer. There are exactly two shapes:
//!
//! ```text
//! {"SOCKET_ENABLE":true}                                     once per new peer
//! {"REPORT_TO_GUI":0,"arm_index":1,"is_selected":1,...}      one per non-empty diff
//! ```
//!
//! Key order of a report follows the attribute catalog, so serialization is
//! written by hand instead of going through a map type.

use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::attributes::Attribute;

/// Key of the greeting message
pub const SOCKET_ENABLE_KEY: &str = "SOCKET_ENABLE";

/// Leading key of every diff report
pub const REPORT_KEY: &str = "REPORT_TO_GUI";

/// Key carrying the zero-based arm index in a diff report
pub const ARM_INDEX_KEY: &str = "arm_index";

/// One emitted attribute value inside a diff report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeChange {
    /// The attribute that changed
    pub attribute: &'static Attribute,
    /// Position of the emitted value in the attribute's real-value domain
    pub value: usize,
}

/// Change-set for one arm, ready to be queued
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffReport {
    /// Zero-based arm index
    pub arm_index: usize,
    /// Emitted attributes in catalog order
    pub changes: Vec<AttributeChange>,
}

impl DiffReport {
    /// Emitted value for an attribute, if the report carries it
    #[must_use]
    pub fn value_of(&self, name: &str) -> Option<usize> {
        self.changes
            .iter()
            .find(|c| c.attribute.name() == name)
            .map(|c| c.value)
    }

    /// Whether the report carries no attribute at all
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

impl Serialize for DiffReport {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.changes.len() + 2))?;
        map.serialize_entry(REPORT_KEY, &0)?;
        map.serialize_entry(ARM_INDEX_KEY, &self.arm_index)?;
        for change in &self.changes {
            map.serialize_entry(&change.attribute.name().to_lowercase(), &change.value)?;
        }
        map.end()
    }
}

/// A message queued for the peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    /// Sent once whenever a new peer is installed
    Greeting,
    /// Attribute change-set for one arm
    Report(DiffReport),
}

impl OutboundMessage {
    /// Serialize to the JSON text carried in a frame payload
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl Serialize for OutboundMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Greeting => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry(SOCKET_ENABLE_KEY, &true)?;
                map.end()
            }
            Self::Report(report) => report.serialize(serializer),
        }
    }
}
