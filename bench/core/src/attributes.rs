//! Arm Attribute Catalog
//!
//! Static description of every enumerable field an arm reports, plus the
//! selection modes an operator can pick for each of them.
//!
//! Each attribute has an ordered *real-value domain*. The wire protocol
//! never carries the value text, only its position in that domain, so the
//! order below is part of the protocol and must not be rearranged.
//!
//! Two meta-options sit next to the real values in the operator surface:
//!
//! - `change`: emit a value different from the last one sent
//! - `random`: emit a uniformly chosen value, staying silent on a repeat

use std::fmt;

use crate::state::StateError;

/// Number of arms simulated for the lifetime of the process
pub const NUM_ARMS: usize = 4;

/// Meta-option text selecting [`Selection::Change`]
pub const META_CHANGE: &str = "change";

/// Meta-option text selecting [`Selection::Random`]
pub const META_RANDOM: &str = "random";

/// Attribute exchanged between arm 1 and arm 2 by the swap pedal
pub const IS_SELECTED: &str = "is_selected";

const BOOLEAN: &[&str] = &["false", "true"];

/// A named enumerable state field of an arm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Attribute {
    name: &'static str,
    values: &'static [&'static str],
}

impl Attribute {
    const fn new(name: &'static str, values: &'static [&'static str]) -> Self {
        Self { name, values }
    }

    /// Attribute name, also used as the JSON key of a diff report
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Real-value domain in protocol order
    #[must_use]
    pub const fn values(&self) -> &'static [&'static str] {
        self.values
    }

    /// Size of the real-value domain
    #[must_use]
    pub const fn domain_len(&self) -> usize {
        self.values.len()
    }

    /// Position of a literal value within the real-value domain
    #[must_use]
    pub fn index_of(&self, literal: &str) -> Option<usize> {
        self.values.iter().position(|v| *v == literal)
    }

    /// Literal value at a domain position
    #[must_use]
    pub fn value_at(&self, index: usize) -> Option<&'static str> {
        self.values.get(index).copied()
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Every attribute an arm carries, in report order
pub static ATTRIBUTES: [Attribute; 12] = [
    Attribute::new("is_connected", BOOLEAN),
    Attribute::new(IS_SELECTED, BOOLEAN),
    Attribute::new("is_tracking", BOOLEAN),
    Attribute::new("is_instrument", BOOLEAN),
    Attribute::new(
        "instrument_type",
        &[
            "none",
            "fene forceps",
            "mary dissector",
            "pre dissector",
            "clinch forceps",
            "clip applier",
            "needle holder",
            "pre needle",
            "suture needle",
            "mono hook",
            "mono spatular",
            "mono pre dissector",
            "mono scissors",
            "bi fene forceps",
            "bi mary dissector",
            "bi pre dissector",
            "bi blunt dissector",
        ],
    ),
    Attribute::new("endoscope_type", &["none", "0 endoscope", "30 endoscope"]),
    Attribute::new(
        "homing_type",
        &["unknown", "done", "drape", "end effector", "slide"],
    ),
    Attribute::new("is_clutched", BOOLEAN),
    Attribute::new("esu_state", &["none", "coag", "cut"]),
    Attribute::new("manual_type", &["none", "op", "su", "slide"]),
    Attribute::new("is_drape", BOOLEAN),
    Attribute::new("is_trocar", BOOLEAN),
];

/// Look up an attribute's catalog position by name (case-insensitive)
#[must_use]
pub fn attribute_index(name: &str) -> Option<usize> {
    ATTRIBUTES
        .iter()
        .position(|attr| attr.name.eq_ignore_ascii_case(name))
}

/// Look up an attribute by name (case-insensitive)
pub fn attribute(name: &str) -> Result<(usize, &'static Attribute), StateError> {
    attribute_index(name)
        .map(|idx| (idx, &ATTRIBUTES[idx]))
        .ok_or_else(|| StateError::UnknownAttribute(name.to_string()))
}

/// How the next emitted value of an attribute is determined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Selection {
    /// A literal value, given as its position in the real-value domain
    Fixed(usize),
    /// Always emit, forcing a value different from the last one sent
    Change,
    /// Uniform pick over the whole domain; a repeat is not emitted
    #[default]
    Random,
}

impl Selection {
    /// Parse operator text (`change`, `random`, or a literal real value)
    pub fn parse(attribute: &Attribute, text: &str) -> Result<Self, StateError> {
        let text = text.trim();
        if text.eq_ignore_ascii_case(META_CHANGE) {
            return Ok(Self::Change);
        }
        if text.eq_ignore_ascii_case(META_RANDOM) {
            return Ok(Self::Random);
        }
        attribute
            .index_of(text)
            .map(Self::Fixed)
            .ok_or_else(|| StateError::UnknownValue {
                attribute: attribute.name().to_string(),
                value: text.to_string(),
            })
    }

    /// Operator-facing text of this selection for the given attribute
    #[must_use]
    pub fn label(&self, attribute: &Attribute) -> &'static str {
        match self {
            Self::Fixed(idx) => attribute.value_at(*idx).unwrap_or("?"),
            Self::Change => META_CHANGE,
            Self::Random => META_RANDOM,
        }
    }
}

/// Operator-facing arm label ("Arm 1" for index 0)
#[must_use]
pub fn arm_label(arm: usize) -> String {
    format!("Arm {}", arm + 1)
}
