//! Objectives: named units of negotiable or discoverable capability.
//!
//! The value carried by an objective is an opaque CBOR byte blob; the
//! engine never interprets it. Flag bits follow the GRASP wire encoding:
//! bit 0 discovery, bit 1 negotiation, bit 2 synchronization, bit 3
//! dry-run negotiation.

use serde::{Deserialize, Serialize};

use crate::error::{GraspError, GraspResult};
use crate::locator::Locator;
use crate::DEF_LOOP_COUNT;

const B_DISC: u8 = 1 << 0;
const B_NEG: u8 = 1 << 1;
const B_SYNCH: u8 = 1 << 2;
const B_DRY: u8 = 1 << 3;

/// Capability flags of an objective, carried on the wire as a flag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub struct ObjectiveFlags {
    /// Valid for discovery. Always set on the wire.
    pub discoverable: bool,
    /// Supports negotiation.
    pub negotiable: bool,
    /// Supports synchronization (and flooding).
    pub synchronizing: bool,
    /// Supports dry-run negotiation. Requires `negotiable`.
    pub dry_run: bool,
}

impl ObjectiveFlags {
    /// Flags for a negotiable objective.
    pub fn negotiation() -> Self {
        Self {
            discoverable: true,
            negotiable: true,
            ..Default::default()
        }
    }

    /// Flags for a synchronization-only objective.
    pub fn synchronization() -> Self {
        Self {
            discoverable: true,
            synchronizing: true,
            ..Default::default()
        }
    }

    /// Structural validity: negotiation and synchronization are mutually
    /// exclusive, and dry-run only makes sense with negotiation.
    pub fn validate(&self) -> GraspResult<()> {
        if self.negotiable && self.synchronizing {
            return Err(GraspError::InvalidArgument(
                "objective cannot support both negotiation and synchronization".into(),
            ));
        }
        if self.dry_run && !self.negotiable {
            return Err(GraspError::InvalidArgument(
                "dry-run allowed only with negotiation".into(),
            ));
        }
        Ok(())
    }
}

impl From<ObjectiveFlags> for u8 {
    fn from(f: ObjectiveFlags) -> u8 {
        let mut w = 0;
        if f.discoverable {
            w |= B_DISC;
        }
        if f.negotiable {
            w |= B_NEG;
        }
        if f.synchronizing {
            w |= B_SYNCH;
        }
        if f.dry_run {
            w |= B_DRY;
        }
        w
    }
}

impl TryFrom<u8> for ObjectiveFlags {
    type Error = GraspError;

    fn try_from(w: u8) -> Result<Self, Self::Error> {
        if w & !(B_DISC | B_NEG | B_SYNCH | B_DRY) != 0 {
            return Err(GraspError::InvalidArgument(format!(
                "unknown objective flag bits: {w:#04x}"
            )));
        }
        Ok(Self {
            discoverable: w & B_DISC != 0,
            negotiable: w & B_NEG != 0,
            synchronizing: w & B_SYNCH != 0,
            dry_run: w & B_DRY != 0,
        })
    }
}

/// A GRASP objective.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Objective {
    /// Unique name of the objective.
    pub name: String,
    /// Capability flags.
    pub flags: ObjectiveFlags,
    /// Remaining relay hops; decremented on every relay or negotiation
    /// step received. Zero stops relaying (loop prevention).
    pub loop_count: u8,
    /// Opaque CBOR-encoded value.
    pub value: Vec<u8>,
}

impl Objective {
    /// Create a validated objective with the default loop count and an
    /// empty value.
    pub fn new(name: impl Into<String>, flags: ObjectiveFlags) -> GraspResult<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(GraspError::InvalidArgument(
                "objective name must not be empty".into(),
            ));
        }
        flags.validate()?;
        Ok(Self {
            name,
            flags,
            loop_count: DEF_LOOP_COUNT,
            value: Vec::new(),
        })
    }

    /// Replace the CBOR value blob.
    pub fn with_value(mut self, value: Vec<u8>) -> Self {
        self.value = value;
        self
    }

    /// Override the starting loop count.
    pub fn with_loop_count(mut self, loop_count: u8) -> Self {
        self.loop_count = loop_count;
        self
    }
}

/// An objective bound to the locator of the ASA that originated or last
/// flooded it, so recipients know its provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedObjective {
    pub objective: Objective,
    pub source: Locator,
}

impl TaggedObjective {
    pub fn new(objective: Objective, source: Locator) -> Self {
        Self { objective, source }
    }
}
