//! Record, group and change-history model.
//!
//! # Responsibility
//! - Define plain value types shared by the store, sync engines and view.
//! - Express partial writes as field-level patches, the unit of merge.
//!
//! # Invariants
//! - Identities are store-assigned UUIDs and never reused.
//! - Records are immutable after creation except for group membership.

pub mod change;
pub mod fireball;
pub mod group;

use std::error::Error;
use std::fmt::{Display, Formatter};

/// Model invariant violation.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    LatitudeOutOfRange(f64),
    LongitudeOutOfRange(f64),
    NegativeImpactEnergy(f64),
    NonFiniteValue(&'static str),
    EmptyGroupName,
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LatitudeOutOfRange(value) => {
                write!(f, "latitude {value} is outside [-90, 90]")
            }
            Self::LongitudeOutOfRange(value) => {
                write!(f, "longitude {value} is outside [-180, 180]")
            }
            Self::NegativeImpactEnergy(value) => {
                write!(f, "impact energy {value} must not be negative")
            }
            Self::NonFiniteValue(field) => write!(f, "{field} must be a finite number"),
            Self::EmptyGroupName => write!(f, "group name cannot be empty"),
        }
    }
}

impl Error for ValidationError {}
