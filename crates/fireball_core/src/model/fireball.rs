//! Fireball record model.
//!
//! # Responsibility
//! - Hold one normalized fireball observation and its group membership.
//! - Provide field-level patches used by local edits and history replay.
//!
//! # Invariants
//! - `latitude` is in [-90, 90] and `longitude` in [-180, 180].
//! - `impact_energy >= 0`; magnitude derivation depends on it.
//! - Only `groups` changes after a record has been created by the app.

use super::group::GroupId;
use super::ValidationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Store-assigned record identity.
pub type FireballId = Uuid;

/// Highest value of the internal impact magnitude scale.
pub const MAX_IMPACT_MAGNITUDE: u8 = 8;

/// Normalized observation as decoded from the remote feed, before the store
/// assigns an identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FireballData {
    pub timestamp: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    /// Kilometers.
    pub altitude: f64,
    /// Kilometers per second.
    pub velocity: f64,
    /// Total radiated energy, 10^10 joules.
    pub radiated_energy: f64,
    /// Calculated total impact energy, kilotons.
    pub impact_energy: f64,
}

impl FireballData {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let numeric = [
            ("latitude", self.latitude),
            ("longitude", self.longitude),
            ("altitude", self.altitude),
            ("velocity", self.velocity),
            ("radiated_energy", self.radiated_energy),
            ("impact_energy", self.impact_energy),
        ];
        for (name, value) in numeric {
            if !value.is_finite() {
                return Err(ValidationError::NonFiniteValue(name));
            }
        }
        if !(-90.0..=90.0).contains(&self.latitude) {
            return Err(ValidationError::LatitudeOutOfRange(self.latitude));
        }
        if !(-180.0..=180.0).contains(&self.longitude) {
            return Err(ValidationError::LongitudeOutOfRange(self.longitude));
        }
        if self.impact_energy < 0.0 {
            return Err(ValidationError::NegativeImpactEnergy(self.impact_energy));
        }
        Ok(())
    }
}

/// Persisted fireball record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fireball {
    pub id: FireballId,
    #[serde(flatten)]
    pub data: FireballData,
    /// Groups this record belongs to (many-to-many).
    #[serde(default)]
    pub groups: BTreeSet<GroupId>,
}

impl Fireball {
    /// Creates a record with a freshly generated identity and no groups.
    pub fn new(data: FireballData) -> Self {
        Self::with_id(Uuid::new_v4(), data)
    }

    pub fn with_id(id: FireballId, data: FireballData) -> Self {
        Self {
            id,
            data,
            groups: BTreeSet::new(),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.data.validate()
    }

    /// Maps impact energy onto the 0..=8 scale used for color coding.
    ///
    /// Buckets are half-unit steps of `ln(impact_energy)` starting at -1.
    pub fn impact_energy_magnitude(&self) -> u8 {
        impact_energy_magnitude(self.data.impact_energy)
    }
}

pub fn impact_energy_magnitude(impact_energy: f64) -> u8 {
    let log_energy = impact_energy.ln();
    if log_energy.is_nan() || log_energy < -1.0 {
        return 0;
    }
    if log_energy > 2.5 {
        return MAX_IMPACT_MAGNITUDE;
    }
    let bucket = ((log_energy + 1.0) / 0.5).floor() as u8;
    // ln == 2.5 lands exactly on the upper edge of the last bounded bucket.
    (bucket + 1).min(MAX_IMPACT_MAGNITUDE - 1)
}

/// Named record field, used to track per-field merge state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FireballField {
    Timestamp,
    Latitude,
    Longitude,
    Altitude,
    Velocity,
    RadiatedEnergy,
    ImpactEnergy,
    Groups,
}

/// Partial record write. `None` means "field untouched".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FireballPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub velocity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub radiated_energy: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub impact_energy: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub groups: Option<BTreeSet<GroupId>>,
}

impl FireballPatch {
    /// Patch touching every field, used when an insert is re-delivered for a
    /// record that is already known.
    pub fn from_fireball(fireball: &Fireball) -> Self {
        let data = &fireball.data;
        Self {
            timestamp: Some(data.timestamp),
            latitude: Some(data.latitude),
            longitude: Some(data.longitude),
            altitude: Some(data.altitude),
            velocity: Some(data.velocity),
            radiated_energy: Some(data.radiated_energy),
            impact_energy: Some(data.impact_energy),
            groups: Some(fireball.groups.clone()),
        }
    }

    pub fn groups(groups: BTreeSet<GroupId>) -> Self {
        Self {
            groups: Some(groups),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.touched_fields().is_empty()
    }

    pub fn touched_fields(&self) -> Vec<FireballField> {
        let mut fields = Vec::new();
        if self.timestamp.is_some() {
            fields.push(FireballField::Timestamp);
        }
        if self.latitude.is_some() {
            fields.push(FireballField::Latitude);
        }
        if self.longitude.is_some() {
            fields.push(FireballField::Longitude);
        }
        if self.altitude.is_some() {
            fields.push(FireballField::Altitude);
        }
        if self.velocity.is_some() {
            fields.push(FireballField::Velocity);
        }
        if self.radiated_energy.is_some() {
            fields.push(FireballField::RadiatedEnergy);
        }
        if self.impact_energy.is_some() {
            fields.push(FireballField::ImpactEnergy);
        }
        if self.groups.is_some() {
            fields.push(FireballField::Groups);
        }
        fields
    }

    pub fn touches(&self, field: FireballField) -> bool {
        match field {
            FireballField::Timestamp => self.timestamp.is_some(),
            FireballField::Latitude => self.latitude.is_some(),
            FireballField::Longitude => self.longitude.is_some(),
            FireballField::Altitude => self.altitude.is_some(),
            FireballField::Velocity => self.velocity.is_some(),
            FireballField::RadiatedEnergy => self.radiated_energy.is_some(),
            FireballField::ImpactEnergy => self.impact_energy.is_some(),
            FireballField::Groups => self.groups.is_some(),
        }
    }

    /// Drops every touched field for which `keep` returns `false`.
    pub fn retain(&mut self, mut keep: impl FnMut(FireballField) -> bool) {
        for field in self.touched_fields() {
            if !keep(field) {
                self.clear(field);
            }
        }
    }

    pub fn clear(&mut self, field: FireballField) {
        match field {
            FireballField::Timestamp => self.timestamp = None,
            FireballField::Latitude => self.latitude = None,
            FireballField::Longitude => self.longitude = None,
            FireballField::Altitude => self.altitude = None,
            FireballField::Velocity => self.velocity = None,
            FireballField::RadiatedEnergy => self.radiated_energy = None,
            FireballField::ImpactEnergy => self.impact_energy = None,
            FireballField::Groups => self.groups = None,
        }
    }

    /// Layers `newer` on top of `self`; fields set in `newer` win.
    pub fn absorb(&mut self, newer: &FireballPatch) {
        if newer.timestamp.is_some() {
            self.timestamp = newer.timestamp;
        }
        if newer.latitude.is_some() {
            self.latitude = newer.latitude;
        }
        if newer.longitude.is_some() {
            self.longitude = newer.longitude;
        }
        if newer.altitude.is_some() {
            self.altitude = newer.altitude;
        }
        if newer.velocity.is_some() {
            self.velocity = newer.velocity;
        }
        if newer.radiated_energy.is_some() {
            self.radiated_energy = newer.radiated_energy;
        }
        if newer.impact_energy.is_some() {
            self.impact_energy = newer.impact_energy;
        }
        if let Some(groups) = newer.groups.as_ref() {
            self.groups = Some(groups.clone());
        }
    }

    pub fn apply_to(&self, fireball: &mut Fireball) {
        let data = &mut fireball.data;
        if let Some(value) = self.timestamp {
            data.timestamp = value;
        }
        if let Some(value) = self.latitude {
            data.latitude = value;
        }
        if let Some(value) = self.longitude {
            data.longitude = value;
        }
        if let Some(value) = self.altitude {
            data.altitude = value;
        }
        if let Some(value) = self.velocity {
            data.velocity = value;
        }
        if let Some(value) = self.radiated_energy {
            data.radiated_energy = value;
        }
        if let Some(value) = self.impact_energy {
            data.impact_energy = value;
        }
        if let Some(groups) = self.groups.as_ref() {
            fireball.groups = groups.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{impact_energy_magnitude, Fireball, FireballData, FireballField, FireballPatch};
    use crate::model::ValidationError;
    use chrono::{TimeZone, Utc};

    fn sample() -> FireballData {
        FireballData {
            timestamp: Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
            latitude: 10.0,
            longitude: 20.0,
            altitude: 5.0,
            velocity: 300.0,
            radiated_energy: 1.0,
            impact_energy: 2.0,
        }
    }

    #[test]
    fn validate_rejects_out_of_range_coordinates() {
        let mut data = sample();
        data.latitude = 90.5;
        assert_eq!(
            data.validate(),
            Err(ValidationError::LatitudeOutOfRange(90.5))
        );

        let mut data = sample();
        data.longitude = -180.5;
        assert_eq!(
            data.validate(),
            Err(ValidationError::LongitudeOutOfRange(-180.5))
        );
    }

    #[test]
    fn validate_rejects_negative_impact_and_nan() {
        let mut data = sample();
        data.impact_energy = -0.1;
        assert!(matches!(
            data.validate(),
            Err(ValidationError::NegativeImpactEnergy(_))
        ));

        let mut data = sample();
        data.velocity = f64::NAN;
        assert_eq!(
            data.validate(),
            Err(ValidationError::NonFiniteValue("velocity"))
        );
    }

    #[test]
    fn magnitude_buckets_follow_log_energy() {
        assert_eq!(impact_energy_magnitude(0.0), 0);
        assert_eq!(impact_energy_magnitude(0.3), 0);
        assert_eq!(impact_energy_magnitude(0.5), 1);
        assert_eq!(impact_energy_magnitude(0.8), 2);
        assert_eq!(impact_energy_magnitude(1.0), 3);
        assert_eq!(impact_energy_magnitude(2.0), 4);
        assert_eq!(impact_energy_magnitude(3.0), 5);
        assert_eq!(impact_energy_magnitude(5.0), 6);
        assert_eq!(impact_energy_magnitude(10.0), 7);
        assert_eq!(impact_energy_magnitude(12.0), 7);
        assert_eq!(impact_energy_magnitude(13.0), 8);
        assert_eq!(impact_energy_magnitude(400.0), 8);
    }

    #[test]
    fn patch_retain_and_absorb_work_per_field() {
        let mut patch = FireballPatch {
            latitude: Some(1.0),
            velocity: Some(2.0),
            ..FireballPatch::default()
        };
        patch.retain(|field| field != FireballField::Velocity);
        assert_eq!(patch.touched_fields(), vec![FireballField::Latitude]);

        patch.absorb(&FireballPatch {
            latitude: Some(3.0),
            altitude: Some(4.0),
            ..FireballPatch::default()
        });
        assert_eq!(patch.latitude, Some(3.0));
        assert_eq!(patch.altitude, Some(4.0));

        let mut fireball = Fireball::new(sample());
        patch.apply_to(&mut fireball);
        assert_eq!(fireball.data.latitude, 3.0);
        assert_eq!(fireball.data.altitude, 4.0);
        assert_eq!(fireball.data.velocity, 300.0);
    }
}
