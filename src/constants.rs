//! # Constants and type definitions for specstack
//!
//! This module centralizes the **physical constants**, **unit aliases**, and **identifier types**
//! shared by the mask builder, the telluric model and the template builder.
//!
//! ## Overview
//!
//! - Physical constants (speed of light, Earth orbital/rotational velocity amplitudes)
//! - Unit aliases used across the crate (Å, km/s, MJD)
//! - Stable identifiers for frames and sub-instruments
//!
//! Identifiers are derived with UUIDv5 so that the same source path or configuration always maps to
//! the same identifier, across runs and across processes.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// -------------------------------------------------------------------------------------------------
// Physical constants
// -------------------------------------------------------------------------------------------------

/// Speed of light in km/s
pub const VLIGHT: f64 = 2.99792458e5;

/// Mean orbital velocity of the Earth around the barycenter, in km/s
pub const EARTH_ORBITAL_VELOCITY: f64 = 29.78;

/// Equatorial rotational velocity of the Earth's surface, in km/s
pub const EARTH_ROTATION_VELOCITY: f64 = 0.465;

/// Default maximum yearly BERV amplitude used to widen telluric features, in km/s
pub const DEFAULT_MAX_BERV: f64 = 30.0;

/// Version tag written next to every persisted template
pub const STORAGE_FORMAT_VERSION: u32 = 1;

// -------------------------------------------------------------------------------------------------
// Type aliases
// -------------------------------------------------------------------------------------------------

/// Wavelength in Ångström
pub type Angstrom = f64;
/// Velocity in km/s
pub type KmPerSec = f64;
/// Modified Julian Date (days)
pub type MJD = f64;

// -------------------------------------------------------------------------------------------------
// Identifiers
// -------------------------------------------------------------------------------------------------

/// Namespace used to derive every UUIDv5 of the crate.
const SPECSTACK_NAMESPACE: Uuid = Uuid::from_u128(0x6c1f_3b2a_8d4e_4f70_9a1c_52e7_b0d9_13aa);

/// Stable identity of an observation, derived from its source path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FrameId(Uuid);

impl FrameId {
    /// Derive the identifier of the observation stored at `source_path`.
    pub fn from_path(source_path: &str) -> Self {
        FrameId(Uuid::new_v5(&SPECSTACK_NAMESPACE, source_path.as_bytes()))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Name of a sub-instrument (e.g. `ESPRESSO19`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubInstrumentId(String);

impl SubInstrumentId {
    pub fn new(name: impl Into<String>) -> Self {
        SubInstrumentId(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubInstrumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SubInstrumentId {
    fn from(s: &str) -> Self {
        SubInstrumentId(s.to_string())
    }
}

/// Fingerprint of every configuration parameter that affects numeric output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConfigFingerprint(Uuid);

impl ConfigFingerprint {
    /// Hash a canonical byte representation of a configuration.
    pub fn from_canonical_bytes(bytes: &[u8]) -> Self {
        ConfigFingerprint(Uuid::new_v5(&SPECSTACK_NAMESPACE, bytes))
    }
}

impl fmt::Display for ConfigFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // 12 hex digits are enough to keep file names short and collisions unlikely
        write!(f, "{}", &self.0.simple().to_string()[..12])
    }
}
