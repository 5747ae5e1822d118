//! # Wavelength intervals and their registry
//!
//! Every region that ends up in a pixel mask is first declared as a named, closed wavelength
//! interval `[start, end]` (in Å, vacuum, observer frame). Intervals come from three sources,
//! distinguished by [`RegionKind`]:
//!
//! * **Telluric** – produced by the telluric model; widened by the BERV amplitude and shifted per
//!   frame before being rasterized,
//! * **Activity** – stellar activity indicators ([`activity_lines`]); rasterized as is,
//! * **User** – extra regions from the configuration; rasterized as is.
//!
//! Names are unique within a partition's [`IntervalRegistry`]; registering the same name twice is
//! a configuration error.

use serde::{Deserialize, Serialize};

use crate::constants::{Angstrom, KmPerSec, VLIGHT};
use crate::specstack_errors::SpecStackError;

/// Origin of a masked region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegionKind {
    Telluric,
    Activity,
    User,
}

/// Closed wavelength interval `[start, end]`, in Å.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WavelengthInterval {
    start: Angstrom,
    end: Angstrom,
}

impl WavelengthInterval {
    /// Return
    /// ----------
    /// * The interval, or [`SpecStackError::InvalidParameter`] if a bound is not finite, not
    ///   positive, or `start > end`.
    pub fn new(start: Angstrom, end: Angstrom) -> Result<Self, SpecStackError> {
        if !start.is_finite() || !end.is_finite() || start <= 0.0 || start > end {
            return Err(SpecStackError::InvalidParameter(format!(
                "invalid wavelength interval [{start}, {end}]"
            )));
        }
        Ok(WavelengthInterval { start, end })
    }

    /// Interval of half-width `half_width` around `center`.
    pub fn around(center: Angstrom, half_width: Angstrom) -> Result<Self, SpecStackError> {
        Self::new(center - half_width, center + half_width)
    }

    pub fn start(&self) -> Angstrom {
        self.start
    }

    pub fn end(&self) -> Angstrom {
        self.end
    }

    pub fn width(&self) -> Angstrom {
        self.end - self.start
    }

    pub fn contains(&self, wavelength: Angstrom) -> bool {
        wavelength >= self.start && wavelength <= self.end
    }

    pub fn overlaps(&self, other: &WavelengthInterval) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Widen both edges by the Doppler displacement of a velocity `v_max`:
    /// `Δλ = λ · v_max / c`, evaluated at each edge.
    pub fn widened(&self, v_max: KmPerSec) -> WavelengthInterval {
        let factor = v_max.abs() / VLIGHT;
        WavelengthInterval {
            start: self.start - self.start * factor,
            end: self.end + self.end * factor,
        }
    }

    /// Doppler-shift the interval by a barycentric velocity: `λ' = λ (1 + v / c)`.
    pub fn shifted(&self, berv: KmPerSec) -> WavelengthInterval {
        let factor = 1.0 + berv / VLIGHT;
        WavelengthInterval {
            start: self.start * factor,
            end: self.end * factor,
        }
    }
}

/// A registered interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedInterval {
    pub name: String,
    pub kind: RegionKind,
    pub interval: WavelengthInterval,
}

/// Stellar activity indicators masked by default: `(name, center, half-width)` in Å (vacuum).
pub fn activity_lines() -> [(&'static str, Angstrom, Angstrom); 9] {
    [
        ("CaII_K", 3934.777, 1.0),
        ("CaII_H", 3969.591, 1.0),
        ("HeI_D3", 5877.249, 0.5),
        ("NaI_D2", 5891.583, 0.5),
        ("NaI_D1", 5897.558, 0.5),
        ("H_alpha", 6564.614, 1.5),
        ("CaII_IRT1", 8500.35, 1.0),
        ("CaII_IRT2", 8544.44, 1.0),
        ("CaII_IRT3", 8664.52, 1.0),
    ]
}

/// Named intervals declared for one partition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IntervalRegistry {
    entries: Vec<NamedInterval>,
}

impl IntervalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-filled with [`activity_lines`].
    pub fn with_activity_lines() -> Result<Self, SpecStackError> {
        let mut registry = Self::new();
        for (name, center, half_width) in activity_lines() {
            registry.register(
                name,
                RegionKind::Activity,
                WavelengthInterval::around(center, half_width)?,
            )?;
        }
        Ok(registry)
    }

    /// Declare a new interval.
    ///
    /// Return
    /// ----------
    /// * [`SpecStackError::DuplicateInterval`] if `name` is already registered.
    pub fn register(
        &mut self,
        name: &str,
        kind: RegionKind,
        interval: WavelengthInterval,
    ) -> Result<(), SpecStackError> {
        if self.entries.iter().any(|e| e.name == name) {
            return Err(SpecStackError::DuplicateInterval(name.to_string()));
        }
        self.entries.push(NamedInterval {
            name: name.to_string(),
            kind,
            interval,
        });
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&NamedInterval> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NamedInterval> {
        self.entries.iter()
    }

    pub fn of_kind(&self, kind: RegionKind) -> impl Iterator<Item = &WavelengthInterval> {
        self.entries
            .iter()
            .filter(move |e| e.kind == kind)
            .map(|e| &e.interval)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
