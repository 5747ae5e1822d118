//! # Instrument time divisions
//!
//! Every spectrograph goes through interventions (fibre changes, detector swaps, warm-ups) that
//! change its instrumental profile. Observations taken between two interventions form a
//! *sub-instrument*, and masks and templates are always built per sub-instrument.
//!
//! The breakpoints are **fixed calendar dates** known in advance, never inferred from the data.
//! Each breakpoint is the exclusive end of its sub-instrument: an observation belongs to the first
//! sub-instrument whose end date is strictly later than its acquisition epoch. The last
//! sub-instrument of every instrument is open-ended.
//!
//! ## Built-in instruments
//!
//! | Instrument | Sub-instruments |
//! |---|---|
//! | `ESPRESSO` | `ESPRESSO18`, `ESPRESSO19`, `ESPRESSO21` |
//! | `HARPS` | `HARPS03`, `HARPS15` |
//! | `CARMENES` | `CARMENES` |
//! | `MAROONX` | `MAROON1` … `MAROON22` |
//!
//! Other instruments are described with [`InstrumentEpochs::custom`].

use std::str::FromStr;

use hifitime::Epoch;
use log::debug;

use crate::constants::SubInstrumentId;
use crate::specstack_errors::SpecStackError;
use crate::time::calendar_day;

/// Ordered list of `(sub-instrument, exclusive end)` pairs of one spectrograph.
#[derive(Debug, Clone, PartialEq)]
pub struct InstrumentEpochs {
    name: String,
    divisions: Vec<(SubInstrumentId, Option<Epoch>)>,
}

impl InstrumentEpochs {
    /// Describe an instrument that is not built in.
    ///
    /// Arguments
    /// -----------------
    /// * `name`: instrument name, as found in [`FrameDescriptor::instrument`](crate::frame::FrameDescriptor)
    /// * `bounded`: `(sub-instrument, exclusive end)` pairs, strictly increasing in time
    /// * `last`: the open-ended sub-instrument following the last breakpoint
    ///
    /// Return
    /// ----------
    /// * The description, or [`SpecStackError::InvalidParameter`] if the breakpoints are not
    ///   strictly increasing or a name is repeated.
    pub fn custom(
        name: &str,
        bounded: Vec<(&str, Epoch)>,
        last: &str,
    ) -> Result<Self, SpecStackError> {
        for pair in bounded.windows(2) {
            if pair[1].1 <= pair[0].1 {
                return Err(SpecStackError::InvalidParameter(format!(
                    "{name}: breakpoint of {} is not later than the one of {}",
                    pair[1].0, pair[0].0
                )));
            }
        }
        let mut divisions: Vec<(SubInstrumentId, Option<Epoch>)> = bounded
            .into_iter()
            .map(|(sub, end)| (SubInstrumentId::from(sub), Some(end)))
            .collect();
        divisions.push((SubInstrumentId::from(last), None));

        let mut names: Vec<&SubInstrumentId> = divisions.iter().map(|(s, _)| s).collect();
        names.sort();
        if names.windows(2).any(|w| w[0] == w[1]) {
            return Err(SpecStackError::InvalidParameter(format!(
                "{name}: sub-instrument names must be unique"
            )));
        }

        Ok(InstrumentEpochs {
            name: name.to_string(),
            divisions,
        })
    }

    pub fn espresso() -> Self {
        InstrumentEpochs {
            name: "ESPRESSO".into(),
            divisions: vec![
                ("ESPRESSO18".into(), Some(calendar_day(2019, 6, 27))),
                ("ESPRESSO19".into(), Some(calendar_day(2020, 12, 18))),
                ("ESPRESSO21".into(), None),
            ],
        }
    }

    pub fn harps() -> Self {
        InstrumentEpochs {
            name: "HARPS".into(),
            divisions: vec![
                ("HARPS03".into(), Some(calendar_day(2015, 5, 29))),
                ("HARPS15".into(), None),
            ],
        }
    }

    pub fn carmenes() -> Self {
        InstrumentEpochs {
            name: "CARMENES".into(),
            divisions: vec![("CARMENES".into(), None)],
        }
    }

    /// MAROON-X epochs. Each end already falls one day after the last night of its run.
    pub fn maroonx() -> Self {
        let ends = [
            (2020, 10, 14),
            (2021, 1, 13),
            (2021, 4, 3),
            (2021, 5, 29),
            (2021, 7, 3),
            (2021, 9, 22),
            (2021, 12, 22),
            (2022, 5, 26),
            (2022, 7, 2),
            (2022, 9, 14),
            (2023, 8, 10),
            (2023, 11, 27),
            (2023, 12, 28),
            (2024, 2, 2),
            (2024, 5, 23),
            (2024, 7, 12),
            (2024, 8, 17),
            (2024, 9, 19),
            (2024, 11, 14),
            (2025, 2, 8),
            (2025, 3, 3),
        ];
        let mut divisions: Vec<(SubInstrumentId, Option<Epoch>)> = ends
            .iter()
            .enumerate()
            .map(|(i, (y, m, d))| {
                (
                    SubInstrumentId::new(format!("MAROON{}", i + 1)),
                    Some(calendar_day(*y, *m, *d)),
                )
            })
            .collect();
        divisions.push((SubInstrumentId::new(format!("MAROON{}", ends.len() + 1)), None));
        InstrumentEpochs {
            name: "MAROONX".into(),
            divisions,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sub-instruments in chronological order.
    pub fn sub_instruments(&self) -> impl Iterator<Item = &SubInstrumentId> {
        self.divisions.iter().map(|(s, _)| s)
    }

    /// Sub-instrument an observation taken at `epoch` belongs to.
    pub fn sub_instrument_at(&self, epoch: Epoch) -> &SubInstrumentId {
        for (sub, end) in &self.divisions {
            match end {
                Some(end) if epoch < *end => return sub,
                Some(_) => continue,
                None => return sub,
            }
        }
        // custom() and the built-ins always end with an open-ended division
        let (last, _) = &self.divisions[self.divisions.len() - 1];
        debug!("{} epoch {epoch} falls after every breakpoint", self.name);
        last
    }
}

impl FromStr for InstrumentEpochs {
    type Err = SpecStackError;

    /// Built-in description from an instrument name (case-insensitive).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ESPRESSO" => Ok(InstrumentEpochs::espresso()),
            "HARPS" => Ok(InstrumentEpochs::harps()),
            "CARMENES" => Ok(InstrumentEpochs::carmenes()),
            "MAROONX" | "MAROON-X" => Ok(InstrumentEpochs::maroonx()),
            _ => Err(SpecStackError::UnknownInstrument(s.to_string())),
        }
    }
}

#[cfg(test)]
mod instruments_test {
    use super::*;

    #[test]
    fn espresso_boundaries_are_exclusive() {
        let esp = InstrumentEpochs::espresso();
        assert_eq!(
            esp.sub_instrument_at(calendar_day(2019, 6, 26)).as_str(),
            "ESPRESSO18"
        );
        assert_eq!(
            esp.sub_instrument_at(calendar_day(2019, 6, 27)).as_str(),
            "ESPRESSO19"
        );
        assert_eq!(
            esp.sub_instrument_at(calendar_day(2023, 1, 1)).as_str(),
            "ESPRESSO21"
        );
    }

    #[test]
    fn maroonx_has_22_divisions() {
        let mx: InstrumentEpochs = "maroon-x".parse().unwrap();
        assert_eq!(mx.sub_instruments().count(), 22);
        assert_eq!(
            mx.sub_instrument_at(calendar_day(2030, 1, 1)).as_str(),
            "MAROON22"
        );
    }

    #[test]
    fn maroonx_run_ends_are_exclusive() {
        let mx = InstrumentEpochs::maroonx();
        let at = |y, m, d| mx.sub_instrument_at(calendar_day(y, m, d)).as_str().to_string();
        assert_eq!(at(2020, 10, 13), "MAROON1");
        assert_eq!(at(2020, 10, 14), "MAROON2");
        assert_eq!(at(2021, 1, 12), "MAROON2");
        assert_eq!(at(2021, 1, 13), "MAROON3");
        assert_eq!(at(2025, 3, 2), "MAROON21");
        assert_eq!(at(2025, 3, 3), "MAROON22");
        let late_night = calendar_day(2020, 10, 13) + hifitime::Unit::Hour * 23_i64;
        assert_eq!(mx.sub_instrument_at(late_night).as_str(), "MAROON1");
    }

    #[test]
    fn custom_requires_increasing_breakpoints() {
        let bad = InstrumentEpochs::custom(
            "NIRPS",
            vec![
                ("NIRPS1", calendar_day(2023, 6, 1)),
                ("NIRPS2", calendar_day(2023, 1, 1)),
            ],
            "NIRPS3",
        );
        assert!(bad.is_err());
        assert_eq!(
            "FOO".parse::<InstrumentEpochs>(),
            Err(SpecStackError::UnknownInstrument("FOO".into()))
        );
    }
}
