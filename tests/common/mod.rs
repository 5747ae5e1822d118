#![allow(dead_code)]

use camino::Utf8PathBuf;
use hifitime::Epoch;
use ndarray::Array2;
use specstack::frame::{Frame, FrameArrays, FrameDescriptor};
use specstack::mask::intervals::WavelengthInterval;
use specstack::specstack_errors::SpecStackError;
use specstack::telluric::archive::{AtmosphericRecords, AtmosphericState};
use specstack::telluric::{TransmittanceCurve, TransmittanceSimulator};
use specstack::template::DopplerFormula;
use specstack::template_cache::TemplateStore;
use specstack::time::calendar_day;

pub const PIXELS: usize = 300;

/// Epoch falling in the ESPRESSO21 division.
pub fn espresso21() -> Epoch {
    calendar_day(2022, 4, 10)
}

/// Smooth stellar continuum with two absorption lines, in the rest frame.
pub fn stellar_flux(rest: f64) -> f64 {
    let line = |center: f64, depth: f64, width: f64| {
        depth * (-((rest - center) / width).powi(2)).exp()
    };
    1.0 + 0.002 * (rest - 5000.0) - line(5001.2, 0.4, 0.08) - line(5052.6, 0.3, 0.1)
}

/// Observation of [`stellar_flux`] Doppler-shifted by `rv` on a two-order detector grid
/// starting at 4998 Å (order 0) and 5050 Å (order 1), 0.02 Å per pixel.
pub fn observation(path: &str, berv: f64, rv: Option<f64>, humidity: Option<f64>) -> Frame {
    let grid = Array2::from_shape_fn((2, PIXELS), |(o, p)| {
        4998.0 + o as f64 * 52.0 + p as f64 * 0.02
    });
    let v = rv.unwrap_or(0.0);
    let flux = grid.mapv(|w| stellar_flux(DopplerFormula::Classical.to_rest(w, v)));
    let sigma = Array2::from_elem((2, PIXELS), 0.01);
    let arrays = FrameArrays::unmasked(grid, flux, sigma).unwrap();

    let mut desc = FrameDescriptor::new(path, "ESPRESSO", espresso21(), berv);
    desc.prior_rv = rv;
    desc.humidity = humidity;
    Frame::new(desc, arrays)
}

/// Fresh, not yet created store directory under the system temporary directory.
pub fn scratch_store() -> TemplateStore {
    let dir = std::env::temp_dir().join(format!("specstack-it-{}", uuid::Uuid::new_v4().simple()));
    TemplateStore::new(Utf8PathBuf::from_path_buf(dir).unwrap())
}

pub fn cleanup(store: &TemplateStore) {
    if store.root().exists() {
        std::fs::remove_dir_all(store.root()).unwrap();
    }
}

/// One atmospheric state at `epoch`.
pub fn atmosphere_at(epoch: Epoch) -> AtmosphericRecords {
    AtmosphericRecords::new(
        vec![AtmosphericState {
            epoch,
            pressure_hpa: 743.5,
            temperature_k: 284.0,
            relative_humidity: 30.0,
            profile: None,
        }],
        12.0,
    )
}

/// Simulator producing a single Gaussian absorption line.
pub struct GaussianLineSimulator {
    pub center: f64,
    pub depth: f64,
    pub width: f64,
}

impl TransmittanceSimulator for GaussianLineSimulator {
    fn simulate(
        &self,
        range: WavelengthInterval,
        _state: &AtmosphericState,
    ) -> Result<TransmittanceCurve, SpecStackError> {
        let step = 0.005;
        let n = (range.width() / step) as usize + 1;
        let waves: Vec<f64> = (0..n).map(|i| range.start() + i as f64 * step).collect();
        let trans = waves
            .iter()
            .map(|w| 1.0 - self.depth * (-((w - self.center) / self.width).powi(2)).exp())
            .collect();
        TransmittanceCurve::new(waves, trans)
    }

    fn identity(&self) -> String {
        format!("gaussian_line:{}:{}:{}", self.center, self.depth, self.width)
    }
}

pub fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}
