mod common;

use std::sync::Arc;

use camino::Utf8PathBuf;
use common::{
    atmosphere_at, cleanup, espresso21, init_logs, observation, scratch_store,
    GaussianLineSimulator,
};
use specstack::config::{CacheMode, MaskConfig, PipelineConfig, TemplateConfig, UserInterval};
use specstack::constants::FrameId;
use specstack::dataset::Dataset;
use specstack::frame::provider::{DatasetSnapshot, InMemoryProvider, SnapshotProvider};
use specstack::frame::{Frame, FrameArrays, FrameDescriptor};
use specstack::instruments::InstrumentEpochs;
use specstack::mask::PixelMask;
use specstack::pipeline::StackPipeline;
use specstack::specstack_errors::{ErrorKind, SpecStackError};
use specstack::telluric::SelectionRule;
use specstack::template::InclusionPolicy;
use specstack::time::calendar_day;

fn dataset(frames: Vec<Frame>) -> Dataset {
    Dataset::new(frames.into_iter().collect::<InMemoryProvider>())
}

fn uncached(template: TemplateConfig) -> PipelineConfig {
    PipelineConfig {
        template,
        cache_mode: CacheMode::Disabled,
        ..PipelineConfig::default()
    }
}

#[test]
fn most_humid_observation_feeds_the_telluric_model() {
    init_logs();
    let store = scratch_store();
    let pipeline = StackPipeline::new(PipelineConfig::default(), store.clone())
        .unwrap()
        .with_telluric(
            Arc::new(atmosphere_at(espresso21())),
            Arc::new(GaussianLineSimulator {
                center: 5002.0,
                depth: 0.6,
                width: 0.05,
            }),
        );
    let data = dataset(vec![
        observation("a.fits", 2.0, Some(0.0), Some(10.0)),
        observation("b.fits", -4.0, Some(0.0), Some(90.0)),
        observation("c.fits", 6.0, Some(0.0), Some(40.0)),
    ]);

    let report = pipeline.run(&data).unwrap();
    let outcome = report.get("ESPRESSO21").unwrap();
    let summary = outcome.telluric.as_ref().unwrap();
    assert_eq!(summary.selected_frame, FrameId::from_path("b.fits"));
    assert_eq!(summary.selection, SelectionRule::HighestHumidity);
    assert_eq!(summary.intervals.len(), 1);
    assert!(summary.intervals[0].contains(5002.0));
    assert!(outcome.degradations.is_empty());

    // every unwidened telluric interval is excluded from the template
    let template = report.template("ESPRESSO21").unwrap();
    let mask = PixelMask::from_flags(template.mask.clone());
    for interval in &summary.intervals {
        assert!(mask.covers(&template.wavelengths, interval));
    }
    assert!(outcome.masked_pixels.unwrap() > 0);
    cleanup(&store);
}

#[test]
fn missing_humidity_is_reported_as_a_degradation() {
    let pipeline = StackPipeline::new(uncached(TemplateConfig::default()), scratch_store())
        .unwrap()
        .with_telluric(
            Arc::new(atmosphere_at(espresso21())),
            Arc::new(GaussianLineSimulator {
                center: 5002.0,
                depth: 0.6,
                width: 0.05,
            }),
        );
    let data = dataset(vec![
        observation("a.fits", 2.0, Some(0.0), None),
        observation("b.fits", -4.0, Some(0.0), None),
        observation("c.fits", 6.0, Some(0.0), None),
    ]);
    let report = pipeline.run(&data).unwrap();
    let outcome = report.get("ESPRESSO21").unwrap();
    assert_eq!(
        outcome.telluric.as_ref().unwrap().selection,
        SelectionRule::FirstFrameFallback
    );
    assert_eq!(outcome.degradations.len(), 1);
    assert!(outcome.status.template().is_some());
}

#[test]
fn intersection_keeps_at_most_the_union_pixels() {
    let frames = || {
        vec![
            observation("a.fits", 0.0, Some(-6.0), None),
            observation("b.fits", 0.0, Some(0.5), None),
            observation("c.fits", 0.0, Some(7.0), None),
        ]
    };
    let count = |inclusion: InclusionPolicy| {
        let config = uncached(TemplateConfig::builder().inclusion(inclusion).build().unwrap());
        let report = StackPipeline::new(config, scratch_store())
            .unwrap()
            .run(&dataset(frames()))
            .unwrap();
        report.template("ESPRESSO21").unwrap().n_valid_pixels()
    };
    assert!(count(InclusionPolicy::Intersection) <= count(InclusionPolicy::Union));
}

#[test]
fn one_failing_sub_instrument_does_not_stop_the_others() {
    let harps = {
        let frame = observation("h.fits", 0.0, Some(0.0), None);
        let desc = FrameDescriptor::new("h.fits", "HARPS", calendar_day(2016, 1, 1), 0.0)
            .with_prior_rv(0.0);
        Frame::new(desc, frame.into_arrays())
    };
    let data = dataset(vec![
        observation("a.fits", 1.0, Some(0.0), None),
        harps,
        observation("b.fits", 2.0, Some(0.0), None),
        observation("c.fits", 3.0, Some(0.0), None),
    ]);
    let config = uncached(TemplateConfig::builder().min_frames(2).build().unwrap());
    let report = StackPipeline::new(config, scratch_store())
        .unwrap()
        .run(&data)
        .unwrap();

    assert_eq!(report.len(), 2);
    assert_eq!(report.n_built(), 1);
    assert!(report.template("ESPRESSO21").is_some());
    let failures: Vec<_> = report.failures().collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0.sub_instrument.as_str(), "HARPS15");
    assert_eq!(failures[0].1.kind(), ErrorKind::InsufficientData);
}

#[test]
fn unknown_instrument_is_refused_before_any_work() {
    let store = scratch_store();
    let pipeline = StackPipeline::new(PipelineConfig::default(), store.clone())
        .unwrap()
        .with_instruments(vec![InstrumentEpochs::harps()]);
    let err = pipeline
        .run(&dataset(vec![observation("a.fits", 0.0, Some(0.0), None)]))
        .unwrap_err();
    assert_eq!(err, SpecStackError::UnknownInstrument("ESPRESSO".into()));
    assert!(!store.root().exists());
}

/// Same observation with a NaN flux pixel, masked by the frame constructor.
fn with_nan_pixel(frame: Frame) -> Frame {
    let descriptor = frame.descriptor().clone();
    let arrays = frame.into_arrays();
    let mut flux = arrays.flux.clone();
    flux[[0, 40]] = f64::NAN;
    let arrays = FrameArrays::new(
        arrays.wavelengths,
        flux,
        arrays.uncertainties,
        arrays.mask,
        arrays.order_status,
    )
    .unwrap();
    Frame::new(descriptor, arrays)
}

#[test]
fn snapshot_workers_build_the_same_template() {
    let data = dataset(vec![
        observation("a.fits", 1.0, Some(0.8), None),
        with_nan_pixel(observation("b.fits", 2.0, Some(-1.1), None)),
        observation("c.fits", 3.0, Some(2.4), None),
    ]);
    let partitions = data.partitions(&[InstrumentEpochs::espresso()]).unwrap();
    let json = data.snapshot(&partitions).unwrap().to_json().unwrap();
    let worker = Dataset::new(SnapshotProvider::from(DatasetSnapshot::from_json(&json).unwrap()));
    assert_eq!(worker.descriptors(), data.descriptors());

    let pipeline = StackPipeline::new(uncached(TemplateConfig::default()), scratch_store()).unwrap();
    let parent = pipeline.run(&data).unwrap();
    let child = pipeline.run(&worker).unwrap();
    assert!(parent
        .template("ESPRESSO21")
        .unwrap()
        .bit_identical(child.template("ESPRESSO21").unwrap()));
}

#[test]
fn configuration_is_read_from_json() {
    let store = scratch_store();
    std::fs::create_dir_all(store.root()).unwrap();
    let path: Utf8PathBuf = store.root().join("config.json");
    std::fs::write(
        &path,
        r#"{
            "mask": {"berv_source": {"kind": "observed"}, "activity_lines": false},
            "template": {"min_frames": 2, "stacking": "median", "inclusion": "intersection"},
            "cache_mode": "disabled"
        }"#,
    )
    .unwrap();
    let config = PipelineConfig::from_json_file(&path).unwrap();
    assert_eq!(config.template.min_frames, 2);
    assert_eq!(config.cache_mode, CacheMode::Disabled);

    let report = StackPipeline::new(config, store.clone())
        .unwrap()
        .run(&dataset(vec![
            observation("a.fits", 1.0, Some(0.0), None),
            observation("b.fits", 2.0, Some(0.0), None),
        ]))
        .unwrap();
    assert_eq!(report.n_built(), 1);

    std::fs::write(&path, r#"{"template": {"min_frames": 0}}"#).unwrap();
    assert!(matches!(
        PipelineConfig::from_json_file(&path),
        Err(SpecStackError::InvalidParameter(_))
    ));
    cleanup(&store);
}

#[test]
fn colliding_interval_names_stop_the_pipeline_up_front() {
    let config = PipelineConfig {
        mask: MaskConfig {
            user_intervals: vec![UserInterval {
                name: "H_alpha".into(),
                start: 6560.0,
                end: 6561.0,
            }],
            ..MaskConfig::default()
        },
        ..PipelineConfig::default()
    };
    let store = scratch_store();
    let err = StackPipeline::new(config, store.clone()).unwrap_err();
    assert_eq!(err, SpecStackError::DuplicateInterval("H_alpha".into()));
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(!store.root().exists());

    std::fs::create_dir_all(store.root()).unwrap();
    let path: Utf8PathBuf = store.root().join("config.json");
    std::fs::write(
        &path,
        r#"{"mask": {"user_intervals": [{"name": "blue", "start": -1.0, "end": 4000.0}]}}"#,
    )
    .unwrap();
    assert!(matches!(
        PipelineConfig::from_json_file(&path),
        Err(SpecStackError::InvalidParameter(_))
    ));
    cleanup(&store);
}

#[cfg(feature = "parallel")]
#[test]
fn parallel_run_gives_the_sequential_report() {
    let harps = |path: &str, rv: f64| {
        let frame = observation(path, 0.0, Some(rv), None);
        let desc = FrameDescriptor::new(path, "HARPS", calendar_day(2016, 1, 1), 0.0)
            .with_prior_rv(rv);
        Frame::new(desc, frame.into_arrays())
    };
    let data = dataset(vec![
        observation("a.fits", 1.0, Some(0.3), None),
        observation("b.fits", 2.0, Some(-0.6), None),
        observation("c.fits", 3.0, Some(1.2), None),
        harps("h1.fits", 0.1),
        harps("h2.fits", -0.4),
        harps("h3.fits", 0.9),
    ]);
    let pipeline = StackPipeline::new(uncached(TemplateConfig::default()), scratch_store()).unwrap();
    let seq = pipeline.run(&data).unwrap();
    let par = pipeline.run_par(&data).unwrap();
    assert_eq!(seq.n_built(), 2);
    for sub in ["ESPRESSO21", "HARPS15"] {
        assert!(seq
            .template(sub)
            .unwrap()
            .bit_identical(par.template(sub).unwrap()));
    }
}
