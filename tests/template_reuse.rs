mod common;

use std::cell::Cell;

use common::{cleanup, init_logs, observation, scratch_store};
use specstack::config::{CacheMode, PipelineConfig, TemplateConfig};
use specstack::dataset::Dataset;
use specstack::frame::provider::InMemoryProvider;
use specstack::frame::Frame;
use specstack::instruments::InstrumentEpochs;
use specstack::pipeline::{PartitionStatus, StackPipeline};
use specstack::specstack_errors::SpecStackError;
use specstack::template::interpolation::InterpolationMode;
use specstack::template::TemplateBuilder;
use specstack::template_cache::CacheOutcome;

fn frames() -> Vec<Frame> {
    vec![
        observation("a.fits", 3.0, Some(1.5), None),
        observation("b.fits", -7.0, Some(-2.5), None),
        observation("c.fits", 12.0, Some(4.0), None),
    ]
}

#[test]
fn second_lookup_reuses_without_recomputing() {
    init_logs();
    let store = scratch_store();
    let dataset = Dataset::new(frames().into_iter().collect::<InMemoryProvider>());
    let partitions = dataset.partitions(&[InstrumentEpochs::espresso()]).unwrap();
    let partition = &partitions[0];
    let config = PipelineConfig::default();
    let fingerprint = config.fingerprint().unwrap();
    let builder = TemplateBuilder::new(&config.template);

    let builds = Cell::new(0);
    let build = || {
        builds.set(builds.get() + 1);
        builder.build(partition, &dataset)
    };

    let (first, outcome) = store
        .load_or_build(partition.key(), fingerprint, CacheMode::Reuse, build)
        .unwrap();
    assert_eq!(outcome, CacheOutcome::Built);
    let (second, outcome) = store
        .load_or_build(partition.key(), fingerprint, CacheMode::Reuse, build)
        .unwrap();
    assert_eq!(outcome, CacheOutcome::Reused);

    assert_eq!(builds.get(), 1);
    assert!(first.bit_identical(&second));
    assert_eq!(first.provenance, second.provenance);
    cleanup(&store);
}

#[test]
fn forced_rebuilds_are_identical() {
    let store = scratch_store();
    let dataset = Dataset::new(frames().into_iter().collect::<InMemoryProvider>());
    for interpolation in [
        InterpolationMode::Linear,
        InterpolationMode::Cubic,
        InterpolationMode::gaussian_process(),
    ] {
        let config = PipelineConfig {
            template: TemplateConfig::builder()
                .interpolation(interpolation)
                .build()
                .unwrap(),
            cache_mode: CacheMode::ForceRebuild,
            ..PipelineConfig::default()
        };
        let pipeline = StackPipeline::new(config, store.clone()).unwrap();
        let first = pipeline.run(&dataset).unwrap();
        let second = pipeline.run(&dataset).unwrap();
        let a = first.template("ESPRESSO21").unwrap();
        let b = second.template("ESPRESSO21").unwrap();
        assert!(a.bit_identical(b), "{interpolation}");
        assert_eq!(
            second.get("ESPRESSO21").unwrap().status.cache_outcome(),
            Some(CacheOutcome::Built)
        );
    }
    cleanup(&store);
}

#[test]
fn changed_configuration_is_a_cache_miss() {
    let store = scratch_store();
    let dataset = Dataset::new(frames().into_iter().collect::<InMemoryProvider>());
    let run = |min_frames: usize| {
        let config = PipelineConfig {
            template: TemplateConfig::builder().min_frames(min_frames).build().unwrap(),
            ..PipelineConfig::default()
        };
        let report = StackPipeline::new(config, store.clone())
            .unwrap()
            .run(&dataset)
            .unwrap();
        report.get("ESPRESSO21").unwrap().status.cache_outcome()
    };
    assert_eq!(run(3), Some(CacheOutcome::Built));
    assert_eq!(run(3), Some(CacheOutcome::Reused));
    assert_eq!(run(2), Some(CacheOutcome::Built));
    cleanup(&store);
}

#[test]
fn insufficient_data_writes_no_artifact() {
    let store = scratch_store();
    let config = PipelineConfig {
        template: TemplateConfig::builder().min_frames(2).build().unwrap(),
        ..PipelineConfig::default()
    };
    let rejected = observation("b.fits", 0.0, Some(0.0), None);
    let rejected = Frame::new(
        rejected.descriptor().clone().invalidated(),
        rejected.arrays().clone(),
    );
    let dataset = Dataset::new(
        vec![observation("a.fits", 0.0, Some(0.0), None), rejected]
            .into_iter()
            .collect::<InMemoryProvider>(),
    );

    let pipeline = StackPipeline::new(config, store.clone()).unwrap();
    let report = pipeline.run(&dataset).unwrap();
    let outcome = report.get("ESPRESSO21").unwrap();
    assert_eq!((outcome.n_frames, outcome.n_valid), (2, 1));
    match &outcome.status {
        PartitionStatus::Failed(err) => assert_eq!(
            *err,
            SpecStackError::InsufficientData {
                sub_instrument: "ESPRESSO21".into(),
                valid: 1,
                required: 2,
            }
        ),
        other => panic!("expected a failure, got {other:?}"),
    }

    let key = report.outcomes.keys().next().unwrap();
    assert!(!store.contains(key, report.fingerprint));
    let (data, sidecar) = store.artifact_paths(key, report.fingerprint);
    assert!(!data.exists() && !sidecar.exists());
}
