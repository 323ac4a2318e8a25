//! Integration tests against JSON fixtures computed with the diffusers
//! timestep and beta formulas.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use burn_depth2img_samplers::{
    DdimConfig, DdimScheduler, DeisConfig, DeisMultistepScheduler, NoiseSchedule, Scheduler,
};
use burn_ndarray::NdArray;
use serde::Deserialize;

type TestBackend = NdArray<f32>;

fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures")
}

#[derive(Debug, Deserialize)]
struct TimestepFixture {
    num_train_timesteps: usize,
    deis: BTreeMap<String, Vec<usize>>,
    ddim: BTreeMap<String, Vec<usize>>,
    alphas_cumprod: BTreeMap<String, f64>,
}

fn load_fixture() -> TimestepFixture {
    let content =
        fs::read_to_string(fixtures_dir().join("timesteps.json")).expect("Failed to read fixture");
    serde_json::from_str(&content).expect("Failed to parse fixture")
}

fn steps_of(key: &str) -> usize {
    key.trim_end_matches("_steps").parse().expect("Bad fixture key")
}

#[test]
fn test_alphas_cumprod_match_reference() {
    let fixture = load_fixture();
    let schedule = NoiseSchedule::sd2x();
    assert_eq!(schedule.num_train_steps, fixture.num_train_timesteps);

    for (t, expected) in &fixture.alphas_cumprod {
        let t: usize = t.parse().unwrap();
        let actual = schedule.alpha_cumprod_at(t).unwrap();
        assert!(
            (expected - actual).abs() < 1e-9,
            "alphas_cumprod[{}]: expected {}, got {}",
            t,
            expected,
            actual
        );
    }
}

#[test]
fn test_deis_timesteps_match_reference() {
    let fixture = load_fixture();

    for (key, expected) in &fixture.deis {
        let mut scheduler = DeisMultistepScheduler::<TestBackend>::new(DeisConfig::default()).unwrap();
        scheduler.set_timesteps(steps_of(key)).unwrap();
        assert_eq!(scheduler.timesteps(), expected.as_slice(), "deis {}", key);
    }
}

#[test]
fn test_ddim_timesteps_match_reference() {
    let fixture = load_fixture();

    for (key, expected) in &fixture.ddim {
        let mut scheduler = DdimScheduler::new(DdimConfig::default());
        Scheduler::<TestBackend>::set_timesteps(&mut scheduler, steps_of(key)).unwrap();
        assert_eq!(
            Scheduler::<TestBackend>::timesteps(&scheduler),
            expected.as_slice(),
            "ddim {}",
            key
        );
    }
}

#[test]
fn test_truncated_deis_schedule_runs_to_the_end() {
    use burn::prelude::*;

    let device = Default::default();
    let mut scheduler = DeisMultistepScheduler::<TestBackend>::new(DeisConfig::default()).unwrap();
    scheduler.set_timesteps(20).unwrap();
    scheduler.skip_timesteps(5);

    let x0 = Tensor::<TestBackend, 4>::ones([1, 4, 2, 2], &device) * 0.3;
    let eps = Tensor::<TestBackend, 4>::ones([1, 4, 2, 2], &device) * -0.5;
    let timesteps = scheduler.timesteps().to_vec();
    let mut sample = scheduler.add_noise(x0.clone(), eps.clone(), timesteps[0]).unwrap();

    for &t in &timesteps {
        sample = scheduler.step(eps.clone(), t, sample).unwrap();
    }

    // The exact noise takes the sample to the t = 0 noise level
    let expected = scheduler.add_noise(x0, eps, 0).unwrap();
    let diff: f32 = (sample - expected).abs().max().into_scalar().elem();
    assert!(diff < 1e-3, "diff = {}", diff);
}
