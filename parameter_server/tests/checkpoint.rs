use std::num::NonZeroUsize;

use optimizer::{CpuBackend, DType, OptimizerConfig, TrainingEvent, TrainingState};
use parameter_server::ParameterStore;
use rand::{Rng, SeedableRng, rngs::StdRng};
use tempfile::TempDir;

const PARAMS: usize = 105;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn adam() -> OptimizerConfig {
    OptimizerConfig {
        optimizer: "adam".to_string(),
        learn_rate: 1e-2,
        clip_norm: 0.,
        ..Default::default()
    }
}

fn store(initial: &[f32], shard_size: usize, config: &OptimizerConfig) -> ParameterStore {
    let shard_size = NonZeroUsize::new(shard_size).unwrap();
    ParameterStore::new(initial, DType::Float32, shard_size, config, CpuBackend::device).unwrap()
}

fn random_grad(rng: &mut StdRng) -> Vec<f32> {
    (0..PARAMS).map(|_| rng.random_range(-1.0..1.0)).collect()
}

fn step(store: &ParameterStore, grad: &[f32]) {
    store.accumulate(grad).unwrap();
    store.update_params(None).unwrap();
}

fn pull(store: &ParameterStore) -> Vec<f32> {
    let mut out = vec![0.; store.len()];
    store.pull_params(&mut out).unwrap();
    out
}

#[test]
fn resumes_with_another_shard_size() {
    init_logger();

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("optimizer.safetensors");
    let mut rng = StdRng::seed_from_u64(11);

    let trained = store(&[0.5; PARAMS], 10, &adam());
    for _ in 0..4 {
        step(&trained, &random_grad(&mut rng));
    }
    trained.save_optimizer(&path, true).unwrap();

    let resumed = store(&pull(&trained), 25, &adam());
    resumed.load_optimizer(&path).unwrap();

    let grad = random_grad(&mut rng);
    step(&trained, &grad);
    step(&resumed, &grad);

    assert_eq!(pull(&trained), pull(&resumed));
}

#[test]
fn fresh_optimizer_diverges_without_state() {
    init_logger();

    let mut rng = StdRng::seed_from_u64(12);

    let trained = store(&[0.5; PARAMS], 10, &adam());
    for _ in 0..4 {
        step(&trained, &random_grad(&mut rng));
    }

    let restarted = store(&pull(&trained), 10, &adam());

    let grad = random_grad(&mut rng);
    step(&trained, &grad);
    step(&restarted, &grad);

    assert_ne!(pull(&trained), pull(&restarted));
}

#[test]
fn adagrad_through_the_store() {
    init_logger();

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("adagrad.safetensors");
    let config = OptimizerConfig {
        optimizer: "adagrad".to_string(),
        learn_rate: 0.1,
        clip_norm: 0.,
        ..Default::default()
    };

    let trained = store(&[0.; PARAMS], 7, &config);
    step(&trained, &[2.; PARAMS]);
    trained.save_optimizer(&path, true).unwrap();

    let resumed = store(&pull(&trained), 50, &config);
    resumed.load_optimizer(&path).unwrap();

    step(&trained, &[1.; PARAMS]);
    step(&resumed, &[1.; PARAMS]);
    assert_eq!(pull(&trained), pull(&resumed));
}

#[test]
fn load_before_any_checkpoint() {
    init_logger();

    let dir = TempDir::new().unwrap();
    let store = store(&[0.; PARAMS], 10, &adam());

    store
        .load_optimizer(dir.path().join("missing.safetensors"))
        .unwrap();
    store
        .save_optimizer(dir.path().join("untrained.safetensors"), true)
        .unwrap();

    assert!(!dir.path().join("untrained.safetensors").exists());
}

#[test]
fn averaged_parameters_through_the_store() {
    init_logger();

    let config = OptimizerConfig {
        optimizer: "sgd".to_string(),
        learn_rate: 1.,
        clip_norm: 0.,
        exponential_smoothing: 0.5,
        ..Default::default()
    };
    let store = store(&[4.; PARAMS], 20, &config);

    let mut avg = vec![0.; PARAMS];
    assert!(!store.pull_averaged_params(&mut avg).unwrap());

    step(&store, &[1.; PARAMS]);
    store.observe(
        TrainingEvent::AfterBatches,
        &TrainingState {
            eta: 1.,
            batches: 10,
            reset: false,
        },
    );
    step(&store, &[1.; PARAMS]);

    assert!(store.pull_averaged_params(&mut avg).unwrap());
    assert_eq!(avg, vec![2.5; PARAMS]);
    assert_eq!(pull(&store), vec![2.; PARAMS]);
}
