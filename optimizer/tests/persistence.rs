use std::path::Path;

use optimizer::{
    Buffer, CpuBackend, DType, Device, OptimErr, Optimizer, RuleKind, ShardLayout, StepContext,
    UpdateRule,
    checkpoint::{self, Item},
};
use rand::{Rng, SeedableRng, rngs::StdRng};
use tempfile::TempDir;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn devices(n: usize) -> Vec<Device> {
    (0..n).map(CpuBackend::device).collect()
}

/// Builds one rule per shard of `layout` and trains each for a few steps on random gradients.
fn trained_rules(kind: RuleKind, layout: &ShardLayout, seed: u64) -> Vec<UpdateRule> {
    let mut rng = StdRng::seed_from_u64(seed);

    layout
        .sizes()
        .iter()
        .enumerate()
        .map(|(shard, &len)| {
            let device = CpuBackend::device(shard);
            let mut rule = UpdateRule::new(kind);
            let mut params = Buffer::zeros(device.clone(), DType::Float32, len).unwrap();

            for _ in 0..3 {
                let g: Vec<f32> = (0..len).map(|_| rng.random_range(-1.0..1.0)).collect();
                let grads = Buffer::from_f32(device.clone(), DType::Float32, &g).unwrap();
                rule.step(&mut params, &grads, StepContext::new(1e-2))
                    .unwrap();
            }

            rule
        })
        .collect()
}

fn save(path: &Path, rules: &[UpdateRule], layout: &ShardLayout) {
    let refs: Vec<&UpdateRule> = rules.iter().collect();
    UpdateRule::save(path, &refs, layout, true).unwrap();
}

fn load(path: &Path, rules: &mut [UpdateRule], layout: &ShardLayout) -> optimizer::Result<()> {
    let backends = devices(rules.len());
    let mut refs: Vec<&mut UpdateRule> = rules.iter_mut().collect();
    UpdateRule::load(path, &mut refs, &backends, layout)
}

fn fresh(kind: RuleKind, n: usize) -> Vec<UpdateRule> {
    (0..n).map(|_| UpdateRule::new(kind)).collect()
}

fn concat(bufs: impl Iterator<Item = Vec<f32>>) -> Vec<f32> {
    bufs.flatten().collect()
}

fn adagrad_gt(rules: &[UpdateRule]) -> Vec<f32> {
    concat(
        rules
            .iter()
            .map(|rule| rule.as_adagrad().unwrap().gt().unwrap().to_f32_vec()),
    )
}

fn adam_moments(rules: &[UpdateRule]) -> (Vec<f32>, Vec<f32>) {
    let mt = concat(
        rules
            .iter()
            .map(|rule| rule.as_adam().unwrap().mt().unwrap().to_f32_vec()),
    );
    let vt = concat(
        rules
            .iter()
            .map(|rule| rule.as_adam().unwrap().vt().unwrap().to_f32_vec()),
    );

    (mt, vt)
}

#[test]
fn adagrad_round_trip() {
    init_logger();

    for sizes in [vec![7], vec![3, 3, 1]] {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("adagrad.safetensors");
        let layout = ShardLayout::from_sizes(sizes);

        let saved = trained_rules(RuleKind::Adagrad, &layout, 1);
        save(&path, &saved, &layout);

        let mut loaded = fresh(RuleKind::Adagrad, layout.num_shards());
        load(&path, &mut loaded, &layout).unwrap();

        let (a, b) = (adagrad_gt(&saved), adagrad_gt(&loaded));
        assert_eq!(a.len(), 7);
        assert_eq!(
            a.iter().map(|x| x.to_bits()).collect::<Vec<_>>(),
            b.iter().map(|x| x.to_bits()).collect::<Vec<_>>()
        );
    }
}

#[test]
fn adam_round_trip() {
    init_logger();

    for sizes in [vec![10], vec![4, 4, 2]] {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("adam.safetensors");
        let layout = ShardLayout::from_sizes(sizes);

        let saved = trained_rules(RuleKind::Adam, &layout, 2);
        save(&path, &saved, &layout);

        let mut loaded = fresh(RuleKind::Adam, layout.num_shards());
        load(&path, &mut loaded, &layout).unwrap();

        assert_eq!(adam_moments(&saved), adam_moments(&loaded));
        for (saved, loaded) in saved.iter().zip(&loaded) {
            assert_eq!(
                saved.as_adam().unwrap().denoms(),
                loaded.as_adam().unwrap().denoms()
            );
        }
    }
}

#[test]
fn adam_reshards_on_load() {
    init_logger();

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("adam.safetensors");

    let one = ShardLayout::from_sizes(vec![6]);
    let saved = trained_rules(RuleKind::Adam, &one, 3);
    save(&path, &saved, &one);

    let two = ShardLayout::from_sizes(vec![4, 2]);
    let mut loaded = fresh(RuleKind::Adam, 2);
    load(&path, &mut loaded, &two).unwrap();

    assert_eq!(loaded[0].as_adam().unwrap().mt().unwrap().len(), 4);
    assert_eq!(loaded[1].as_adam().unwrap().mt().unwrap().len(), 2);
    assert_eq!(adam_moments(&saved), adam_moments(&loaded));
    assert_eq!(
        loaded[1].as_adam().unwrap().denoms(),
        saved[0].as_adam().unwrap().denoms()
    );
}

#[test]
fn adam_missing_denoms() {
    init_logger();

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("old.safetensors");
    checkpoint::save_items(
        &path,
        &[
            Item::from_f32("adam_mt", &[0.1, 0.2]),
            Item::from_f32("adam_vt", &[0.01, 0.04]),
        ],
    )
    .unwrap();

    let layout = ShardLayout::from_sizes(vec![2]);
    let mut loaded = fresh(RuleKind::Adam, 1);
    load(&path, &mut loaded, &layout).unwrap();

    let adam = loaded[0].as_adam().unwrap();
    assert_eq!(adam.denoms(), (0., 0.));
    assert_eq!(adam.mt().unwrap().to_f32_vec(), vec![0.1, 0.2]);
    assert_eq!(adam.vt().unwrap().to_f32_vec(), vec![0.01, 0.04]);
}

#[test]
fn adam_invalid_denoms() {
    init_logger();

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bad.safetensors");
    checkpoint::save_items(
        &path,
        &[
            Item::from_f32("adam_mt", &[0.1]),
            Item::from_f32("adam_vt", &[0.01]),
            Item::from_f64("adam_denoms", &[0.1, 0.2, 0.3]),
        ],
    )
    .unwrap();

    let layout = ShardLayout::from_sizes(vec![1]);
    let mut loaded = fresh(RuleKind::Adam, 1);
    let err = load(&path, &mut loaded, &layout).unwrap_err();

    assert!(matches!(err, OptimErr::InvalidDenoms { got: 3 }));
    assert!(loaded[0].as_adam().unwrap().mt().is_none());
}

#[test]
fn adam_moment_length_mismatch() {
    init_logger();

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bad.safetensors");
    checkpoint::save_items(
        &path,
        &[
            Item::from_f32("adam_mt", &[0.1, 0.2]),
            Item::from_f32("adam_vt", &[0.01]),
        ],
    )
    .unwrap();

    let layout = ShardLayout::from_sizes(vec![2]);
    let mut loaded = fresh(RuleKind::Adam, 1);
    let err = load(&path, &mut loaded, &layout).unwrap_err();

    assert!(matches!(err, OptimErr::SizeMismatch { got: 1, expected: 2, .. }));
}

#[test]
fn missing_vectors_leave_state_untouched() {
    init_logger();

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("partial.safetensors");
    checkpoint::save_items(&path, &[Item::from_f32("adam_mt", &[0.5])]).unwrap();

    let layout = ShardLayout::from_sizes(vec![1]);
    let mut loaded = fresh(RuleKind::Adam, 1);
    load(&path, &mut loaded, &layout).unwrap();

    assert!(loaded[0].as_adam().unwrap().mt().is_none());
}

#[test]
fn missing_file_is_not_an_error() {
    init_logger();

    let dir = TempDir::new().unwrap();
    let layout = ShardLayout::from_sizes(vec![3]);

    for kind in [RuleKind::Sgd, RuleKind::Adagrad, RuleKind::Adam] {
        let mut loaded = fresh(kind, 1);
        load(&dir.path().join("nope"), &mut loaded, &layout).unwrap();
    }
}

#[test]
fn layout_mismatch_touches_no_shard() {
    init_logger();

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("adagrad.safetensors");

    let saved_layout = ShardLayout::from_sizes(vec![3, 3]);
    let saved = trained_rules(RuleKind::Adagrad, &saved_layout, 4);
    save(&path, &saved, &saved_layout);

    let layout = ShardLayout::from_sizes(vec![2, 2]);
    let mut loaded = fresh(RuleKind::Adagrad, 2);
    let err = load(&path, &mut loaded, &layout).unwrap_err();

    assert!(matches!(err, OptimErr::SizeMismatch { got: 6, expected: 4, .. }));
    assert!(loaded.iter().all(|rule| rule.as_adagrad().unwrap().gt().is_none()));
}

#[test]
fn allocated_state_must_match_its_range() {
    init_logger();

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("adagrad.safetensors");

    let layout = ShardLayout::from_sizes(vec![2, 2]);
    let saved = trained_rules(RuleKind::Adagrad, &layout, 5);
    save(&path, &saved, &layout);

    let other = ShardLayout::from_sizes(vec![1, 3]);
    let mut loaded = trained_rules(RuleKind::Adagrad, &layout, 6);
    let before = adagrad_gt(&loaded);

    assert!(load(&path, &mut loaded, &other).is_err());
    assert_eq!(adagrad_gt(&loaded), before);
}

#[test]
fn shard_count_mismatch() {
    init_logger();

    let dir = TempDir::new().unwrap();
    let layout = ShardLayout::from_sizes(vec![1, 1]);
    let mut rules = fresh(RuleKind::Adam, 2);
    let mut refs: Vec<&mut UpdateRule> = rules.iter_mut().collect();

    let err = UpdateRule::load(dir.path().join("x"), &mut refs, &devices(1), &layout).unwrap_err();
    assert!(matches!(
        err,
        OptimErr::ShardCountMismatch {
            rules: 2,
            backends: 1
        }
    ));
}

#[test]
fn only_main_process_writes() {
    init_logger();

    let dir = TempDir::new().unwrap();
    let layout = ShardLayout::from_sizes(vec![2]);

    for kind in [RuleKind::Adagrad, RuleKind::Adam] {
        let path = dir.path().join(format!("{kind}.safetensors"));
        let saved = trained_rules(kind, &layout, 7);
        let refs: Vec<&UpdateRule> = saved.iter().collect();
        UpdateRule::save(&path, &refs, &layout, false).unwrap();

        assert!(!path.exists(), "{kind}");
    }
}

#[test]
fn save_before_first_update_writes_nothing() {
    init_logger();

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("adagrad.safetensors");
    let layout = ShardLayout::from_sizes(vec![2]);

    save(&path, &fresh(RuleKind::Adagrad, 1), &layout);
    assert!(!path.exists());
}

#[test]
fn wrong_item_dtype() {
    init_logger();

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("adagrad.safetensors");
    checkpoint::save_items(&path, &[Item::from_f64("adagrad_gt", &[1., 2.])]).unwrap();

    let layout = ShardLayout::from_sizes(vec![2]);
    let mut loaded = fresh(RuleKind::Adagrad, 1);
    let err = load(&path, &mut loaded, &layout).unwrap_err();

    assert!(matches!(
        err,
        OptimErr::DTypeMismatch {
            expected: DType::Float32,
            got: DType::Float64
        }
    ));
}

#[test]
fn training_resumes_identically() {
    init_logger();

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("adam.safetensors");
    let layout = ShardLayout::from_sizes(vec![3]);
    let device = CpuBackend::device(0);

    let mut saved = trained_rules(RuleKind::Adam, &layout, 8);
    save(&path, &saved, &layout);

    let mut loaded = fresh(RuleKind::Adam, 1);
    load(&path, &mut loaded, &layout).unwrap();

    let grads = Buffer::from_f32(device.clone(), DType::Float32, &[0.3, -0.2, 0.1]).unwrap();
    let mut a = Buffer::from_f32(device.clone(), DType::Float32, &[1., 2., 3.]).unwrap();
    let mut b = Buffer::from_f32(device, DType::Float32, &[1., 2., 3.]).unwrap();

    saved[0]
        .step(&mut a, &grads, StepContext::new(1e-3))
        .unwrap();
    loaded[0]
        .step(&mut b, &grads, StepContext::new(1e-3))
        .unwrap();

    assert_eq!(a.to_f32_vec(), b.to_f32_vec());
}
