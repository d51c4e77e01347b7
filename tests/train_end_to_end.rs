use std::{
    fs,
    path::{Path, PathBuf},
};

use rand::SeedableRng;
use rand_pcg::Pcg64Mcg;

use mnist_grad::{
    dataloader::DataLoader,
    loss::{CrossEntropyLoss, NLLLoss},
    mnist::{Normalize, Split, encode_idx, load_split},
    nn::{Head, Module, mlp},
    optim::{self, OptimKind},
    train::{TrainConfig, argmax, evaluate, fit, predict_proba},
};

const SIDE: usize = 4;

/// Class 0 is a vertical bar, class 1 a horizontal bar, class 2 a diagonal, each shifted
fn synthetic_images(n_per_class: usize) -> (Vec<Vec<u8>>, Vec<u8>) {
    let mut images = vec![];
    let mut labels = vec![];
    for i in 0..n_per_class {
        let offset = i % SIDE;
        let mut vertical = vec![0u8; SIDE * SIDE];
        let mut horizontal = vec![0u8; SIDE * SIDE];
        let mut diagonal = vec![0u8; SIDE * SIDE];
        for k in 0..SIDE {
            vertical[k * SIDE + offset] = 255;
            horizontal[offset * SIDE + k] = 255;
            diagonal[k * SIDE + k] = 200 + (i % 50) as u8;
        }
        images.extend([vertical, horizontal, diagonal]);
        labels.extend([0, 1, 2]);
    }
    (images, labels)
}

fn write_split(dir: &Path, split: Split, n_per_class: usize) {
    let (images, labels) = synthetic_images(n_per_class);
    let (image_bytes, label_bytes) = encode_idx(SIDE, SIDE, &images, &labels);
    fs::write(split.images_path(dir), image_bytes).unwrap();
    fs::write(split.labels_path(dir), label_bytes).unwrap();
}

fn dataset_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("mnist-grad-{}-{}", name, std::process::id()));
    fs::create_dir_all(&dir).unwrap();
    write_split(&dir, Split::Train, 12);
    write_split(&dir, Split::Test, 4);
    dir
}

#[test]
fn trains_on_idx_files_with_nll() {
    let dir = dataset_dir("nll");
    let train = load_split(&dir, Split::Train, Normalize::default(), None).unwrap();
    let test = load_split(&dir, Split::Test, Normalize::default(), None).unwrap();
    assert_eq!(train.len(), 36);
    assert_eq!(train.n_features(), SIDE * SIDE);

    let mut rng = Pcg64Mcg::seed_from_u64(0);
    let model = mlp(train.n_features(), &[12, 8], 3, Head::LogSoftmax, &mut rng).unwrap();
    let mut optim = optim::build(OptimKind::Sgd, model.parameters(), 0.05, 0.9);
    let loader = DataLoader::from_mnist(train, 6, true).unwrap();
    let config = TrainConfig {
        epochs: 25,
        seed: Some(1),
        log_every: 2,
    };

    let history = fit(&model, &NLLLoss, optim.as_mut(), &loader, &config).unwrap();
    assert_eq!(history.len(), 25);
    assert!(history.iter().all(|s| s.loss.is_finite()));
    assert!(history.last().unwrap().loss < history[0].loss);

    let test_loader = DataLoader::from_mnist(test.clone(), 5, false).unwrap();
    let accuracy = evaluate(&model, &test_loader).unwrap();
    assert!(accuracy > 0.9, "test accuracy {}", accuracy);

    let probs = predict_proba(&model, Head::LogSoftmax, &test.images[1]).unwrap();
    assert!((probs.iter().sum::<f32>() - 1.0).abs() < 1e-4);
    assert_eq!(argmax(&probs), Some(test.labels[1] as usize));

    fs::remove_dir_all(&dir).ok();
}

#[test]
fn trains_with_adam_and_cross_entropy() {
    let dir = dataset_dir("adam");
    let train = load_split(&dir, Split::Train, Normalize::default(), Some(24)).unwrap();
    assert_eq!(train.len(), 24);

    let mut rng = Pcg64Mcg::seed_from_u64(2);
    let model = mlp(train.n_features(), &[10], 3, Head::Logits, &mut rng).unwrap();
    let mut optim = optim::build(OptimKind::Adam, model.parameters(), 0.01, 0.0);
    let loader = DataLoader::from_mnist(train, 4, true).unwrap();
    let config = TrainConfig {
        epochs: 20,
        seed: Some(3),
        log_every: 0,
    };

    let history = fit(&model, &CrossEntropyLoss, optim.as_mut(), &loader, &config).unwrap();
    assert!(history.last().unwrap().loss < history[0].loss);
    assert!(evaluate(&model, &loader).unwrap() > 0.9);

    fs::remove_dir_all(&dir).ok();
}
