//! Walks through training a feed-forward network on MNIST, one subcommand per step,
//! using the library provided by `mnist_grad`
//!
//! # Usage
//! Runnable via
//! ```sh
//! cargo run --release -- -h
//! cargo run --release -- autograd
//! cargo run --release -- loss --data-dir data/MNIST/raw
//! cargo run --release -- step
//! cargo run --release -- train --epochs 5
//! ```
//!
//! The IDX files (`train-images-idx3-ubyte`, ...) must already be unpacked in
//! `--data-dir`. Set `RUST_LOG=debug` for per-batch and per-layer diagnostics.

use std::{error::Error, fs, path::PathBuf};

use clap::{Args, Parser, Subcommand};
use rand::SeedableRng;
use rand_pcg::Pcg64Mcg;

use mnist_grad::{
    dataloader::{Batch, DataLoader},
    loss::{Criterion, CrossEntropyLoss, NLLLoss, batch_mean},
    mnist::{DatasetKind, Mnist, MnistError, Normalize, Split, load_split},
    nn::{Head, Module, Sequential, mlp},
    optim::{self, Optim, OptimKind, SGD},
    tensor::Tensor,
    train::{TrainConfig, argmax, backward_batch, evaluate, fit, predict_proba},
    value::Value,
    viz::{plot_loss_history, view_classify},
};

#[derive(Parser)]
#[command(about = "Train a small feed-forward classifier on MNIST with scalar autograd")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compute the loss of an untrained network on one batch
    Loss(DataArgs),
    /// Backpropagate through `mean(x^2)` for a random 2x2 tensor
    Autograd {
        #[arg(long, default_value_t = 0)]
        seed: u64,
    },
    /// Take a single SGD step on one batch and show how the weights move
    Step {
        #[command(flatten)]
        data: DataArgs,
        #[arg(long, default_value_t = 0.01)]
        lr: f32,
    },
    /// Train for several epochs, then classify one test image
    Train(TrainArgs),
}

#[derive(Args)]
struct DataArgs {
    #[arg(long, default_value = "data/MNIST/raw")]
    data_dir: PathBuf,
    #[arg(long, value_enum, default_value_t = DatasetKind::Mnist)]
    dataset: DatasetKind,
    #[arg(short, long, default_value_t = 64)]
    batch_size: usize,
    /// Hidden layer widths, comma separated
    #[arg(long, value_delimiter = ',', default_values_t = vec![128, 64])]
    hidden: Vec<usize>,
    /// Seeds weight initialisation and shuffling
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

#[derive(Args)]
struct TrainArgs {
    #[command(flatten)]
    data: DataArgs,
    #[arg(short, long, default_value_t = 5)]
    epochs: usize,
    #[arg(short, long, default_value_t = 0.003)]
    lr: f32,
    #[arg(short, long, default_value_t = 0.0)]
    momentum: f32,
    #[arg(long, value_enum, default_value_t = OptimKind::Sgd)]
    optim: OptimKind,
    /// `log-softmax` trains with NLLLoss, `logits` with CrossEntropyLoss
    #[arg(long, value_enum, default_value_t = Head::LogSoftmax)]
    head: Head,
    /// Number of training images to use. Every weight is its own graph node, so the
    /// full 60000 images take a long time per epoch
    #[arg(long, default_value_t = 6000)]
    train_samples: usize,
    #[arg(long, default_value_t = 1000)]
    test_samples: usize,
    /// Index of the test image to classify after training
    #[arg(long, default_value_t = 0)]
    sample: usize,
    /// Log the running loss every N batches, 0 only logs once per epoch
    #[arg(long, default_value_t = 20)]
    log_every: usize,
    #[arg(short, long, default_value = "output")]
    output_dir: PathBuf,
}

const N_CLASSES: usize = 10;

fn criterion_for(head: Head) -> Box<dyn Criterion> {
    match head {
        Head::LogSoftmax => Box::new(NLLLoss),
        Head::Logits => Box::new(CrossEntropyLoss),
    }
}

fn build_model(data: &Mnist, args: &DataArgs, head: Head) -> Result<Sequential, Box<dyn Error>> {
    let mut rng = Pcg64Mcg::seed_from_u64(args.seed);
    let model = mlp(data.n_features(), &args.hidden, N_CLASSES, head, &mut rng)?;
    Ok(model)
}

/// Loads just enough training images for one batch
fn first_batch(args: &DataArgs) -> Result<(Mnist, Batch), Box<dyn Error>> {
    let data = load_split(
        &args.data_dir,
        Split::Train,
        Normalize::default(),
        Some(args.batch_size),
    )?;
    let loader = DataLoader::from_mnist(data.clone(), args.batch_size, true)?;
    let batch = loader
        .seeded_iter(args.seed)
        .next()
        .ok_or("The training set is empty")?;
    Ok((data, batch))
}

fn outputs(model: &dyn Module, batch: &Batch) -> Result<Vec<Vec<Value>>, Box<dyn Error>> {
    let outputs = batch
        .inputs
        .iter()
        .map(|input| model.forward(input))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(outputs)
}

fn run_loss(args: &DataArgs) -> Result<(), Box<dyn Error>> {
    let (data, batch) = first_batch(args)?;

    let model = build_model(&data, args, Head::Logits)?;
    println!("{}", model);
    let logits = outputs(&model, &batch)?;
    let loss = batch_mean(&CrossEntropyLoss, &logits, &batch.targets)?;
    println!("CrossEntropyLoss on raw logits: {:.4}", loss.data());

    // same seed, same weights, only the head differs
    let model = build_model(&data, args, Head::LogSoftmax)?;
    println!("{}", model);
    let log_probs = outputs(&model, &batch)?;
    let loss = batch_mean(&NLLLoss, &log_probs, &batch.targets)?;
    println!("NLLLoss on log-softmax output: {:.4}", loss.data());
    Ok(())
}

fn run_autograd(seed: u64) {
    let mut rng = Pcg64Mcg::seed_from_u64(seed);
    let x = Tensor::randn(2, 2, &mut rng);
    println!("x = {}", x);

    let y = x.powf(2.0);
    println!("y = x^2 = {}", y);
    if let Some(op) = y.values()[0].op() {
        println!("y was created by {}", op.grad_fn_name());
    }

    let z = y.mean();
    println!("z = mean(y) = {:.4}", z.data());
    println!("graph of z:\n{}", z);

    println!("x.grad before backward = {}", x.grad_tensor());
    z.backward();
    println!("x.grad = {}", x.grad_tensor());
    println!("x / 2  = {}", x.map(|v| v / &Value::new(2.0)));
}

fn run_step(args: &DataArgs, lr: f32) -> Result<(), Box<dyn Error>> {
    let (data, batch) = first_batch(args)?;
    let model = build_model(&data, args, Head::Logits)?;
    let mut optim = SGD::new(model.parameters(), lr);

    let first_weights = |optim: &SGD| {
        optim
            .params()
            .iter()
            .take(5)
            .map(|p| format!("{:.5}", p.data()))
            .collect::<Vec<_>>()
            .join(", ")
    };
    println!("Initial weights: [{}]", first_weights(&optim));

    optim.zero_grad();
    let (loss, _) = backward_batch(&model, &CrossEntropyLoss, &batch)?;
    let grads = optim
        .params()
        .iter()
        .take(5)
        .map(|p| format!("{:.5}", p.grad()))
        .collect::<Vec<_>>()
        .join(", ");
    println!("Loss: {:.4}", loss);
    println!("Gradient: [{}]", grads);

    optim.step();
    println!("Updated weights: [{}]", first_weights(&optim));
    Ok(())
}

fn run_train(args: &TrainArgs) -> Result<(), Box<dyn Error>> {
    let normalize = Normalize::default();
    fs::create_dir_all(&args.output_dir)?;

    let train_data = load_split(
        &args.data.data_dir,
        Split::Train,
        normalize,
        Some(args.train_samples),
    )?;
    let test_data = match load_split(
        &args.data.data_dir,
        Split::Test,
        normalize,
        Some(args.test_samples),
    ) {
        Ok(test) => Some(test),
        Err(e @ MnistError::Io { .. }) => {
            log::warn!("{}, classifying a training image instead", e);
            None
        }
        Err(e) => return Err(e.into()),
    };

    let model = build_model(&train_data, &args.data, args.head)?;
    log::info!("Model:\n{}", model);
    let criterion = criterion_for(args.head);
    let mut optim = optim::build(args.optim, model.parameters(), args.lr, args.momentum);

    let loader = DataLoader::from_mnist(train_data.clone(), args.data.batch_size, true)?;
    let config = TrainConfig {
        epochs: args.epochs,
        seed: Some(args.data.seed),
        log_every: args.log_every,
    };
    let history = fit(&model, criterion.as_ref(), optim.as_mut(), &loader, &config)?;
    plot_loss_history(&history, &args.output_dir.join("loss.png"))?;

    let shown = match test_data {
        Some(test) => {
            let test_loader = DataLoader::from_mnist(test.clone(), args.data.batch_size, false)?;
            let accuracy = evaluate(&model, &test_loader)?;
            log::info!("Test accuracy: {:.3}", accuracy);
            test
        }
        None => train_data,
    };

    let index = args.sample.min(shown.len().saturating_sub(1));
    let pixels = shown
        .images
        .get(index)
        .ok_or("No image available to classify")?;
    let probs = predict_proba(&model, args.head, pixels)?;
    let class_names = args.data.dataset.class_names();
    if let Some(pred) = argmax(&probs) {
        log::info!(
            "Image {} is labelled '{}', predicted '{}' with probability {:.3}",
            index,
            args.data.dataset.label_name(shown.labels[index]),
            class_names[pred],
            probs[pred]
        );
    }

    let intensities = pixels.iter().map(|p| normalize.invert(*p)).collect::<Vec<_>>();
    view_classify(
        &intensities,
        shown.rows,
        shown.cols,
        &probs,
        &class_names,
        &args.output_dir.join(format!("classify_{}.png", args.data.dataset)),
    )?;
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match &cli.command {
        Command::Loss(args) => run_loss(args),
        Command::Autograd { seed } => {
            run_autograd(*seed);
            Ok(())
        }
        Command::Step { data, lr } => run_step(data, *lr),
        Command::Train(args) => run_train(args),
    }
}
