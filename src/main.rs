//! Демонстрация: обучение `y = 2x + 1` любым из оптимизаторов.
//!
//! ```text
//! asg-optim --optimizer adam --learning-rate 0.05 --epochs 200
//! asg-optim --config optimizer.json --checkpoint-dir ./ckpt
//! RUST_LOG=debug asg-optim --optimizer ftrl --clip-value 1.0
//! ```

use asg_optim::asg::Value;
use asg_optim::losses::mse_loss_mean;
use asg_optim::nn::{Linear, Module};
use asg_optim::optimizers::{
    AdaDeltaConfig, AdaGradConfig, AdaGradDAConfig, AdamConfig, AdamaxConfig, Algorithm, ClipConfig, FtrlConfig,
    MomentumConfig, OptimizerConfig, RmsPropConfig, SgdConfig,
};
use asg_optim::runtime::Session;
use asg_optim::serialization::{save_checkpoint, Checkpoint, CheckpointConfig, OptimizerState};
use asg_optim::tensor::{GraphContext, Tensor};

use clap::{Parser, ValueEnum};
use log::info;
use ndarray::{Array, ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Instant;

#[derive(ValueEnum, Clone, Copy, Debug)]
enum OptimizerKind {
    Sgd,
    Momentum,
    Adagrad,
    AdagradDa,
    Adadelta,
    Rmsprop,
    Adam,
    Adamax,
    Ftrl,
}

impl OptimizerKind {
    fn default_algorithm(self) -> Algorithm {
        match self {
            OptimizerKind::Sgd => Algorithm::Sgd(SgdConfig::default()),
            OptimizerKind::Momentum => Algorithm::Momentum(MomentumConfig::default()),
            OptimizerKind::Adagrad => Algorithm::AdaGrad(AdaGradConfig::default()),
            OptimizerKind::AdagradDa => Algorithm::AdaGradDA(AdaGradDAConfig::default()),
            OptimizerKind::Adadelta => Algorithm::AdaDelta(AdaDeltaConfig::default()),
            OptimizerKind::Rmsprop => Algorithm::RmsProp(RmsPropConfig::default()),
            OptimizerKind::Adam => Algorithm::Adam(AdamConfig::default()),
            OptimizerKind::Adamax => Algorithm::Adamax(AdamaxConfig::default()),
            OptimizerKind::Ftrl => Algorithm::Ftrl(FtrlConfig::default()),
        }
    }
}

/// Аргументы командной строки
#[derive(Parser, Debug)]
#[command(author, version, about = "Graph-building optimizers: linear regression demo", long_about = None)]
struct Args {
    /// Алгоритм оптимизации (игнорируется, если задан --config)
    #[arg(short, long, value_enum, default_value_t = OptimizerKind::Adam)]
    optimizer: OptimizerKind,

    /// JSON-файл с конфигурацией оптимизатора
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Переопределить learning rate
    #[arg(short, long)]
    learning_rate: Option<f32>,

    /// Ограничить градиент поэлементно значением
    #[arg(long)]
    clip_value: Option<f32>,

    #[arg(short, long, default_value_t = 300)]
    epochs: usize,

    /// Куда сохранить чекпоинт после обучения
    #[arg(long)]
    checkpoint_dir: Option<PathBuf>,

    #[arg(long, default_value_t = 42)]
    seed: u64,
}

fn optimizer_config(args: &Args) -> Result<OptimizerConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => OptimizerConfig::from_json_str(&std::fs::read_to_string(path)?)?,
        None => {
            let lr = args.learning_rate.unwrap_or(0.05);
            OptimizerConfig::new(args.optimizer.default_algorithm().with_learning_rate(lr))
        }
    };
    if let (Some(_), Some(lr)) = (&args.config, args.learning_rate) {
        config.algorithm = config.algorithm.with_learning_rate(lr);
    }
    if let Some(clip_value) = args.clip_value {
        config.clip = ClipConfig::Value { clip_value };
    }
    Ok(config)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();
    let config = optimizer_config(&args)?;
    let optimizer = config.build()?;

    println!("--- Обучение y = 2x + 1 ---");
    println!("[Config] {}", config.to_json_string()?);

    // ---------- 1. Построение графа ----------
    let context = Rc::new(RefCell::new(GraphContext::new()));
    let mut rng = StdRng::seed_from_u64(args.seed);
    let batch = 16;
    let x = Tensor::new_input(&context, "x", &[batch, 1]);
    let y = Tensor::new_input(&context, "y", &[batch, 1]);

    let model = Linear::new(&context, 1, 1, "dense", &mut rng);
    let prediction = model.forward(&x);
    let loss = mse_loss_mean(&prediction, &y);

    // ---------- 2. Узлы обновления ----------
    let targets = optimizer.prepare_targets(&context, &model.parameters(), &loss)?;
    println!(
        "[1] {}: {} узл(а) обновления, переменных оптимизатора: {}",
        optimizer.name(),
        targets.len(),
        context.borrow().optimizer_variables().len()
    );

    // ---------- 3. Данные ----------
    let xs: ArrayD<f32> = Array::linspace(-1.0, 1.0, batch).into_shape(IxDyn(&[batch, 1]))?;
    let ys = xs.mapv(|v| 2.0 * v + 1.0);
    let feeds: HashMap<String, Value> = [
        ("x".to_string(), Value::Tensor(xs)),
        ("y".to_string(), Value::Tensor(ys)),
    ]
    .into_iter()
    .collect();

    // ---------- 4. Обучение ----------
    let mut session = Session::new();
    session.initialize_graph_variables(&context)?;
    session.initialize_optimizer_variables(&context)?;

    let start_time = Instant::now();
    let mut last_loss = f32::NAN;
    let mut best_loss = f32::INFINITY;
    let report_every = (args.epochs / 10).max(1);
    for epoch in 0..args.epochs {
        let outputs = session.run_training_step(&context, std::iter::once(&loss).chain(&targets), &feeds)?;
        last_loss = outputs.first().and_then(Value::first).unwrap_or(f32::NAN);
        best_loss = best_loss.min(last_loss);
        if epoch % report_every == 0 || epoch + 1 == args.epochs {
            println!("Эпоха: {:<4} Потери (Loss): {:.6}", epoch + 1, last_loss);
        }
    }
    info!("training finished in {:.2?}", start_time.elapsed());

    let weights = session.model_weights(&context);
    for name in ["dense.weights", "dense.bias"] {
        if let Some(value) = weights.get(name).and_then(Value::first) {
            println!("{} = {:.4}", name, value);
        }
    }

    // ---------- 5. Чекпоинт ----------
    if let Some(dir) = &args.checkpoint_dir {
        let checkpoint = Checkpoint::new(
            weights,
            CheckpointConfig::new()
                .with_model_name("linear_regression")
                .with_epoch(args.epochs)
                .with_global_step(args.epochs)
                .with_last_loss(last_loss)
                .with_best_loss(best_loss),
        )
        .with_optimizer_state(OptimizerState::new(config, session.optimizer_state(&context)));
        save_checkpoint(dir, &checkpoint)?;
        println!("[2] Чекпоинт сохранен в {}", dir.display());
    }

    Ok(())
}
