#![recursion_limit = "256"]
use anyhow::Result;
use burn::backend::Autodiff;
use burn::prelude::*;
use burn_cuda::{Cuda, CudaDevice};
use clap::Parser;
use samat_burn::training::{self, RunConfig};
use tracing_subscriber::EnvFilter;

type TrainingBackend = Autodiff<Cuda>;

#[derive(Parser, Debug)]
#[command(about = "Adversarial training with sharpness-aware minimization")]
#[command(rename_all = "snake_case")]
struct Args {
    /// Use the adaptive SAM variant (perturbation scaled by |parameter|).
    #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
    adaptive: bool,
    /// Batch size used in the training and validation loop.
    #[arg(long, default_value_t = 128)]
    batch_size: usize,
    /// Number of layers.
    #[arg(long, default_value_t = 16)]
    depth: usize,
    /// Dropout rate.
    #[arg(long, default_value_t = 0.0)]
    dropout: f64,
    /// Total number of epochs.
    #[arg(long, default_value_t = 200)]
    epochs: usize,
    /// Use 0.0 for no label smoothing.
    #[arg(long, default_value_t = 0.1)]
    label_smoothing: f32,
    /// Base learning rate at the start of the training.
    #[arg(long, default_value_t = 0.1)]
    learning_rate: f64,
    /// SGD momentum.
    #[arg(long, default_value_t = 0.9)]
    momentum: f64,
    /// Number of dataloader prefetch workers.
    #[arg(long, default_value_t = 8)]
    threads: usize,
    /// Rho parameter for SAM.
    #[arg(long, default_value_t = 2.0)]
    rho: f64,
    /// L2 weight decay.
    #[arg(long, default_value_t = 0.0005)]
    weight_decay: f64,
    /// How many times wider compared to a normal ResNet.
    #[arg(long, default_value_t = 8)]
    width_factor: usize,
    /// Use the TRADES robust loss (KL against the clean distribution).
    #[arg(long)]
    trades: bool,
    /// Opt out of SAM and use plain SGD.
    #[arg(long)]
    sgd: bool,
    /// Robust-loss weight: loss = ce + beta * adv, range 0.1..5.0.
    #[arg(long, default_value_t = 1.0)]
    beta: f64,
    /// GPU device id.
    #[arg(long, default_value_t = 0)]
    gpu: usize,
    /// PGD step size.
    #[arg(long, default_value_t = 2.0 / 255.0)]
    step_size: f64,
    /// PGD epsilon.
    #[arg(long, default_value_t = 8.0 / 255.0)]
    eps: f64,
    /// PGD iteration steps.
    #[arg(long, default_value_t = 10)]
    perturb_step: usize,
    /// Directory holding the CIFAR-10 binary batches.
    #[arg(long, default_value = "data/cifar-10-batches-bin")]
    data_dir: String,
    /// Output root for run logs and checkpoints.
    #[arg(long, default_value = "out")]
    out_dir: String,
}

impl Args {
    fn to_run_config(&self) -> RunConfig {
        RunConfig::new(self.data_dir.clone(), self.out_dir.clone())
            .with_adaptive(self.adaptive)
            .with_batch_size(self.batch_size)
            .with_depth(self.depth)
            .with_dropout(self.dropout)
            .with_epochs(self.epochs)
            .with_label_smoothing(self.label_smoothing)
            .with_learning_rate(self.learning_rate)
            .with_momentum(self.momentum)
            .with_threads(self.threads)
            .with_rho(self.rho)
            .with_weight_decay(self.weight_decay)
            .with_width_factor(self.width_factor)
            .with_trades(self.trades)
            .with_sgd(self.sgd)
            .with_beta(self.beta)
            .with_step_size(self.step_size)
            .with_eps(self.eps)
            .with_perturb_steps(self.perturb_step)
    }
}

/// Human-readable run identifier: every option that differs from its
/// default, plus boolean options set to true.
fn run_title(args: &Args) -> String {
    let defaults = Args::parse_from(["train"]);
    let mut titles = Vec::new();

    macro_rules! option {
        ($field:ident) => {
            if args.$field != defaults.$field {
                titles.push(format!("{}={}", stringify!($field), args.$field));
            }
        };
    }
    macro_rules! flag {
        ($field:ident) => {
            if args.$field != defaults.$field || args.$field {
                titles.push(format!("{}={}", stringify!($field), args.$field));
            }
        };
    }

    flag!(adaptive);
    option!(batch_size);
    option!(depth);
    option!(dropout);
    option!(epochs);
    option!(label_smoothing);
    option!(learning_rate);
    option!(momentum);
    option!(threads);
    option!(rho);
    option!(weight_decay);
    option!(width_factor);
    flag!(trades);
    flag!(sgd);
    option!(beta);
    option!(gpu);
    option!(step_size);
    option!(eps);
    option!(perturb_step);

    titles.join(",")
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("samat_burn=info".parse()?)
                .add_directive("train=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let title = run_title(&args);
    let config = args.to_run_config();

    // No silent CPU fallback: allocate on the accelerator before anything
    // else so a missing device fails the run immediately.
    let device = CudaDevice::new(args.gpu);
    let _warmup = Tensor::<TrainingBackend, 1>::zeros([1], &device);
    tracing::info!(?device, "accelerator ready");

    training::train::<TrainingBackend>(&config, &title, device)
}
