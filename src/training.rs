use crate::attack::{self, AttackConfig};
use crate::data::{self, CifarBatch};
use crate::meters::{topk_hits, BestTracker, MeterSet};
use crate::model::{compute_losses, LossConfig, RobustLosses, StatsMode, WideResNet, WideResNetConfig};
use crate::sam::{Sam, SamConfig};
use crate::utils::{timestamp, ScalarLog};
use anyhow::{bail, Context, Result};
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::decay::WeightDecayConfig;
use burn::optim::lr_scheduler::LrScheduler;
use burn::optim::momentum::MomentumConfig;
use burn::optim::{GradientsParams, Optimizer, Sgd, SgdConfig};
use burn::prelude::*;
use burn::record::{CompactRecorder, Record, Recorder};
use burn::tensor::backend::AutodiffBackend;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Full run configuration. Defaults mirror the published training recipe;
/// `step_size` and `eps` are 2/255 and 8/255.
#[derive(Config, Debug)]
pub struct RunConfig {
    /// Directory holding the CIFAR-10 binary batches.
    pub data_dir: String,
    /// Output root for run logs and checkpoints.
    pub out_dir: String,
    #[config(default = true)]
    pub adaptive: bool,
    #[config(default = 128)]
    pub batch_size: usize,
    #[config(default = 16)]
    pub depth: usize,
    #[config(default = 0.0)]
    pub dropout: f64,
    #[config(default = 200)]
    pub epochs: usize,
    #[config(default = 0.1)]
    pub label_smoothing: f32,
    #[config(default = 0.1)]
    pub learning_rate: f64,
    #[config(default = 0.9)]
    pub momentum: f64,
    #[config(default = 8)]
    pub threads: usize,
    #[config(default = 2.0)]
    pub rho: f64,
    #[config(default = 0.0005)]
    pub weight_decay: f64,
    #[config(default = 8)]
    pub width_factor: usize,
    #[config(default = false)]
    pub trades: bool,
    #[config(default = false)]
    pub sgd: bool,
    #[config(default = 1.0)]
    pub beta: f64,
    #[config(default = 0.00784313725490196)]
    pub step_size: f64,
    #[config(default = 0.03137254901960784)]
    pub eps: f64,
    #[config(default = 10)]
    pub perturb_steps: usize,
    #[config(default = 42)]
    pub seed: u64,
    #[config(default = 10)]
    pub checkpoint_every: usize,
}

impl RunConfig {
    pub fn model_config(&self) -> WideResNetConfig {
        WideResNetConfig::new(self.depth, self.width_factor).with_dropout(self.dropout)
    }

    pub fn loss_config(&self) -> LossConfig {
        LossConfig::new()
            .with_beta(self.beta)
            .with_trades(self.trades)
            .with_label_smoothing(self.label_smoothing)
    }

    pub fn attack_config(&self) -> AttackConfig {
        AttackConfig::new(self.eps, self.step_size)
            .with_steps(self.perturb_steps)
            .with_trades(self.trades)
    }
}

/// The outer optimizer: sharpness-aware by default, plain SGD on opt-out.
pub enum RobustOptimizer<B: AutodiffBackend> {
    Sam(Sam<WideResNet<B>, B>),
    Sgd(OptimizerAdaptor<Sgd<B::InnerBackend>, WideResNet<B>, B>),
}

impl<B: AutodiffBackend> RobustOptimizer<B> {
    pub fn from_config(config: &RunConfig) -> Self {
        let base = SgdConfig::new()
            .with_momentum(Some(
                MomentumConfig::new().with_momentum(config.momentum),
            ))
            .with_weight_decay(Some(WeightDecayConfig::new(config.weight_decay as f32)))
            .init::<B, WideResNet<B>>();

        if config.sgd {
            RobustOptimizer::Sgd(base)
        } else {
            RobustOptimizer::Sam(
                SamConfig::new()
                    .with_rho(config.rho)
                    .with_adaptive(config.adaptive)
                    .init(base),
            )
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RobustOptimizer::Sam(_) => "SAM",
            RobustOptimizer::Sgd(_) => "SGD",
        }
    }
}

/// Per-batch result of an adversarial step, ready for metric caching.
pub struct AtOutput<B: Backend> {
    pub loss: f64,
    pub natural_loss: f64,
    pub robust_loss: f64,
    pub adv_logits: Tensor<B, 2>,
    pub logits: Tensor<B, 2>,
}

impl<B: Backend> AtOutput<B> {
    fn snapshot(losses: &RobustLosses<B>) -> Self {
        Self {
            loss: losses.loss.clone().into_scalar().elem::<f64>(),
            natural_loss: losses.natural_loss.clone().into_scalar().elem::<f64>(),
            robust_loss: losses.robust_loss.clone().into_scalar().elem::<f64>(),
            adv_logits: losses.adv_logits.clone().detach(),
            logits: losses.logits.clone().detach(),
        }
    }
}

/// One adversarial training iteration.
///
/// The inner search and both forward passes control the normalization
/// statistics explicitly: the search runs in eval mode, the first pass
/// updates the running buffers, the perturbed-point pass leaves them frozen.
pub fn at_train<B: AutodiffBackend>(
    model: WideResNet<B>,
    optimizer: &mut RobustOptimizer<B>,
    lr: f64,
    batch: &CifarBatch<B>,
    loss_config: &LossConfig,
    attack_config: &AttackConfig,
) -> (WideResNet<B>, AtOutput<B>) {
    let x_adv = attack::generate(
        &model,
        batch.images.clone(),
        batch.targets.clone(),
        attack_config,
    );

    // First pass at the unperturbed point; gradients live at the current
    // parameter values after this backward.
    let losses = compute_losses(
        &model,
        batch.images.clone(),
        x_adv.clone(),
        batch.targets.clone(),
        loss_config,
        StatsMode::Track,
    );
    let output = AtOutput::snapshot(&losses);
    let grads = GradientsParams::from_grads(losses.loss.backward(), &model);

    let model = match optimizer {
        RobustOptimizer::Sam(sam) => {
            let model = sam.ascend(model, grads);
            // Second pass at the perturbed point, statistics frozen.
            let perturbed = compute_losses(
                &model,
                batch.images.clone(),
                x_adv,
                batch.targets.clone(),
                loss_config,
                StatsMode::Frozen,
            );
            let grads = GradientsParams::from_grads(perturbed.loss.backward(), &model);
            sam.descend(lr, model, grads)
        }
        RobustOptimizer::Sgd(sgd) => sgd.step(lr, model, grads),
    };

    (model, output)
}

/// One adversarial validation iteration: same losses, no parameter update.
pub fn at_val<B: AutodiffBackend>(
    model: &WideResNet<B>,
    batch: &CifarBatch<B>,
    loss_config: &LossConfig,
    attack_config: &AttackConfig,
) -> AtOutput<B> {
    let x_adv = attack::generate(
        model,
        batch.images.clone(),
        batch.targets.clone(),
        attack_config,
    );
    let losses = compute_losses(
        model,
        batch.images.clone(),
        x_adv,
        batch.targets.clone(),
        loss_config,
        StatsMode::Eval,
    );
    AtOutput::snapshot(&losses)
}

/// Cosine annealing from the base rate to zero over `t_max` steps.
#[derive(Clone, Debug)]
pub struct CosineAnnealingLr {
    base_lr: f64,
    t_max: usize,
    epoch: usize,
    current: f64,
}

#[derive(Record, Clone)]
pub struct CosineAnnealingLrRecord {
    epoch: usize,
    current: f64,
}

impl CosineAnnealingLr {
    pub fn new(base_lr: f64, t_max: usize) -> Self {
        Self {
            base_lr,
            t_max: t_max.max(1),
            epoch: 0,
            current: base_lr,
        }
    }

    /// Rate for the current epoch, without advancing the schedule.
    pub fn current(&self) -> f64 {
        self.current
    }
}

impl LrScheduler for CosineAnnealingLr {
    type Record<B: Backend> = CosineAnnealingLrRecord;

    fn step(&mut self) -> f64 {
        self.epoch = (self.epoch + 1).min(self.t_max);
        let progress = self.epoch as f64 / self.t_max as f64;
        self.current = self.base_lr * 0.5 * (1.0 + (std::f64::consts::PI * progress).cos());
        self.current
    }

    fn to_record<B: Backend>(&self) -> Self::Record<B> {
        CosineAnnealingLrRecord {
            epoch: self.epoch,
            current: self.current,
        }
    }

    fn load_record<B: Backend>(mut self, record: Self::Record<B>) -> Self {
        self.epoch = record.epoch;
        self.current = record.current;
        self
    }
}

/// Checkpoint writer: `best` is overwritten on improvement, `epoch_<n>` is
/// written at fixed intervals and never overwritten.
pub struct Checkpoints {
    dir: PathBuf,
}

impl Checkpoints {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn save_best<B: Backend>(&self, model: &WideResNet<B>) -> Result<()> {
        self.save(model, "best")
    }

    pub fn save_epoch<B: Backend>(&self, model: &WideResNet<B>, epoch: usize) -> Result<()> {
        self.save(model, &format!("epoch_{epoch}"))
    }

    fn save<B: Backend>(&self, model: &WideResNet<B>, name: &str) -> Result<()> {
        let path = self.dir.join(name);
        CompactRecorder::new()
            .record(model.clone().into_record(), path.clone())
            .with_context(|| format!("failed to write checkpoint {}", path.display()))?;
        Ok(())
    }
}

/// Periodic checkpoint policy: every `every` epochs, starting at epoch 0.
pub fn is_checkpoint_epoch(epoch: usize, every: usize) -> bool {
    every > 0 && epoch % every == 0
}

/// Run the full training loop: alternate adversarial training and validation
/// sweeps, advance the schedule, track the best validation accuracy, and
/// persist checkpoints. Any failure aborts the run.
pub fn train<B: AutodiffBackend>(config: &RunConfig, title: &str, device: B::Device) -> Result<()> {
    B::seed(&device, config.seed);

    let out_dir = PathBuf::from(&config.out_dir);
    let run_dir = out_dir
        .join("runs")
        .join(format!("{title}-{}", timestamp()));
    let mut log = ScalarLog::create(&run_dir)?;
    config
        .save(run_dir.join("config.json"))
        .with_context(|| format!("failed to save config under {}", run_dir.display()))?;
    let checkpoints = Checkpoints::new(out_dir.join("checkpoint"))?;

    let (train_loader, val_loader) = data::loaders::<B>(
        Path::new(&config.data_dir),
        config.batch_size,
        config.threads,
        config.seed,
        &device,
    )?;

    let mut model: WideResNet<B> = config.model_config().init(&device);
    let mut optimizer = RobustOptimizer::from_config(config);
    let mut scheduler = CosineAnnealingLr::new(config.learning_rate, config.epochs);
    tracing::info!("using {}", optimizer.name());

    let loss_config = config.loss_config();
    let attack_config = config.attack_config();

    let mut train_meters = MeterSet::classification();
    let mut val_meters = MeterSet::classification();
    let mut best = BestTracker::default();

    for epoch in 0..config.epochs {
        val_meters.cache("best_val", best.best());

        // Training sweep.
        let lr = scheduler.current();
        for (batch_idx, batch) in train_loader.iter().enumerate() {
            let (updated, output) =
                at_train(model, &mut optimizer, lr, &batch, &loss_config, &attack_config);
            model = updated;

            if !output.loss.is_finite() {
                bail!("non-finite loss at epoch {epoch}, batch {batch_idx}; aborting run");
            }

            train_meters.cache("natural_loss", output.natural_loss);
            train_meters.cache("robust_loss", output.robust_loss);
            train_meters.cache_accuracy(&batch.targets, &output.adv_logits, &output.logits);

            if batch_idx % 10 == 0 {
                log_progress(epoch, batch_idx, &batch, &output);
            }
        }
        scheduler.step();

        let results = train_meters.flush();
        emit(&mut log, "train", &results, epoch)?;
        log.add_scalar("train/lr", lr, epoch)?;

        // Validation sweep.
        for (batch_idx, batch) in val_loader.iter().enumerate() {
            let output = at_val(&model, &batch, &loss_config, &attack_config);

            val_meters.cache("natural_loss", output.natural_loss);
            val_meters.cache("robust_loss", output.robust_loss);
            val_meters.cache_accuracy(&batch.targets, &output.adv_logits, &output.logits);

            if batch_idx % 10 == 0 {
                log_progress(epoch, batch_idx, &batch, &output);
            }
        }

        let results = val_meters.flush();
        emit(&mut log, "adv_val", &results, epoch)?;
        log.add_scalar("val/lr", scheduler.current(), epoch)?;

        let top1 = results.get("top1_accuracy").copied().unwrap_or(0.0);
        if best.observe(top1) {
            checkpoints.save_best(&model)?;
            tracing::info!(epoch, top1, "new best validation accuracy");
        }
        log.add_scalar("val/best_val", best.best(), epoch)?;

        if is_checkpoint_epoch(epoch, config.checkpoint_every) {
            checkpoints.save_epoch(&model, epoch)?;
        }
    }

    tracing::info!(best = best.best(), "training complete");
    Ok(())
}

fn log_progress<B: Backend>(
    epoch: usize,
    batch_idx: usize,
    batch: &CifarBatch<B>,
    output: &AtOutput<B>,
) {
    let mean = |hits: Vec<f64>| hits.iter().sum::<f64>() / hits.len().max(1) as f64;
    let accuracy = mean(topk_hits(&output.logits, &batch.targets, 1));
    let adv_accuracy = mean(topk_hits(&output.adv_logits, &batch.targets, 1));
    tracing::info!(
        "Epoch: [{epoch}][{batch_idx}] \t Loss {:.3} \t Adv_Loss {:.3} \t Acc {accuracy:.3} \t Adv_Acc {adv_accuracy:.3}",
        output.natural_loss,
        output.robust_loss,
    );
}

/// Write one sweep's flushed meters under a namespace, skipping the reserved
/// best_val meter (it gets its own tag).
fn emit(
    log: &mut ScalarLog,
    namespace: &str,
    results: &HashMap<String, f64>,
    epoch: usize,
) -> Result<()> {
    let mut names: Vec<&String> = results.keys().collect();
    names.sort();
    for name in names {
        if name != "best_val" {
            log.add_scalar(&format!("{namespace}/{name}"), results[name], epoch)?;
        }
    }
    Ok(())
}
