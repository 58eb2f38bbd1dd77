pub mod norm;
pub mod wide_res_net;

use burn::nn::loss::CrossEntropyLossConfig;
use burn::prelude::*;
use burn::tensor::activation::{log_softmax, softmax};

pub use norm::{StatsMode, TrackedBatchNorm};
pub use wide_res_net::{WideResNet, WideResNetConfig};

/// Weighting and shape of the combined adversarial training objective.
#[derive(Config, Debug)]
pub struct LossConfig {
    /// Weight of the robust term: loss = natural + beta * robust.
    #[config(default = 1.0)]
    pub beta: f64,
    /// Robust term is a KL divergence against the clean-output distribution
    /// when set; cross-entropy against the label otherwise.
    #[config(default = false)]
    pub trades: bool,
    #[config(default = 0.1)]
    pub label_smoothing: f32,
}

/// Loss values and logits for one batch.
#[derive(Debug)]
pub struct RobustLosses<B: Backend> {
    pub loss: Tensor<B, 1>,
    pub natural_loss: Tensor<B, 1>,
    pub robust_loss: Tensor<B, 1>,
    pub logits: Tensor<B, 2>,
    pub adv_logits: Tensor<B, 2>,
}

/// Compute the combined natural + robust loss for a clean/adversarial batch
/// pair. Both forwards run under the given statistics mode.
pub fn compute_losses<B: Backend>(
    model: &WideResNet<B>,
    x_natural: Tensor<B, 4>,
    x_adv: Tensor<B, 4>,
    targets: Tensor<B, 1, Int>,
    config: &LossConfig,
    mode: StatsMode,
) -> RobustLosses<B> {
    let device = x_natural.device();
    let smoothing = (config.label_smoothing > 0.0).then_some(config.label_smoothing);
    let criterion = CrossEntropyLossConfig::new()
        .with_smoothing(smoothing)
        .init(&device);

    let logits = model.forward(x_natural, mode);
    let adv_logits = model.forward(x_adv, mode);

    let natural_loss = criterion.forward(logits.clone(), targets.clone());
    let robust_loss = if config.trades {
        kl_divergence(adv_logits.clone(), logits.clone())
    } else {
        criterion.forward(adv_logits.clone(), targets)
    };

    let loss = natural_loss
        .clone()
        .add(robust_loss.clone().mul_scalar(config.beta));

    RobustLosses {
        loss,
        natural_loss,
        robust_loss,
        logits,
        adv_logits,
    }
}

/// Batch-mean KL divergence KL(natural || adversarial) over class
/// distributions, the TRADES robustness term.
pub fn kl_divergence<B: Backend>(
    adv_logits: Tensor<B, 2>,
    natural_logits: Tensor<B, 2>,
) -> Tensor<B, 1> {
    let p_natural = softmax(natural_logits.clone(), 1);
    let log_ratio = log_softmax(natural_logits, 1).sub(log_softmax(adv_logits, 1));
    p_natural.mul(log_ratio).sum_dim(1).mean()
}
