use crate::model::{kl_divergence, StatsMode, WideResNet};
use burn::nn::loss::CrossEntropyLossConfig;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::Distribution;

/// Projected gradient descent search parameters.
#[derive(Config, Debug)]
pub struct AttackConfig {
    /// L-infinity radius of the perturbation ball.
    pub eps: f64,
    /// Sign-gradient step size per iteration.
    pub step_size: f64,
    /// Number of search iterations.
    #[config(default = 10)]
    pub steps: usize,
    /// Maximize KL against the clean-output distribution instead of
    /// cross-entropy against the label.
    #[config(default = false)]
    pub trades: bool,
}

/// Generate an adversarial batch within the eps-ball around the clean input.
///
/// Every forward pass runs in `StatsMode::Eval`: the search must not disturb
/// running statistics, no matter which caller invokes it. Gradients are taken
/// with respect to the input only; parameter gradients produced by the
/// backward pass are discarded with the iteration's gradient container. The
/// returned tensor is detached.
pub fn generate<B: AutodiffBackend>(
    model: &WideResNet<B>,
    x_natural: Tensor<B, 4>,
    targets: Tensor<B, 1, Int>,
    config: &AttackConfig,
) -> Tensor<B, 4> {
    let device = x_natural.device();
    let x_natural = x_natural.detach();

    // Randomized start inside the ball.
    let noise = Tensor::random(
        x_natural.shape(),
        Distribution::Uniform(-config.eps, config.eps),
        &device,
    );
    let mut x_adv = x_natural.clone().add(noise).clamp(0.0, 1.0);

    // The clean-output distribution is loop-invariant under eval mode.
    let natural_logits = config
        .trades
        .then(|| model.forward(x_natural.clone(), StatsMode::Eval).detach());
    let criterion = CrossEntropyLossConfig::new().init(&device);

    let lower = x_natural.clone().sub_scalar(config.eps);
    let upper = x_natural.add_scalar(config.eps);

    for _ in 0..config.steps {
        let x_search = x_adv.clone().detach().require_grad();
        let adv_logits = model.forward(x_search.clone(), StatsMode::Eval);

        let loss = match &natural_logits {
            Some(natural) => kl_divergence(adv_logits, natural.clone()),
            None => criterion.forward(adv_logits, targets.clone()),
        };
        let grads = loss.backward();
        let grad = x_search
            .grad(&grads)
            .expect("adversarial input missing from gradient computation");

        let step = Tensor::from_inner(grad.sign()).mul_scalar(config.step_size);
        x_adv = x_adv
            .detach()
            .add(step)
            .max_pair(lower.clone())
            .min_pair(upper.clone())
            .clamp(0.0, 1.0);
    }

    x_adv.detach()
}
