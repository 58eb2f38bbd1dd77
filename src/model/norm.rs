use burn::module::{Param, RunningState};
use burn::nn::Initializer;
use burn::prelude::*;

/// Controls how a forward pass interacts with normalization statistics.
///
/// The adversarial search, the two optimizer passes, and validation each need
/// a different policy, so the choice is an explicit argument instead of
/// hidden module state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatsMode {
    /// Normalize with batch statistics and update the running buffers.
    Track,
    /// Normalize with batch statistics; running buffers stay untouched.
    Frozen,
    /// Normalize with the running buffers (inference).
    Eval,
}

impl StatsMode {
    /// True for the two training-time modes that normalize with batch
    /// statistics (and keep dropout active).
    pub fn is_train(self) -> bool {
        matches!(self, StatsMode::Track | StatsMode::Frozen)
    }
}

/// Batch normalization over NCHW feature maps with caller-controlled
/// running-statistics updates.
#[derive(Module, Debug)]
pub struct TrackedBatchNorm<B: Backend> {
    gamma: Param<Tensor<B, 1>>,
    beta: Param<Tensor<B, 1>>,
    running_mean: RunningState<Tensor<B, 1>>,
    running_var: RunningState<Tensor<B, 1>>,
    #[module(ignore)]
    momentum: f64,
    #[module(ignore)]
    epsilon: f64,
}

impl<B: Backend> TrackedBatchNorm<B> {
    pub fn new(num_features: usize, device: &B::Device) -> Self {
        let gamma = Initializer::Ones.init([num_features], device);
        let beta = Initializer::Zeros.init([num_features], device);
        Self {
            gamma,
            beta,
            running_mean: RunningState::new(Tensor::zeros([num_features], device)),
            running_var: RunningState::new(Tensor::ones([num_features], device)),
            momentum: 0.1,
            epsilon: 1e-5,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>, mode: StatsMode) -> Tensor<B, 4> {
        let channels = x.dims()[1];

        let (mean, var) = match mode {
            StatsMode::Eval => (
                self.running_mean.value().reshape([1, channels, 1, 1]),
                self.running_var.value().reshape([1, channels, 1, 1]),
            ),
            StatsMode::Track | StatsMode::Frozen => {
                let mean = x.clone().mean_dims(&[0, 2, 3]);
                let var = x.clone().sub(mean.clone()).square().mean_dims(&[0, 2, 3]);
                if mode == StatsMode::Track {
                    self.update_buffers(mean.clone(), var.clone(), channels);
                }
                (mean, var)
            }
        };

        let norm = x.sub(mean).div((var + self.epsilon).sqrt());
        let gamma = self.gamma.val().reshape([1, channels, 1, 1]);
        let beta = self.beta.val().reshape([1, channels, 1, 1]);
        norm.mul(gamma).add(beta)
    }

    fn update_buffers(&self, mean: Tensor<B, 4>, var: Tensor<B, 4>, channels: usize) {
        let mean = mean.reshape([channels]).detach();
        let var = var.reshape([channels]).detach();
        let new_mean = self
            .running_mean
            .value()
            .mul_scalar(1.0 - self.momentum)
            .add(mean.mul_scalar(self.momentum));
        let new_var = self
            .running_var
            .value()
            .mul_scalar(1.0 - self.momentum)
            .add(var.mul_scalar(self.momentum));
        self.running_mean.update(new_mean.detach());
        self.running_var.update(new_var.detach());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestBackend = burn::backend::ndarray::NdArray<f32>;

    fn sample() -> Tensor<TestBackend, 4> {
        let device = Default::default();
        Tensor::random(
            [4, 3, 8, 8],
            burn::tensor::Distribution::Normal(1.0, 2.0),
            &device,
        )
    }

    #[test]
    fn track_mode_moves_running_buffers() {
        let device = Default::default();
        let norm = TrackedBatchNorm::<TestBackend>::new(3, &device);
        let before = norm.running_mean.value().to_data();

        let _ = norm.forward(sample(), StatsMode::Track);

        let after = norm.running_mean.value().to_data();
        assert_ne!(before.to_vec::<f32>().unwrap(), after.to_vec::<f32>().unwrap());
    }

    #[test]
    fn frozen_and_eval_modes_leave_buffers_untouched() {
        let device = Default::default();
        let norm = TrackedBatchNorm::<TestBackend>::new(3, &device);
        let before = norm.running_mean.value().to_data();

        let _ = norm.forward(sample(), StatsMode::Frozen);
        let _ = norm.forward(sample(), StatsMode::Eval);

        let after = norm.running_mean.value().to_data();
        assert_eq!(before.to_vec::<f32>().unwrap(), after.to_vec::<f32>().unwrap());
    }

    #[test]
    fn batch_statistics_normalize_to_zero_mean() {
        let device = Default::default();
        let norm = TrackedBatchNorm::<TestBackend>::new(3, &device);
        let out = norm.forward(sample(), StatsMode::Frozen);
        let mean: f32 = out.mean().into_scalar().elem();
        assert!(mean.abs() < 1e-4, "normalized mean was {mean}");
    }
}
