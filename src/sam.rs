use burn::module::{AutodiffModule, ModuleMapper, ModuleVisitor, Param};
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::{GradientsParams, Optimizer, Sgd};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use std::marker::PhantomData;

/// Sharpness-aware minimization wrapped around a plain SGD optimizer.
#[derive(Config, Debug)]
pub struct SamConfig {
    /// Radius of the neighborhood searched for the locally worst loss.
    #[config(default = 0.05)]
    pub rho: f64,
    /// Scale each parameter's perturbation by the parameter's own magnitude.
    #[config(default = true)]
    pub adaptive: bool,
}

impl SamConfig {
    pub fn init<M, B>(&self, base: OptimizerAdaptor<Sgd<B::InnerBackend>, M, B>) -> Sam<M, B>
    where
        M: AutodiffModule<B>,
        B: AutodiffBackend,
    {
        assert!(self.rho > 0.0, "SAM rho must be positive, got {}", self.rho);
        Sam {
            base,
            rho: self.rho,
            adaptive: self.adaptive,
            saved: None,
        }
    }
}

/// Two-phase optimizer: `ascend` moves the parameters to the locally worst
/// point within a rho-ball, `descend` restores them exactly and applies the
/// base update using the gradients computed at the perturbed point.
///
/// Every `ascend` must be followed by exactly one `descend`; the cache of
/// pre-ascent values doubles as the awaiting-descend flag, and both
/// operations assert on it.
pub struct Sam<M, B>
where
    M: AutodiffModule<B>,
    B: AutodiffBackend,
{
    base: OptimizerAdaptor<Sgd<B::InnerBackend>, M, B>,
    rho: f64,
    adaptive: bool,
    saved: Option<GradientsParams>,
}

impl<M, B> Sam<M, B>
where
    M: AutodiffModule<B>,
    B: AutodiffBackend,
{
    /// Perturb every parameter along its gradient, scaled so the joint step
    /// has L2 length rho. Consumes the gradients; the caller runs a fresh
    /// backward pass at the perturbed point afterwards.
    pub fn ascend(&mut self, module: M, mut grads: GradientsParams) -> M {
        assert!(
            self.saved.is_none(),
            "ascend called twice without an intervening descend"
        );

        // Stage gradients out of the container while accumulating the global
        // norm, then map the parameters to their perturbed values.
        let mut staged = GradientsParams::new();
        let mut norm = GradNorm::<B> {
            source: &mut grads,
            staged: &mut staged,
            adaptive: self.adaptive,
            sum_sq: 0.0,
            _phantom: PhantomData,
        };
        module.visit(&mut norm);
        let scale = self.rho / (norm.sum_sq.sqrt() + 1e-12);

        let mut saved = GradientsParams::new();
        let mut ascent = Ascent::<B> {
            grads: &mut staged,
            saved: &mut saved,
            scale,
            adaptive: self.adaptive,
            _phantom: PhantomData,
        };
        let module = module.map(&mut ascent);
        self.saved = Some(saved);
        module
    }

    /// Restore the pre-ascent parameter values exactly, then apply the base
    /// optimizer step with the supplied perturbed-point gradients.
    pub fn descend(&mut self, lr: f64, module: M, grads: GradientsParams) -> M {
        let mut saved = self
            .saved
            .take()
            .expect("descend called without a prior ascend");

        let mut restore = Restore::<B> {
            saved: &mut saved,
            _phantom: PhantomData,
        };
        let module = module.map(&mut restore);
        self.base.step(lr, module, grads)
    }

    /// True between an ascend and its matching descend.
    pub fn awaiting_descend(&self) -> bool {
        self.saved.is_some()
    }
}

struct GradNorm<'a, B: AutodiffBackend> {
    source: &'a mut GradientsParams,
    staged: &'a mut GradientsParams,
    adaptive: bool,
    sum_sq: f64,
    _phantom: PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for GradNorm<'_, B> {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        if let Some(grad) = self.source.remove::<B::InnerBackend, D>(param.id) {
            let contribution = if self.adaptive {
                param.val().inner().abs().mul(grad.clone())
            } else {
                grad.clone()
            };
            self.sum_sq += contribution.square().sum().into_scalar().elem::<f64>();
            self.staged.register::<B::InnerBackend, D>(param.id, grad);
        }
    }
}

struct Ascent<'a, B: AutodiffBackend> {
    grads: &'a mut GradientsParams,
    saved: &'a mut GradientsParams,
    scale: f64,
    adaptive: bool,
    _phantom: PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleMapper<B> for Ascent<'_, B> {
    fn map_float<const D: usize>(&mut self, param: Param<Tensor<B, D>>) -> Param<Tensor<B, D>> {
        let id = param.id;
        let Some(grad) = self.grads.remove::<B::InnerBackend, D>(id) else {
            return param;
        };

        let value = param.val().inner();
        self.saved.register::<B::InnerBackend, D>(id, value.clone());

        let step = if self.adaptive {
            value.clone().square().mul(grad).mul_scalar(self.scale)
        } else {
            grad.mul_scalar(self.scale)
        };
        let perturbed = value.add(step);
        Param::initialized(id, Tensor::from_inner(perturbed).require_grad())
    }
}

struct Restore<'a, B: AutodiffBackend> {
    saved: &'a mut GradientsParams,
    _phantom: PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleMapper<B> for Restore<'_, B> {
    fn map_float<const D: usize>(&mut self, param: Param<Tensor<B, D>>) -> Param<Tensor<B, D>> {
        match self.saved.remove::<B::InnerBackend, D>(param.id) {
            Some(value) => {
                Param::initialized(param.id, Tensor::from_inner(value).require_grad())
            }
            None => param,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::optim::SgdConfig;

    type TestBackend = burn::backend::Autodiff<burn::backend::ndarray::NdArray<f32>>;
    type TestDevice = <TestBackend as Backend>::Device;

    #[derive(Module, Debug)]
    struct Probe<B: Backend> {
        weight: Param<Tensor<B, 2>>,
    }

    impl<B: Backend> Probe<B> {
        fn new(device: &B::Device) -> Self {
            Self {
                weight: Param::from_tensor(
                    Tensor::from_floats([[1.0, -2.0], [0.5, 3.0]], device).require_grad(),
                ),
            }
        }

        fn loss(&self, x: Tensor<B, 2>) -> Tensor<B, 1> {
            self.weight.val().mul(x).sum()
        }
    }

    fn sam(rho: f64, adaptive: bool) -> Sam<Probe<TestBackend>, TestBackend> {
        let base = SgdConfig::new().init::<TestBackend, Probe<TestBackend>>();
        SamConfig::new()
            .with_rho(rho)
            .with_adaptive(adaptive)
            .init(base)
    }

    fn weight_bits(probe: &Probe<TestBackend>) -> Vec<f32> {
        probe.weight.val().to_data().to_vec::<f32>().unwrap()
    }

    fn backward_grads(
        probe: &Probe<TestBackend>,
        x: Tensor<TestBackend, 2>,
    ) -> GradientsParams {
        let loss = probe.loss(x);
        GradientsParams::from_grads(loss.backward(), probe)
    }

    #[test]
    fn ascend_moves_by_rho_along_the_normalized_gradient() {
        let device = TestDevice::default();
        let probe = Probe::<TestBackend>::new(&device);
        let before = weight_bits(&probe);
        let mut optimizer = sam(0.1, false);

        // d(loss)/dw = x, so the gradient is the all-ones matrix: the global
        // norm is 2 and every element moves by rho / 2.
        let grads = backward_grads(&probe, Tensor::ones([2, 2], &device));
        let probe = optimizer.ascend(probe, grads);

        let after = weight_bits(&probe);
        for (a, b) in after.iter().zip(before.iter()) {
            assert!((a - b - 0.05).abs() < 1e-6, "expected +0.05 step, got {}", a - b);
        }
        assert!(optimizer.awaiting_descend());
    }

    #[test]
    fn descend_with_zero_gradient_restores_the_exact_bits() {
        let device = TestDevice::default();
        let probe = Probe::<TestBackend>::new(&device);
        let before = weight_bits(&probe);
        let mut optimizer = sam(0.7, true);

        let grads = backward_grads(&probe, Tensor::ones([2, 2], &device));
        let probe = optimizer.ascend(probe, grads);
        assert_ne!(weight_bits(&probe), before);

        // Zero gradient at the perturbed point: the SGD update is a no-op,
        // so the restore must reproduce the original values bit for bit.
        let zero_grads = backward_grads(&probe, Tensor::zeros([2, 2], &device));
        let probe = optimizer.descend(0.1, probe, zero_grads);

        assert_eq!(weight_bits(&probe), before);
        assert!(!optimizer.awaiting_descend());
    }

    #[test]
    fn descend_applies_the_base_update_at_the_restored_point() {
        let device = TestDevice::default();
        let probe = Probe::<TestBackend>::new(&device);
        let before = weight_bits(&probe);
        let mut optimizer = sam(0.5, false);

        let grads = backward_grads(&probe, Tensor::ones([2, 2], &device));
        let probe = optimizer.ascend(probe, grads);
        let grads = backward_grads(&probe, Tensor::ones([2, 2], &device));
        let probe = optimizer.descend(0.1, probe, grads);

        // Plain SGD with lr 0.1 against an all-ones gradient from the
        // restored values.
        let after = weight_bits(&probe);
        for (a, b) in after.iter().zip(before.iter()) {
            assert!((a - (b - 0.1)).abs() < 1e-6);
        }
    }

    #[test]
    fn zero_gradient_norm_makes_ascend_a_no_op() {
        let device = TestDevice::default();
        let probe = Probe::<TestBackend>::new(&device);
        let before = weight_bits(&probe);
        let mut optimizer = sam(2.0, false);

        let grads = backward_grads(&probe, Tensor::zeros([2, 2], &device));
        let probe = optimizer.ascend(probe, grads);

        assert_eq!(weight_bits(&probe), before);
    }

    #[test]
    #[should_panic(expected = "without an intervening descend")]
    fn two_ascends_in_a_row_panic() {
        let device = TestDevice::default();
        let probe = Probe::<TestBackend>::new(&device);
        let mut optimizer = sam(0.1, false);

        let grads = backward_grads(&probe, Tensor::ones([2, 2], &device));
        let probe = optimizer.ascend(probe, grads);
        let grads = backward_grads(&probe, Tensor::ones([2, 2], &device));
        let _ = optimizer.ascend(probe, grads);
    }

    #[test]
    #[should_panic(expected = "without a prior ascend")]
    fn descend_without_ascend_panics() {
        let device = TestDevice::default();
        let probe = Probe::<TestBackend>::new(&device);
        let mut optimizer = sam(0.1, false);

        let grads = backward_grads(&probe, Tensor::zeros([2, 2], &device));
        let _ = optimizer.descend(0.1, probe, grads);
    }

    #[test]
    #[should_panic(expected = "rho must be positive")]
    fn rejects_non_positive_rho() {
        let _ = sam(0.0, false);
    }
}
