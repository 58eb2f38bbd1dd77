use crate::model::norm::{StatsMode, TrackedBatchNorm};
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig};
use burn::nn::{Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d};
use burn::prelude::*;
use burn::tensor::activation::relu;

/// Configuration for the WideResNet classifier.
#[derive(Config, Debug)]
pub struct WideResNetConfig {
    pub depth: usize,
    pub width_factor: usize,
    #[config(default = 0.0)]
    pub dropout: f64,
    #[config(default = 3)]
    pub in_channels: usize,
    #[config(default = 10)]
    pub num_classes: usize,
}

/// Pre-activation residual block with two 3x3 convolutions.
#[derive(Module, Debug)]
pub struct BasicBlock<B: Backend> {
    norm1: TrackedBatchNorm<B>,
    conv1: Conv2d<B>,
    norm2: TrackedBatchNorm<B>,
    conv2: Conv2d<B>,
    dropout: Dropout,
    shortcut: Option<Conv2d<B>>,
}

impl<B: Backend> BasicBlock<B> {
    fn new(
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        dropout: f64,
        device: &B::Device,
    ) -> Self {
        // Projection shortcut only where the shape changes.
        let shortcut = (in_channels != out_channels || stride != 1).then(|| {
            Conv2dConfig::new([in_channels, out_channels], [1, 1])
                .with_stride([stride, stride])
                .with_bias(false)
                .init(device)
        });

        Self {
            norm1: TrackedBatchNorm::new(in_channels, device),
            conv1: conv3x3(in_channels, out_channels, stride, device),
            norm2: TrackedBatchNorm::new(out_channels, device),
            conv2: conv3x3(out_channels, out_channels, 1, device),
            dropout: DropoutConfig::new(dropout).init(),
            shortcut,
        }
    }

    fn forward(&self, x: Tensor<B, 4>, mode: StatsMode) -> Tensor<B, 4> {
        let pre = relu(self.norm1.forward(x.clone(), mode));
        let mut out = self.conv1.forward(pre.clone());
        out = relu(self.norm2.forward(out, mode));
        if mode.is_train() {
            out = self.dropout.forward(out);
        }
        out = self.conv2.forward(out);

        let residual = match &self.shortcut {
            Some(projection) => projection.forward(pre),
            None => x,
        };
        out.add(residual)
    }
}

/// WideResNet with pre-activation blocks, widths 16, 16w, 32w, 64w.
#[derive(Module, Debug)]
pub struct WideResNet<B: Backend> {
    conv: Conv2d<B>,
    blocks: Vec<BasicBlock<B>>,
    norm: TrackedBatchNorm<B>,
    pool: AdaptiveAvgPool2d,
    fc: Linear<B>,
}

impl WideResNetConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> WideResNet<B> {
        assert!(
            self.depth >= 10 && (self.depth - 4) % 6 == 0,
            "depth must satisfy (depth - 4) % 6 == 0, got {}",
            self.depth
        );
        let blocks_per_group = (self.depth - 4) / 6;
        let widths = [
            16 * self.width_factor,
            32 * self.width_factor,
            64 * self.width_factor,
        ];

        let conv = conv3x3(self.in_channels, 16, 1, device);

        let mut blocks = Vec::with_capacity(3 * blocks_per_group);
        let mut in_channels = 16;
        for (group, &width) in widths.iter().enumerate() {
            let stride = if group == 0 { 1 } else { 2 };
            for block in 0..blocks_per_group {
                let stride = if block == 0 { stride } else { 1 };
                blocks.push(BasicBlock::new(
                    in_channels,
                    width,
                    stride,
                    self.dropout,
                    device,
                ));
                in_channels = width;
            }
        }

        WideResNet {
            conv,
            blocks,
            norm: TrackedBatchNorm::new(in_channels, device),
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            fc: LinearConfig::new(in_channels, self.num_classes).init(device),
        }
    }
}

impl<B: Backend> WideResNet<B> {
    /// Forward pass returning class logits. The statistics mode applies to
    /// every normalization layer and to dropout.
    pub fn forward(&self, images: Tensor<B, 4>, mode: StatsMode) -> Tensor<B, 2> {
        let mut x = self.conv.forward(images);
        for block in &self.blocks {
            x = block.forward(x, mode);
        }
        x = relu(self.norm.forward(x, mode));
        x = self.pool.forward(x);

        let [batch, channels, _, _] = x.dims();
        self.fc.forward(x.reshape([batch, channels]))
    }
}

fn conv3x3<B: Backend>(
    in_channels: usize,
    out_channels: usize,
    stride: usize,
    device: &B::Device,
) -> Conv2d<B> {
    Conv2dConfig::new([in_channels, out_channels], [3, 3])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .with_bias(false)
        .init(device)
}
