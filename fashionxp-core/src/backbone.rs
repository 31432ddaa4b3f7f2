use crate::error::Error;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, PaddingConfig2d, Relu};
use burn::prelude::*;

/// Build-spec for the feature-extraction backbone.
///
/// `channels` lists the output width of each stage; every stage halves
/// the spatial resolution.
#[derive(Config, Debug)]
pub struct BackboneConfig {
    /// Variant key, looked up at build time. Recognized: `conv`, `residual`.
    pub kind: String,
    pub channels: Vec<usize>,
    #[config(default = 3)]
    pub in_channels: usize,
}

impl BackboneConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<Backbone<B>, Error> {
        if self.channels.is_empty() {
            return Err(Error::Configuration(
                "backbone requires at least one stage in `channels`".into(),
            ));
        }
        if self.in_channels == 0 {
            return Err(Error::Configuration("backbone `in_channels` must be non-zero".into()));
        }
        match self.kind.as_str() {
            "conv" => Ok(Backbone::Plain(PlainBackbone::new(
                self.in_channels,
                &self.channels,
                device,
            ))),
            "residual" => Ok(Backbone::Residual(ResidualBackbone::new(
                self.in_channels,
                &self.channels,
                device,
            ))),
            other => Err(Error::unknown_variant("backbone", other)),
        }
    }

    pub fn out_channels(&self) -> usize {
        self.channels.last().copied().unwrap_or(0)
    }
}

/// Image batch `[N, C, H, W]` to spatial feature map `[N, C', H', W']`.
#[derive(Module, Debug)]
pub enum Backbone<B: Backend> {
    Plain(PlainBackbone<B>),
    Residual(ResidualBackbone<B>),
}

impl<B: Backend> Backbone<B> {
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            Backbone::Plain(net) => net.forward(images),
            Backbone::Residual(net) => net.forward(images),
        }
    }

    pub fn in_channels(&self) -> usize {
        match self {
            Backbone::Plain(net) => net.in_channels,
            Backbone::Residual(net) => net.in_channels,
        }
    }
}

/// Conv2d + BatchNorm + ReLU.
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    conv: Conv2d<B>,
    norm: BatchNorm<B, 2>,
    activation: Relu,
}

impl<B: Backend> ConvBlock<B> {
    fn new(in_channels: usize, out_channels: usize, stride: usize, device: &B::Device) -> Self {
        let conv = Conv2dConfig::new([in_channels, out_channels], [3, 3])
            .with_stride([stride, stride])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .with_bias(false)
            .init(device);
        Self {
            conv,
            norm: BatchNormConfig::new(out_channels).init(device),
            activation: Relu::new(),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.activation.forward(self.norm.forward(self.conv.forward(x)))
    }
}

#[derive(Module, Debug)]
pub struct PlainBackbone<B: Backend> {
    blocks: Vec<ConvBlock<B>>,
    in_channels: usize,
}

impl<B: Backend> PlainBackbone<B> {
    fn new(in_channels: usize, channels: &[usize], device: &B::Device) -> Self {
        let mut blocks = Vec::with_capacity(channels.len());
        let mut previous = in_channels;
        for &width in channels {
            blocks.push(ConvBlock::new(previous, width, 2, device));
            previous = width;
        }
        Self { blocks, in_channels }
    }

    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        self.blocks
            .iter()
            .fold(images, |x, block| block.forward(x))
    }
}

#[derive(Module, Debug)]
pub struct ResidualBlock<B: Backend> {
    conv1: Conv2d<B>,
    norm1: BatchNorm<B, 2>,
    conv2: Conv2d<B>,
    norm2: BatchNorm<B, 2>,
    shortcut: Option<Conv2d<B>>,
    activation: Relu,
}

impl<B: Backend> ResidualBlock<B> {
    fn new(in_channels: usize, out_channels: usize, stride: usize, device: &B::Device) -> Self {
        let conv1 = Conv2dConfig::new([in_channels, out_channels], [3, 3])
            .with_stride([stride, stride])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .with_bias(false)
            .init(device);
        let conv2 = Conv2dConfig::new([out_channels, out_channels], [3, 3])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .with_bias(false)
            .init(device);
        // 1x1 projection whenever the identity path cannot be reused
        let shortcut = (stride != 1 || in_channels != out_channels).then(|| {
            Conv2dConfig::new([in_channels, out_channels], [1, 1])
                .with_stride([stride, stride])
                .with_bias(false)
                .init(device)
        });
        Self {
            conv1,
            norm1: BatchNormConfig::new(out_channels).init(device),
            conv2,
            norm2: BatchNormConfig::new(out_channels).init(device),
            shortcut,
            activation: Relu::new(),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = match &self.shortcut {
            Some(projection) => projection.forward(x.clone()),
            None => x.clone(),
        };
        let out = self.activation.forward(self.norm1.forward(self.conv1.forward(x)));
        let out = self.norm2.forward(self.conv2.forward(out));
        self.activation.forward(out + identity)
    }
}

#[derive(Module, Debug)]
pub struct ResidualBackbone<B: Backend> {
    stem: ConvBlock<B>,
    blocks: Vec<ResidualBlock<B>>,
    in_channels: usize,
}

impl<B: Backend> ResidualBackbone<B> {
    fn new(in_channels: usize, channels: &[usize], device: &B::Device) -> Self {
        let stem = ConvBlock::new(in_channels, channels[0], 2, device);
        let mut blocks = Vec::with_capacity(channels.len().saturating_sub(1));
        let mut previous = channels[0];
        for &width in &channels[1..] {
            blocks.push(ResidualBlock::new(previous, width, 2, device));
            previous = width;
        }
        Self {
            stem,
            blocks,
            in_channels,
        }
    }

    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        self.blocks
            .iter()
            .fold(self.stem.forward(images), |x, block| block.forward(x))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Distribution;

    type TB = burn::backend::NdArray<f32>;

    #[test]
    fn plain_backbone_halves_resolution_per_stage() {
        let device = Default::default();
        let backbone = BackboneConfig::new("conv".into(), vec![4, 8])
            .init::<TB>(&device)
            .unwrap();
        let images = Tensor::<TB, 4>::random([2, 3, 16, 16], Distribution::Default, &device);
        let feats = backbone.forward(images);
        assert_eq!(feats.dims(), [2, 8, 4, 4]);
    }

    #[test]
    fn residual_backbone_output_shape() {
        let device = Default::default();
        let backbone = BackboneConfig::new("residual".into(), vec![4, 8, 8])
            .init::<TB>(&device)
            .unwrap();
        let images = Tensor::<TB, 4>::random([1, 3, 32, 32], Distribution::Default, &device);
        let feats = backbone.forward(images);
        assert_eq!(feats.dims(), [1, 8, 4, 4]);
    }

    #[test]
    fn unknown_variant_is_a_configuration_error() {
        let device = Default::default();
        let err = BackboneConfig::new("vgg".into(), vec![4])
            .init::<TB>(&device)
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn empty_stage_list_is_rejected() {
        let device = Default::default();
        let err = BackboneConfig::new("conv".into(), vec![])
            .init::<TB>(&device)
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
