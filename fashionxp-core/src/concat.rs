use crate::error::Error;
use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;

/// Build-spec for the fusion head producing attribute logits.
#[derive(Config, Debug)]
pub struct ConcatConfig {
    pub num_attributes: usize,
}

impl ConcatConfig {
    /// `in_features` is the global width plus, when a roi_pool is
    /// configured, the local width; computed by the predictor builder.
    pub fn init<B: Backend>(
        &self,
        in_features: usize,
        device: &B::Device,
    ) -> Result<Concat<B>, Error> {
        if self.num_attributes == 0 {
            return Err(Error::Configuration(
                "concat `num_attributes` must be non-zero".into(),
            ));
        }
        Ok(Concat {
            fc: LinearConfig::new(in_features, self.num_attributes).init(device),
            num_attributes: self.num_attributes,
        })
    }
}

/// Global vector (+ optional local vector) to fused prediction logits.
#[derive(Module, Debug)]
pub struct Concat<B: Backend> {
    fc: Linear<B>,
    num_attributes: usize,
}

impl<B: Backend> Concat<B> {
    pub fn forward(&self, global: Tensor<B, 2>, local: Option<Tensor<B, 2>>) -> Tensor<B, 2> {
        let fused = match local {
            Some(local) => Tensor::cat(vec![global, local], 1),
            None => global,
        };
        self.fc.forward(fused)
    }

    pub fn num_attributes(&self) -> usize {
        self.num_attributes
    }
}
