use crate::error::Error;
use burn::prelude::*;
use burn::tensor::activation::log_sigmoid;

/// Build-spec for the attribute loss.
#[derive(Config, Debug)]
pub struct LossConfig {
    /// Variant key. Recognized: `bce_logits`.
    #[config(default = "String::from(\"bce_logits\")")]
    pub kind: String,
    /// Per-attribute element weights, length `num_attributes`.
    pub weight: Option<Vec<f32>>,
    /// `mean` or `sum` over all elements of the batch.
    #[config(default = "String::from(\"mean\")")]
    pub reduction: String,
}

impl LossConfig {
    pub fn init<B: Backend>(
        &self,
        num_attributes: usize,
        device: &B::Device,
    ) -> Result<AttrLoss<B>, Error> {
        if self.kind.as_str() != "bce_logits" {
            return Err(Error::unknown_variant("loss", &self.kind));
        }
        let sum_reduction = match self.reduction.as_str() {
            "mean" => false,
            "sum" => true,
            other => return Err(Error::unknown_variant("loss reduction", other)),
        };
        let weight = match &self.weight {
            Some(weight) if weight.len() != num_attributes => {
                return Err(Error::Configuration(format!(
                    "loss `weight` has {} entries but the model predicts {num_attributes} attributes",
                    weight.len(),
                )));
            }
            Some(weight) => Some(Tensor::from_floats(weight.as_slice(), device)),
            None => None,
        };
        Ok(AttrLoss {
            weight,
            sum_reduction,
        })
    }
}

/// Binary cross-entropy with logits over multi-label attribute targets.
#[derive(Module, Debug)]
pub struct AttrLoss<B: Backend> {
    weight: Option<Tensor<B, 1>>,
    sum_reduction: bool,
}

impl<B: Backend> AttrLoss<B> {
    /// # Shapes
    ///   - logits `[batch_size, num_attributes]`
    ///   - targets `[batch_size, num_attributes]`, values in {0, 1}
    ///   - output `[1]`
    pub fn forward(&self, logits: Tensor<B, 2>, targets: Tensor<B, 2, Int>) -> Tensor<B, 1> {
        let targets = targets.float();
        // -[y * log sigmoid(x) + (1 - y) * log sigmoid(-x)], numerically stable
        let mut loss = (targets.clone() * log_sigmoid(logits.clone())
            + (targets.neg() + 1.0) * log_sigmoid(logits.neg()))
        .neg();
        if let Some(weight) = &self.weight {
            loss = loss * weight.clone().unsqueeze::<2>();
        }
        if self.sum_reduction {
            loss.sum()
        } else {
            loss.mean()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TB = burn::backend::NdArray<f32>;

    const LN_2: f32 = std::f32::consts::LN_2;

    fn scalar(loss: Tensor<TB, 1>) -> f32 {
        loss.into_scalar()
    }

    #[test]
    fn zero_logits_cost_ln2_per_element() {
        let device = Default::default();
        let loss = LossConfig::new().init::<TB>(2, &device).unwrap();
        let logits = Tensor::<TB, 2>::zeros([1, 2], &device);
        let targets = Tensor::<TB, 2, Int>::from_data([[1, 0]], &device);
        let value = scalar(loss.forward(logits, targets));
        assert!((value - LN_2).abs() < 1e-6);
    }

    #[test]
    fn sum_reduction_scales_with_element_count() {
        let device = Default::default();
        let loss = LossConfig::new()
            .with_reduction("sum".into())
            .init::<TB>(2, &device)
            .unwrap();
        let logits = Tensor::<TB, 2>::zeros([1, 2], &device);
        let targets = Tensor::<TB, 2, Int>::from_data([[1, 0]], &device);
        let value = scalar(loss.forward(logits, targets));
        assert!((value - 2.0 * LN_2).abs() < 1e-6);
    }

    #[test]
    fn element_weights_scale_each_attribute() {
        let device = Default::default();
        let loss = LossConfig::new()
            .with_weight(Some(vec![2.0, 1.0]))
            .init::<TB>(2, &device)
            .unwrap();
        let logits = Tensor::<TB, 2>::zeros([1, 2], &device);
        let targets = Tensor::<TB, 2, Int>::from_data([[1, 0]], &device);
        let value = scalar(loss.forward(logits, targets));
        assert!((value - 1.5 * LN_2).abs() < 1e-6);
    }

    #[test]
    fn wrong_weight_length_is_rejected() {
        let device = Default::default();
        let err = LossConfig::new()
            .with_weight(Some(vec![1.0, 2.0, 3.0]))
            .init::<TB>(2, &device)
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn unknown_kind_and_reduction_are_rejected() {
        let device = Default::default();
        let err = LossConfig::new()
            .with_kind("mse".into())
            .init::<TB>(2, &device)
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        let err = LossConfig::new()
            .with_reduction("median".into())
            .init::<TB>(2, &device)
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
