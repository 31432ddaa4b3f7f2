use crate::error::Error;
use burn::nn::pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig};
use burn::nn::{Linear, LinearConfig, Relu};
use burn::prelude::*;

/// Build-spec for the global pooling head.
#[derive(Config, Debug)]
pub struct GlobalPoolConfig {
    /// Variant key. Recognized: `avg`, `max`.
    pub kind: String,
    pub out_features: usize,
}

impl GlobalPoolConfig {
    pub fn init<B: Backend>(
        &self,
        in_channels: usize,
        device: &B::Device,
    ) -> Result<GlobalPool<B>, Error> {
        let take_max = match self.kind.as_str() {
            "avg" => false,
            "max" => true,
            other => return Err(Error::unknown_variant("global_pool", other)),
        };
        if self.out_features == 0 {
            return Err(Error::Configuration(
                "global_pool `out_features` must be non-zero".into(),
            ));
        }
        Ok(GlobalPool {
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            fc: LinearConfig::new(in_channels, self.out_features).init(device),
            activation: Relu::new(),
            take_max,
            out_features: self.out_features,
        })
    }
}

/// Spatial feature map `[N, C, H, W]` to flat global vector `[N, G]`.
#[derive(Module, Debug)]
pub struct GlobalPool<B: Backend> {
    pool: AdaptiveAvgPool2d,
    fc: Linear<B>,
    activation: Relu,
    take_max: bool,
    out_features: usize,
}

impl<B: Backend> GlobalPool<B> {
    pub fn forward(&self, feats: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch, channels, height, width] = feats.dims();
        let flat = if self.take_max {
            feats
                .reshape([batch, channels, height * width])
                .max_dim(2)
                .reshape([batch, channels])
        } else {
            self.pool.forward(feats).reshape([batch, channels])
        };
        self.activation.forward(self.fc.forward(flat))
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }
}

/// Build-spec for landmark-conditioned local pooling.
#[derive(Config, Debug)]
pub struct RoiPoolConfig {
    /// Variant key. Recognized: `landmark`.
    pub kind: String,
    pub num_landmarks: usize,
    pub out_features: usize,
    /// Side length of the square window pooled around each landmark,
    /// in feature-grid cells.
    #[config(default = 3)]
    pub window: usize,
}

impl RoiPoolConfig {
    pub fn init<B: Backend>(
        &self,
        in_channels: usize,
        device: &B::Device,
    ) -> Result<RoiPool<B>, Error> {
        if self.kind.as_str() != "landmark" {
            return Err(Error::unknown_variant("roi_pool", &self.kind));
        }
        if self.num_landmarks == 0 {
            return Err(Error::Configuration(
                "roi_pool `num_landmarks` must be non-zero".into(),
            ));
        }
        if self.window == 0 || self.out_features == 0 {
            return Err(Error::Configuration(
                "roi_pool `window` and `out_features` must be non-zero".into(),
            ));
        }
        Ok(RoiPool {
            fc: LinearConfig::new(self.num_landmarks * in_channels, self.out_features)
                .init(device),
            activation: Relu::new(),
            num_landmarks: self.num_landmarks,
            window: self.window,
            out_features: self.out_features,
        })
    }
}

/// Feature map + landmark coordinates to flat local vector `[N, R]`.
///
/// Landmarks arrive as `[N, 2·L]` with x,y pairs normalized to `[0, 1]`
/// image coordinates; each is mapped onto the feature grid and a
/// `window`-sized patch around it is max-pooled per channel.
#[derive(Module, Debug)]
pub struct RoiPool<B: Backend> {
    fc: Linear<B>,
    activation: Relu,
    num_landmarks: usize,
    window: usize,
    out_features: usize,
}

impl<B: Backend> RoiPool<B> {
    pub fn forward(
        &self,
        feats: Tensor<B, 4>,
        landmarks: Tensor<B, 2>,
    ) -> Result<Tensor<B, 2>, Error> {
        let [batch, channels, height, width] = feats.dims();
        let [rows, coords_len] = landmarks.dims();
        if rows != batch {
            return Err(Error::shape("landmark batch", batch, rows));
        }
        if coords_len != 2 * self.num_landmarks {
            return Err(Error::shape(
                "landmark coordinates",
                2 * self.num_landmarks,
                coords_len,
            ));
        }

        let coords: Vec<f32> = landmarks
            .into_data()
            .convert::<f32>()
            .to_vec()
            .expect("landmark tensor holds float data");

        let mut pooled = Vec::with_capacity(batch * self.num_landmarks);
        for sample in 0..batch {
            for landmark in 0..self.num_landmarks {
                let x = coords[sample * coords_len + 2 * landmark];
                let y = coords[sample * coords_len + 2 * landmark + 1];
                let (x0, x1) = window_range(x, width, self.window);
                let (y0, y1) = window_range(y, height, self.window);
                let patch = feats
                    .clone()
                    .slice([sample..sample + 1, 0..channels, y0..y1, x0..x1]);
                pooled.push(
                    patch
                        .reshape([1, channels, (y1 - y0) * (x1 - x0)])
                        .max_dim(2)
                        .reshape([1, channels]),
                );
            }
        }

        // sample-major order, so the reshape groups each sample's landmarks
        let local = Tensor::cat(pooled, 0).reshape([batch, self.num_landmarks * channels]);
        Ok(self.activation.forward(self.fc.forward(local)))
    }

    pub fn num_landmarks(&self) -> usize {
        self.num_landmarks
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }
}

/// Window of `window` cells centered on a normalized coordinate,
/// clamped inside a grid of `extent` cells.
fn window_range(coord: f32, extent: usize, window: usize) -> (usize, usize) {
    let window = window.min(extent);
    let center = ((coord.clamp(0.0, 1.0) * extent as f32) as usize).min(extent - 1);
    let start = center.saturating_sub(window / 2).min(extent - window);
    (start, start + window)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Distribution;

    type TB = burn::backend::NdArray<f32>;

    #[test]
    fn window_is_clamped_inside_the_grid() {
        assert_eq!(window_range(0.0, 8, 3), (0, 3));
        assert_eq!(window_range(1.0, 8, 3), (5, 8));
        assert_eq!(window_range(0.5, 8, 3), (3, 6));
        // window wider than the grid collapses to the full extent
        assert_eq!(window_range(0.5, 2, 3), (0, 2));
    }

    #[test]
    fn global_pool_variants_produce_configured_width() {
        let device = Default::default();
        let feats = Tensor::<TB, 4>::random([2, 4, 5, 5], Distribution::Default, &device);
        for kind in ["avg", "max"] {
            let pool = GlobalPoolConfig::new(kind.into(), 6)
                .init::<TB>(4, &device)
                .unwrap();
            assert_eq!(pool.forward(feats.clone()).dims(), [2, 6]);
        }
    }

    #[test]
    fn roi_pool_produces_one_local_vector_per_sample() {
        let device = Default::default();
        let pool = RoiPoolConfig::new("landmark".into(), 2, 5)
            .init::<TB>(4, &device)
            .unwrap();
        let feats = Tensor::<TB, 4>::random([3, 4, 6, 6], Distribution::Default, &device);
        let landmarks = Tensor::<TB, 2>::from_data(
            [
                [0.1, 0.1, 0.9, 0.9],
                [0.5, 0.5, 0.0, 1.0],
                [1.0, 0.0, 0.3, 0.7],
            ],
            &device,
        );
        let local = pool.forward(feats, landmarks).unwrap();
        assert_eq!(local.dims(), [3, 5]);
    }

    #[test]
    fn roi_pool_rejects_wrong_landmark_width() {
        let device = Default::default();
        let pool = RoiPoolConfig::new("landmark".into(), 2, 5)
            .init::<TB>(4, &device)
            .unwrap();
        let feats = Tensor::<TB, 4>::random([1, 4, 6, 6], Distribution::Default, &device);
        let landmarks = Tensor::<TB, 2>::from_data([[0.5, 0.5]], &device);
        let err = pool.forward(feats, landmarks).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
    }

    #[test]
    fn unknown_pool_variants_are_configuration_errors() {
        let device = Default::default();
        let err = GlobalPoolConfig::new("sum".into(), 6)
            .init::<TB>(4, &device)
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        let err = RoiPoolConfig::new("grid".into(), 2, 5)
            .init::<TB>(4, &device)
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
