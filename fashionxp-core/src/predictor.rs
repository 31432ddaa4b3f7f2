use crate::{
    backbone::{Backbone, BackboneConfig},
    concat::{Concat, ConcatConfig},
    data::AttrBatch,
    error::Error,
    loss::{AttrLoss, LossConfig},
    pooling::{GlobalPool, GlobalPoolConfig, RoiPool, RoiPoolConfig},
};
use burn::{
    prelude::*,
    record::{CompactRecorder, Recorder},
    tensor::backend::AutodiffBackend,
    train::{MultiLabelClassificationOutput, TrainOutput, TrainStep, ValidStep},
};
use std::path::Path;

/// Build-spec for the whole predictor. Each sub-component is selected
/// by its variant key; leaving `roi_pool` out fixes the predictor in
/// the landmark-free state for its lifetime.
#[derive(Config, Debug)]
pub struct PredictorConfig {
    pub backbone: BackboneConfig,
    pub global_pool: GlobalPoolConfig,
    pub concat: ConcatConfig,
    pub roi_pool: Option<RoiPoolConfig>,
    #[config(default = "LossConfig::new()")]
    pub loss: LossConfig,
}

impl PredictorConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<RoiPredictor<B>, Error> {
        let backbone = self.backbone.init::<B>(device)?;
        let feature_channels = self.backbone.out_channels();
        let global_pool = self.global_pool.init::<B>(feature_channels, device)?;
        let roi_pool = match &self.roi_pool {
            Some(config) => Some(config.init::<B>(feature_channels, device)?),
            None => None,
        };
        let fused_in = global_pool.out_features()
            + roi_pool.as_ref().map(RoiPool::out_features).unwrap_or(0);
        let concat = self.concat.init::<B>(fused_in, device)?;
        let loss = self.loss.init::<B>(self.concat.num_attributes, device)?;
        Ok(RoiPredictor {
            backbone,
            global_pool,
            roi_pool,
            concat,
            loss,
        })
    }
}

/// Named scalar loss of one training step.
#[derive(Debug, Clone)]
pub struct AttrLosses<B: Backend> {
    pub loss: Tensor<B, 1>,
}

/// Fashion-attribute predictor fusing a global image descriptor with an
/// optional landmark-conditioned local descriptor.
///
/// Whether landmarks are required is fixed at construction by the
/// presence of the `roi_pool` sub-component; every operation checks the
/// call against that state and signals [`Error::Consistency`] on
/// disagreement in either direction.
#[derive(Module, Debug)]
pub struct RoiPredictor<B: Backend> {
    backbone: Backbone<B>,
    global_pool: GlobalPool<B>,
    roi_pool: Option<RoiPool<B>>,
    concat: Concat<B>,
    loss: AttrLoss<B>,
}

impl<B: Backend> RoiPredictor<B> {
    pub fn with_roi_pool(&self) -> bool {
        self.roi_pool.is_some()
    }

    pub fn num_attributes(&self) -> usize {
        self.concat.num_attributes()
    }

    pub fn num_landmarks(&self) -> Option<usize> {
        self.roi_pool.as_ref().map(RoiPool::num_landmarks)
    }

    /// Shared pipeline of all three public operations: backbone, global
    /// pooling, optional roi pooling, fusion.
    fn forward_fused(
        &self,
        images: Tensor<B, 4>,
        landmarks: Option<Tensor<B, 2>>,
    ) -> Result<Tensor<B, 2>, Error> {
        let [batch, channels, _, _] = images.dims();
        if batch == 0 {
            return Err(Error::shape("image batch", "at least one image", 0));
        }
        if channels != self.backbone.in_channels() {
            return Err(Error::shape(
                "image channels",
                self.backbone.in_channels(),
                channels,
            ));
        }

        let feats = self.backbone.forward(images);
        let global = self.global_pool.forward(feats.clone());
        let local = match (&self.roi_pool, landmarks) {
            (Some(roi_pool), Some(landmarks)) => Some(roi_pool.forward(feats, landmarks)?),
            (None, None) => None,
            (Some(_), None) => {
                return Err(Error::Consistency(
                    "landmarks are required: the predictor was built with a roi_pool".into(),
                ))
            }
            (None, Some(_)) => {
                return Err(Error::Consistency(
                    "landmarks were supplied but the predictor was built without a roi_pool"
                        .into(),
                ))
            }
        };
        Ok(self.concat.forward(global, local))
    }

    fn forward_with_loss(
        &self,
        images: Tensor<B, 4>,
        labels: Tensor<B, 2, Int>,
        landmarks: Option<Tensor<B, 2>>,
    ) -> Result<(Tensor<B, 2>, Tensor<B, 1>), Error> {
        let predictions = self.forward_fused(images, landmarks)?;
        let [batch, width] = predictions.dims();
        let [label_rows, label_width] = labels.dims();
        if label_rows != batch || label_width != width {
            return Err(Error::shape(
                "label batch",
                format!("{batch}x{width}"),
                format!("{label_rows}x{label_width}"),
            ));
        }
        let loss = self.loss.forward(predictions.clone(), labels);
        Ok((predictions, loss))
    }

    /// Full pipeline plus the configured loss against `labels`.
    pub fn train_step(
        &self,
        images: Tensor<B, 4>,
        labels: Tensor<B, 2, Int>,
        landmarks: Option<Tensor<B, 2>>,
    ) -> Result<AttrLosses<B>, Error> {
        let (_, loss) = self.forward_with_loss(images, labels, landmarks)?;
        Ok(AttrLosses { loss })
    }

    /// One fused prediction row per input image, input order preserved.
    pub fn predict_batch(
        &self,
        images: Tensor<B, 4>,
        landmarks: Option<Tensor<B, 2>>,
    ) -> Result<Tensor<B, 2>, Error> {
        self.forward_fused(images, landmarks)
    }

    /// Single-image inference via a batch of one.
    pub fn predict_one(
        &self,
        image: Tensor<B, 3>,
        landmarks: Option<Tensor<B, 1>>,
    ) -> Result<Tensor<B, 1>, Error> {
        let images = image.unsqueeze::<4>();
        let landmarks = landmarks.map(|coords| coords.unsqueeze::<2>());
        let predictions = self.predict_batch(images, landmarks)?;
        Ok(predictions.slice([0..1]).squeeze(0))
    }

    /// The configured loss against already-computed predictions, for
    /// validation during evaluation.
    pub fn compute_loss(
        &self,
        predictions: Tensor<B, 2>,
        labels: Tensor<B, 2, Int>,
    ) -> Result<Tensor<B, 1>, Error> {
        let [batch, width] = predictions.dims();
        let [label_rows, label_width] = labels.dims();
        if label_rows != batch || label_width != width {
            return Err(Error::shape(
                "label batch",
                format!("{batch}x{width}"),
                format!("{label_rows}x{label_width}"),
            ));
        }
        Ok(self.loss.forward(predictions, labels))
    }

    /// Propagates weight initialization to every sub-component in a
    /// fixed order. With a `pretrained` path the full parameter record
    /// is loaded from it, replacing the construction-time values;
    /// otherwise those values stand.
    pub fn init_weights(self, pretrained: Option<&Path>) -> Result<Self, Error> {
        log::debug!("initializing backbone weights");
        log::debug!("initializing global_pool weights");
        if self.with_roi_pool() {
            log::debug!("initializing roi_pool weights");
        }
        log::debug!("initializing concat weights");
        match pretrained {
            Some(path) => {
                log::info!("loading pretrained weights from {}", path.display());
                self.load_checkpoint(path)
            }
            None => Ok(self),
        }
    }

    /// Loads a serialized parameter record into every sub-component;
    /// the record must structurally match the constructed shape.
    pub fn load_checkpoint(self, path: &Path) -> Result<Self, Error> {
        let device = self.devices().first().cloned().unwrap_or_default();
        let record = CompactRecorder::new().load(path.to_path_buf(), &device)?;
        Ok(self.load_record(record))
    }

    pub(crate) fn forward_train(
        &self,
        batch: AttrBatch<B>,
    ) -> Result<MultiLabelClassificationOutput<B>, Error> {
        let targets = batch
            .targets
            .ok_or_else(|| Error::Consistency("training batch carries no labels".into()))?;
        let (predictions, loss) =
            self.forward_with_loss(batch.images, targets.clone(), batch.landmarks)?;
        Ok(MultiLabelClassificationOutput::new(loss, predictions, targets))
    }
}

impl<B: AutodiffBackend> TrainStep<AttrBatch<B>, MultiLabelClassificationOutput<B>>
    for RoiPredictor<B>
{
    fn step(&self, batch: AttrBatch<B>) -> TrainOutput<MultiLabelClassificationOutput<B>> {
        // fail-fast: a malformed batch aborts the run
        let output = self
            .forward_train(batch)
            .unwrap_or_else(|err| panic!("training batch rejected: {err}"));
        TrainOutput::new(self, output.loss.backward(), output)
    }
}

impl<B: Backend> ValidStep<AttrBatch<B>, MultiLabelClassificationOutput<B>> for RoiPredictor<B> {
    fn step(&self, batch: AttrBatch<B>) -> MultiLabelClassificationOutput<B> {
        self.forward_train(batch)
            .unwrap_or_else(|err| panic!("validation batch rejected: {err}"))
    }
}
