use crate::{
    data::{AttrBatcher, AttrDataSet},
    dist::{DistContext, Launcher},
    error::Error,
    predictor::PredictorConfig,
};
use anyhow::{Context, Result};
use burn::{
    data::dataloader::{DataLoaderBuilder, Dataset},
    prelude::*,
    tensor::{activation::sigmoid, ElementConversion},
};
use log::{debug, info};
use serde::Serialize;
use std::{fs::File, path::PathBuf};

/// Dataset section of the run config.
#[derive(Config, Debug)]
pub struct DataConfig {
    pub annotations: PathBuf,
    #[config(default = 224)]
    pub image_size: usize,
}

/// Run config: the model build-spec plus the dataset it runs against.
#[derive(Config, Debug)]
pub struct EvalConfig {
    pub model: PredictorConfig,
    pub data: DataConfig,
    #[config(default = 32)]
    pub batch_size: usize,
    #[config(default = 4)]
    pub num_workers: usize,
    /// Probability above which an attribute counts as predicted.
    #[config(default = 0.5)]
    pub confidence_threshold: f32,
}

#[derive(Debug)]
pub struct EvalArgs {
    pub config: PathBuf,
    pub checkpoint: PathBuf,
    pub work_dir: Option<PathBuf>,
    pub validate: bool,
    pub launcher: Launcher,
}

#[derive(Debug, Serialize)]
pub struct AttrMetrics {
    pub name: String,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: u64,
}

#[derive(Debug, Serialize)]
pub struct EvalReport {
    pub samples: usize,
    pub hamming_accuracy: f64,
    pub macro_precision: f64,
    pub macro_recall: f64,
    pub macro_f1: f64,
    pub mean_loss: Option<f64>,
    pub attributes: Vec<AttrMetrics>,
}

/// Evaluates a checkpoint over an annotated dataset. Fail-fast: the
/// first bad batch aborts the whole run.
pub fn evaluate<B: Backend>(args: EvalArgs, device: B::Device) -> Result<EvalReport> {
    let dist = DistContext::detect(args.launcher)?;
    info!("distributed evaluation: {}", dist.is_distributed());

    let config = EvalConfig::load(&args.config).map_err(|err| {
        Error::Configuration(format!(
            "failed to load config {}: {err}",
            args.config.display()
        ))
    })?;

    let dataset = AttrDataSet::eval(&config.data.annotations, config.data.image_size)?
        .shard(dist.rank, dist.world_size);
    let attribute_names = {
        let file = File::open(&config.data.annotations)?;
        let parsed: crate::data::AttrAnnotations = serde_json::from_reader(file)?;
        parsed.attributes
    };
    let total_samples = dataset.len();
    info!(
        "dataset loaded: {total_samples} samples, {} attributes, landmarks: {}",
        dataset.num_attributes(),
        dataset.num_landmarks().is_some()
    );

    let model = config
        .model
        .init::<B>(&device)?
        .load_checkpoint(&args.checkpoint)?;
    info!("checkpoint loaded from {}", args.checkpoint.display());
    if dataset.num_attributes() != model.num_attributes() {
        return Err(Error::shape(
            "attribute vocabulary",
            model.num_attributes(),
            dataset.num_attributes(),
        )
        .into());
    }

    let batcher = AttrBatcher::<B>::new(device, config.data.image_size);
    let dataloader = DataLoaderBuilder::new(batcher)
        .batch_size(config.batch_size)
        .num_workers(config.num_workers)
        .build(dataset);

    let num_attributes = model.num_attributes();
    let mut accumulator = MetricAccumulator::new(attribute_names, config.confidence_threshold);
    let mut loss_sum = 0.0f64;
    let mut batches = 0usize;
    let mut seen = 0usize;

    for batch in dataloader.iter() {
        let targets = batch
            .targets
            .clone()
            .ok_or_else(|| Error::Consistency("evaluation batch carries no labels".into()))?;
        let batch_rows = batch.paths.len();
        let predictions = model.predict_batch(batch.images, batch.landmarks)?;
        if args.validate {
            let loss = model.compute_loss(predictions.clone(), targets.clone())?;
            loss_sum += loss.into_scalar().elem::<f64>();
        }
        let probabilities: Vec<f32> = sigmoid(predictions)
            .into_data()
            .convert::<f32>()
            .to_vec()
            .expect("prediction tensor holds float data");
        let labels: Vec<i64> = targets
            .into_data()
            .convert::<i64>()
            .to_vec()
            .expect("label tensor holds integer data");
        accumulator.update(&probabilities, &labels, num_attributes);

        batches += 1;
        seen += batch_rows;
        debug!("evaluated {seen}/{total_samples} samples");
    }

    let mean_loss = (args.validate && batches > 0).then(|| loss_sum / batches as f64);
    let report = accumulator.report(mean_loss);
    info!(
        "evaluation finished: {} samples, hamming accuracy {:.4}, macro f1 {:.4}",
        report.samples, report.hamming_accuracy, report.macro_f1
    );
    if let Some(loss) = report.mean_loss {
        info!("mean validation loss {loss:.6}");
    }

    if let Some(work_dir) = &args.work_dir {
        std::fs::create_dir_all(work_dir)
            .with_context(|| format!("failed to create work dir {}", work_dir.display()))?;
        let file_name = if dist.is_distributed() {
            format!("report-rank{}.json", dist.rank)
        } else {
            "report.json".to_string()
        };
        let path = work_dir.join(file_name);
        serde_json::to_writer_pretty(File::create(&path)?, &report)?;
        info!("report written to {}", path.display());
    }

    Ok(report)
}

/// Per-attribute confusion counts at a fixed confidence threshold.
pub(crate) struct MetricAccumulator {
    names: Vec<String>,
    threshold: f32,
    true_positive: Vec<u64>,
    false_positive: Vec<u64>,
    false_negative: Vec<u64>,
    true_negative: Vec<u64>,
    samples: usize,
}

impl MetricAccumulator {
    pub(crate) fn new(names: Vec<String>, threshold: f32) -> Self {
        let width = names.len();
        Self {
            names,
            threshold,
            true_positive: vec![0; width],
            false_positive: vec![0; width],
            false_negative: vec![0; width],
            true_negative: vec![0; width],
            samples: 0,
        }
    }

    pub(crate) fn update(&mut self, probabilities: &[f32], labels: &[i64], width: usize) {
        for (row, truth) in probabilities.chunks(width).zip(labels.chunks(width)) {
            self.samples += 1;
            for (attr, (probability, label)) in row.iter().zip(truth).enumerate() {
                let predicted = *probability > self.threshold;
                let actual = *label != 0;
                match (predicted, actual) {
                    (true, true) => self.true_positive[attr] += 1,
                    (true, false) => self.false_positive[attr] += 1,
                    (false, true) => self.false_negative[attr] += 1,
                    (false, false) => self.true_negative[attr] += 1,
                }
            }
        }
    }

    pub(crate) fn report(self, mean_loss: Option<f64>) -> EvalReport {
        let mut attributes = Vec::with_capacity(self.names.len());
        let mut correct = 0u64;
        let mut total = 0u64;
        for (attr, name) in self.names.into_iter().enumerate() {
            let tp = self.true_positive[attr];
            let fp = self.false_positive[attr];
            let fnn = self.false_negative[attr];
            let tn = self.true_negative[attr];
            let precision = ratio(tp, tp + fp);
            let recall = ratio(tp, tp + fnn);
            let f1 = if precision + recall > 0.0 {
                2.0 * precision * recall / (precision + recall)
            } else {
                0.0
            };
            correct += tp + tn;
            total += tp + fp + fnn + tn;
            attributes.push(AttrMetrics {
                name,
                precision,
                recall,
                f1,
                support: tp + fnn,
            });
        }
        let count = attributes.len().max(1) as f64;
        EvalReport {
            samples: self.samples,
            hamming_accuracy: ratio(correct, total),
            macro_precision: attributes.iter().map(|m| m.precision).sum::<f64>() / count,
            macro_recall: attributes.iter().map(|m| m.recall).sum::<f64>() / count,
            macro_f1: attributes.iter().map(|m| m.f1).sum::<f64>() / count,
            mean_loss,
            attributes,
        }
    }
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backbone::BackboneConfig,
        concat::ConcatConfig,
        data::{AttrAnnotations, AttrSample},
        pooling::{GlobalPoolConfig, RoiPoolConfig},
    };
    use burn::record::CompactRecorder;
    use std::path::Path;

    type TB = burn::backend::NdArray<f32>;

    fn write_test_image(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        let mut img = image::RgbImage::new(16, 16);
        for (x, y, pixel) in img.enumerate_pixels_mut() {
            *pixel = image::Rgb([(x * 15) as u8, (y * 15) as u8, 128]);
        }
        img.save(&path).unwrap();
        path
    }

    #[test]
    fn evaluate_runs_end_to_end_and_writes_a_report() {
        let dir = tempfile::tempdir().unwrap();

        let annotations = AttrAnnotations {
            attributes: vec!["floral".into(), "striped".into()],
            num_landmarks: Some(1),
            samples: (0..3)
                .map(|index| AttrSample {
                    path: write_test_image(dir.path(), &format!("img{index}.png")),
                    attributes: vec![1, 0],
                    landmarks: Some(vec![0.5, 0.5]),
                })
                .collect(),
        };
        let annotations_path = dir.path().join("annotations.json");
        serde_json::to_writer(File::create(&annotations_path).unwrap(), &annotations).unwrap();

        let model_config = PredictorConfig::new(
            BackboneConfig::new("conv".into(), vec![4, 8]),
            GlobalPoolConfig::new("avg".into(), 6),
            ConcatConfig::new(2),
        )
        .with_roi_pool(Some(RoiPoolConfig::new("landmark".into(), 1, 4)));
        let config = EvalConfig::new(
            model_config,
            DataConfig::new(annotations_path).with_image_size(16),
        )
        .with_batch_size(2)
        .with_num_workers(1);
        let config_path = dir.path().join("config.json");
        config.save(&config_path).unwrap();

        let checkpoint = dir.path().join("checkpoint");
        let model = EvalConfig::load(&config_path)
            .unwrap()
            .model
            .init::<TB>(&Default::default())
            .unwrap();
        model.save_file(&checkpoint, &CompactRecorder::new()).unwrap();

        let work_dir = dir.path().join("out");
        let report = evaluate::<TB>(
            EvalArgs {
                config: config_path,
                checkpoint,
                work_dir: Some(work_dir.clone()),
                validate: true,
                launcher: Launcher::None,
            },
            Default::default(),
        )
        .unwrap();

        assert_eq!(report.samples, 3);
        assert_eq!(report.attributes.len(), 2);
        let loss = report.mean_loss.unwrap();
        assert!(loss.is_finite() && loss >= 0.0);
        assert!(work_dir.join("report.json").exists());
    }

    #[test]
    fn evaluate_fails_fast_on_a_missing_checkpoint() {
        let dir = tempfile::tempdir().unwrap();

        let annotations = AttrAnnotations {
            attributes: vec!["floral".into()],
            num_landmarks: None,
            samples: vec![AttrSample {
                path: write_test_image(dir.path(), "img.png"),
                attributes: vec![1],
                landmarks: None,
            }],
        };
        let annotations_path = dir.path().join("annotations.json");
        serde_json::to_writer(File::create(&annotations_path).unwrap(), &annotations).unwrap();

        let config = EvalConfig::new(
            PredictorConfig::new(
                BackboneConfig::new("conv".into(), vec![4]),
                GlobalPoolConfig::new("avg".into(), 4),
                ConcatConfig::new(1),
            ),
            DataConfig::new(annotations_path).with_image_size(16),
        );
        let config_path = dir.path().join("config.json");
        config.save(&config_path).unwrap();

        let err = evaluate::<TB>(
            EvalArgs {
                config: config_path,
                checkpoint: dir.path().join("missing"),
                work_dir: None,
                validate: false,
                launcher: Launcher::None,
            },
            Default::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::CheckpointLoad(_))
        ));
    }

    #[test]
    fn accumulator_computes_confusion_metrics() {
        let mut accumulator =
            MetricAccumulator::new(vec!["floral".into(), "striped".into()], 0.5);
        // two samples: first predicts both attributes, second predicts none
        accumulator.update(&[0.9, 0.8, 0.1, 0.2], &[1, 0, 1, 0], 2);

        let report = accumulator.report(Some(0.25));
        assert_eq!(report.samples, 2);
        // floral: tp=1 fn=1, striped: fp=1 tn=1
        let floral = &report.attributes[0];
        assert_eq!(floral.support, 2);
        assert!((floral.precision - 1.0).abs() < 1e-9);
        assert!((floral.recall - 0.5).abs() < 1e-9);
        let striped = &report.attributes[1];
        assert_eq!(striped.support, 0);
        assert!((striped.precision - 0.0).abs() < 1e-9);
        // 2 correct cells of 4
        assert!((report.hamming_accuracy - 0.5).abs() < 1e-9);
        assert_eq!(report.mean_loss, Some(0.25));
    }

    #[test]
    fn empty_report_has_zero_metrics() {
        let report = MetricAccumulator::new(vec!["floral".into()], 0.5).report(None);
        assert_eq!(report.samples, 0);
        assert_eq!(report.hamming_accuracy, 0.0);
        assert_eq!(report.mean_loss, None);
    }
}
