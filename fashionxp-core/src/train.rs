use crate::{
    data::{AttrBatcher, AttrDataSet},
    predictor::PredictorConfig,
};
use anyhow::{Context, Result};
use burn::{
    data::dataloader::DataLoaderBuilder,
    optim::AdamConfig,
    prelude::*,
    record::CompactRecorder,
    tensor::backend::AutodiffBackend,
    train::{
        metric::{
            store::{Aggregate, Direction, Split},
            HammingScore, LossMetric,
        },
        LearnerBuilder, MetricEarlyStoppingStrategy, StoppingCondition,
    },
};
use log::info;
use std::path::{Path, PathBuf};

#[derive(Config)]
pub struct TrainingConfig {
    pub model: PredictorConfig,
    pub optimizer: AdamConfig,
    pub train_set: PathBuf,
    pub valid_set: PathBuf,
    pub pretrained: Option<PathBuf>,
    #[config(default = 224)]
    pub image_size: usize,
    #[config(default = 64)]
    pub num_epochs: usize,
    #[config(default = 8)]
    pub batch_size: usize,
    #[config(default = 4)]
    pub num_workers: usize,
    #[config(default = 42)]
    pub seed: u64,
    #[config(default = 1.0e-3)]
    pub learning_rate: f64,
    #[config(default = 10)]
    pub early_stopping: usize,
}

fn create_artifact_dir(artifact_dir: &Path) {
    // Remove existing artifacts before to get an accurate learner summary
    std::fs::remove_dir_all(artifact_dir).ok();
    std::fs::create_dir_all(artifact_dir).ok();
}

pub fn train<B: AutodiffBackend>(
    artifact_dir: &Path,
    config: TrainingConfig,
    device: B::Device,
) -> Result<()> {
    create_artifact_dir(artifact_dir);

    B::seed(config.seed);

    config
        .save(artifact_dir.join("config.json"))
        .context("config should be saved successfully")?;

    let model = config
        .model
        .init::<B>(&device)?
        .init_weights(config.pretrained.as_deref())?;
    info!(
        "predictor built: {} attributes, roi pooling: {}",
        model.num_attributes(),
        model.with_roi_pool()
    );

    let batcher_train = AttrBatcher::<B>::new(device.clone(), config.image_size);
    let batcher_valid = AttrBatcher::<B::InnerBackend>::new(device.clone(), config.image_size);

    let dataloader_train = DataLoaderBuilder::new(batcher_train)
        .batch_size(config.batch_size)
        .shuffle(config.seed)
        .num_workers(config.num_workers)
        .build(AttrDataSet::train(&config.train_set, config.image_size)?);

    let dataloader_valid = DataLoaderBuilder::new(batcher_valid)
        .batch_size(config.batch_size)
        .shuffle(config.seed)
        .num_workers(config.num_workers)
        .build(AttrDataSet::eval(&config.valid_set, config.image_size)?);

    let learner = LearnerBuilder::new(artifact_dir)
        .metric_train_numeric(LossMetric::new())
        .metric_valid_numeric(LossMetric::new())
        .metric_train_numeric(HammingScore::new().with_sigmoid(true))
        .metric_valid_numeric(HammingScore::new().with_sigmoid(true))
        .early_stopping(MetricEarlyStoppingStrategy::new::<LossMetric<B>>(
            Aggregate::Mean,
            Direction::Lowest,
            Split::Valid,
            StoppingCondition::NoImprovementSince {
                n_epochs: config.early_stopping,
            },
        ))
        .with_file_checkpointer(CompactRecorder::new())
        .devices(vec![device.clone()])
        .num_epochs(config.num_epochs)
        .summary()
        .build(model, config.optimizer.init(), config.learning_rate);

    let model_trained = learner.fit(dataloader_train, dataloader_valid);

    model_trained
        .save_file(artifact_dir.join("model"), &CompactRecorder::new())
        .context("trained model should be saved successfully")?;
    info!("trained model saved under {}", artifact_dir.display());
    Ok(())
}
