use crate::{
    data::{AttrAnnotations, AttrBatcher, AttrDataSet},
    error::Error,
    eval::EvalConfig,
};
use anyhow::Result;
use burn::{
    data::dataloader::DataLoaderBuilder,
    prelude::*,
    tensor::activation::sigmoid,
};
use clap::ValueEnum;
use serde::Serialize;
use std::{collections::HashMap, fs::File, path::PathBuf};

#[derive(Debug, Clone, Default, ValueEnum)]
pub enum Output {
    #[default]
    Tty,
    Json,
}

#[derive(Debug)]
pub struct PredictArgs {
    pub config: PathBuf,
    pub checkpoint: PathBuf,
    pub input: PathBuf,
    pub output: Output,
    pub batch_size: usize,
    pub num_workers: usize,
    pub confidence_threshold: f32,
}

#[derive(Debug, Serialize)]
struct AttrScore {
    name: String,
    probability: f32,
}

type JsonOutput = HashMap<PathBuf, Vec<AttrScore>>;

/// Scores every image under a directory with a checkpoint. The scanned
/// tree carries no landmark annotations, so the configured model must
/// not require them.
pub fn predict<B: Backend>(args: PredictArgs, device: B::Device) -> Result<()> {
    let config = EvalConfig::load(&args.config).map_err(|err| {
        Error::Configuration(format!(
            "failed to load config {}: {err}",
            args.config.display()
        ))
    })?;
    let attribute_names = {
        let file = File::open(&config.data.annotations)?;
        let parsed: AttrAnnotations = serde_json::from_reader(file)?;
        parsed.attributes
    };

    let model = config
        .model
        .init::<B>(&device)?
        .load_checkpoint(&args.checkpoint)?;
    if model.with_roi_pool() {
        return Err(Error::Consistency(
            "directory scoring has no landmark annotations; the configured model requires them"
                .into(),
        )
        .into());
    }
    if attribute_names.len() != model.num_attributes() {
        return Err(Error::shape(
            "attribute vocabulary",
            model.num_attributes(),
            attribute_names.len(),
        )
        .into());
    }

    let batcher = AttrBatcher::<B>::new(device, config.data.image_size);
    let dataloader = DataLoaderBuilder::new(batcher)
        .batch_size(args.batch_size)
        .num_workers(args.num_workers)
        .build(AttrDataSet::unlabeled(&args.input, config.data.image_size)?);

    let width = attribute_names.len();
    let mut json_output = JsonOutput::new();
    for batch in dataloader.iter() {
        let probabilities: Vec<f32> = sigmoid(model.predict_batch(batch.images, batch.landmarks)?)
            .into_data()
            .convert::<f32>()
            .to_vec()
            .expect("prediction tensor holds float data");
        for (path, row) in batch.paths.into_iter().zip(probabilities.chunks(width)) {
            let scores = row
                .iter()
                .zip(attribute_names.iter())
                .filter(|(probability, _)| **probability > args.confidence_threshold)
                .map(|(probability, name)| AttrScore {
                    name: name.clone(),
                    probability: *probability,
                })
                .collect::<Vec<_>>();
            match args.output {
                Output::Tty => {
                    println!(
                        "{}: {}",
                        path.display(),
                        scores
                            .iter()
                            .map(|score| format!("{} ({:.3})", score.name, score.probability))
                            .collect::<Vec<_>>()
                            .join(", ")
                    );
                }
                Output::Json => {
                    json_output.insert(path, scores);
                }
            }
        }
    }
    if matches!(args.output, Output::Json) {
        serde_json::to_writer_pretty(std::io::stdout(), &json_output)?;
    }
    Ok(())
}
