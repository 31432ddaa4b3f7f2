use crate::{
    dist::Launcher,
    eval::{evaluate, EvalArgs, EvalConfig},
    predict::{predict, Output, PredictArgs},
    train::{train, TrainingConfig},
};
use anyhow::Result;
use burn::config::Config as _;
use burn::optim::AdamConfig;
use clap::{CommandFactory as _, Parser, Subcommand};
use clap_complete::{generate, Shell};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    #[clap(subcommand)]
    subcmd: SubCmd,
}

#[derive(Debug, Subcommand)]
enum SubCmd {
    /// Evaluate a checkpoint over an annotated dataset.
    Eval {
        /// Path to the run config (model build-spec plus dataset)
        #[arg(short, long)]
        config: PathBuf,
        /// Path to the model checkpoint
        #[arg(long)]
        checkpoint: PathBuf,
        /// Directory to save the evaluation report
        #[arg(short, long)]
        work_dir: Option<PathBuf>,
        /// Also compute the configured loss against the labels
        #[arg(long)]
        validate: bool,
        /// Distributed job launcher this worker was started under
        #[arg(short, long, value_enum, default_value = "none")]
        launcher: Launcher,
    },
    /// Train a predictor described by a run config.
    Train {
        /// Path to the run config (model build-spec plus dataset)
        #[arg(short, long)]
        config: PathBuf,
        /// Path to the training set annotations
        #[arg(short, long)]
        train_set: PathBuf,
        /// Path to the validation set annotations
        #[arg(short, long)]
        valid_set: PathBuf,
        /// Directory to save artifacts (recreated if it exists)
        #[arg(short, long, default_value = "fashionxp_artifact")]
        artifact_dir: PathBuf,
        #[arg(short, long, default_value = "64")]
        num_epochs: usize,
        #[arg(short, long, default_value = "8")]
        batch_size: usize,
        /// Number of workers for data loading
        #[arg(short = 'w', long, default_value = "4")]
        num_workers: usize,
        #[arg(short, long, default_value = "1.0e-3")]
        learning_rate: f64,
        /// Number of epochs without improvement before stopping
        #[arg(short, long, default_value = "10")]
        early_stopping: usize,
        /// Path to a pretrained checkpoint fed to weight initialization
        #[arg(short, long)]
        pretrained: Option<PathBuf>,
        /// Random seed for reproducibility
        #[arg(short, long, default_value = "42")]
        seed: u64,
    },
    /// Score every image under a directory with a checkpoint.
    Predict {
        /// Path to the run config (model build-spec plus dataset)
        #[arg(short, long)]
        config: PathBuf,
        /// Path to the model checkpoint
        #[arg(long)]
        checkpoint: PathBuf,
        /// Method to output the scores
        #[arg(short, long, default_value = "tty")]
        output: Output,
        #[arg(short, long, default_value = "32")]
        batch_size: usize,
        /// Number of workers for data loading
        #[arg(short = 'w', long, default_value = "4")]
        num_workers: usize,
        /// Only attributes above this probability are reported
        #[arg(long, default_value = "0.5")]
        confidence_threshold: f32,
        /// Root of the images directory
        input: PathBuf,
    },
    /// Generate an auto completion script.
    GenCompletion {
        /// shell name
        shell: Shell,
    },
}

#[cfg(feature = "tch")]
type MyBackend = burn::backend::LibTorch<f32>;
#[cfg(all(feature = "candle", not(feature = "tch")))]
type MyBackend = burn::backend::Candle<f32, u8>;
#[cfg(all(feature = "ndarray", not(any(feature = "tch", feature = "candle"))))]
type MyBackend = burn::backend::NdArray<f32>;

type MyAutodiffBackend = burn::backend::Autodiff<MyBackend>;

pub fn run() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    #[cfg(all(feature = "tch", target_os = "macos"))]
    let device = burn::backend::libtorch::LibTorchDevice::Mps;
    #[cfg(all(feature = "tch", not(target_os = "macos")))]
    let device = burn::backend::libtorch::LibTorchDevice::Cuda(0);

    #[cfg(all(feature = "candle", not(feature = "tch")))]
    let device = burn::backend::candle::CandleDevice::Cuda(0);

    #[cfg(all(feature = "ndarray", not(any(feature = "tch", feature = "candle"))))]
    let device = burn::backend::ndarray::NdArrayDevice::Cpu;

    let args = Cli::parse();
    match args.subcmd {
        SubCmd::Eval {
            config,
            checkpoint,
            work_dir,
            validate,
            launcher,
        } => {
            evaluate::<MyBackend>(
                EvalArgs {
                    config,
                    checkpoint,
                    work_dir,
                    validate,
                    launcher,
                },
                device,
            )?;
        }
        SubCmd::Train {
            config,
            train_set,
            valid_set,
            artifact_dir,
            num_epochs,
            batch_size,
            num_workers,
            learning_rate,
            early_stopping,
            pretrained,
            seed,
        } => {
            let run_config = EvalConfig::load(&config).map_err(|err| {
                crate::error::Error::Configuration(format!(
                    "failed to load config {}: {err}",
                    config.display()
                ))
            })?;
            train::<MyAutodiffBackend>(
                &artifact_dir,
                TrainingConfig::new(run_config.model, AdamConfig::new(), train_set, valid_set)
                    .with_image_size(run_config.data.image_size)
                    .with_num_epochs(num_epochs)
                    .with_batch_size(batch_size)
                    .with_num_workers(num_workers)
                    .with_learning_rate(learning_rate)
                    .with_early_stopping(early_stopping)
                    .with_pretrained(pretrained)
                    .with_seed(seed),
                device,
            )?;
        }
        SubCmd::Predict {
            config,
            checkpoint,
            output,
            batch_size,
            num_workers,
            confidence_threshold,
            input,
        } => {
            predict::<MyBackend>(
                PredictArgs {
                    config,
                    checkpoint,
                    input,
                    output,
                    batch_size,
                    num_workers,
                    confidence_threshold,
                },
                device,
            )?;
        }
        SubCmd::GenCompletion { shell } => {
            generate(shell, &mut Cli::command(), "fashionxp", &mut std::io::stdout());
        }
    }
    Ok(())
}
