#![cfg(any(feature = "ndarray", feature = "tch", feature = "candle"))]

mod backbone;
mod cli;
mod concat;
mod data;
mod dist;
mod error;
mod eval;
mod loss;
mod pooling;
mod predict;
mod predictor;
mod train;

pub use backbone::{Backbone, BackboneConfig};
pub use cli::run;
pub use concat::{Concat, ConcatConfig};
pub use data::{AttrAnnotations, AttrBatch, AttrBatcher, AttrDataSet, AttrSample};
pub use dist::{DistContext, Launcher};
pub use error::Error;
pub use eval::{evaluate, AttrMetrics, DataConfig, EvalArgs, EvalConfig, EvalReport};
pub use loss::{AttrLoss, LossConfig};
pub use pooling::{GlobalPool, GlobalPoolConfig, RoiPool, RoiPoolConfig};
pub use predict::{predict, Output, PredictArgs};
pub use predictor::{AttrLosses, PredictorConfig, RoiPredictor};
pub use train::{train, TrainingConfig};
