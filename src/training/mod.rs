//! Training of semi-supervised flows.
//!
//! This module provides:
//! - Loss functions (flow NLL, labeled cross-entropy, bits per dimension)
//! - Training configuration and schedules
//! - The training loop with pseudo-label consistency
//! - Checkpoints, evaluation and metric sinks

pub mod checkpoint;
mod config;
mod evaluate;
mod loss;
pub mod metrics;
mod schedule;
mod trainer;

pub use checkpoint::{CheckpointMeta, load_checkpoint, save_checkpoint};
pub use config::{LrSchedule, OptimizerKind, TrainingConfig};
pub use evaluate::{EvalMetrics, accuracy, evaluate};
pub use loss::{FlowLoss, bits_per_dim, labeled_cross_entropy};
pub use metrics::{AverageMeter, ImageGrid, JsonLinesSink, LogSink, MemorySink, MetricSink, make_grid};
pub use schedule::{linear_rampup, wilson_schedule};
pub use trainer::{
    EpochSummary, FlowOptimizers, LossWeights, StepOutput, TrainingResult, adam_optimizers, fit,
    sgd_optimizers, train, train_epoch, train_step,
};
