//! Training configuration.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::data::Dataset;
use crate::errors::FlowError;
use crate::flow::FlowArchitecture;
use crate::model::SemiSupervisedFlowConfig;
use crate::prior::MeansInit;

/// Optimizer used for the flow parameters (and trainable means).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    Adam,
    Sgd,
}

impl OptimizerKind {
    pub fn from_name(name: &str) -> Result<Self, FlowError> {
        match name.to_lowercase().as_str() {
            "adam" => Ok(OptimizerKind::Adam),
            "sgd" => Ok(OptimizerKind::Sgd),
            _ => Err(FlowError::UnknownOption {
                kind: "optimizer",
                name: name.to_string(),
            }),
        }
    }
}

/// Learning-rate schedule over epochs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LrSchedule {
    #[serde(alias = "no")]
    Constant,
    /// Flat for the first half, linear decay to 1% by 90%, then flat.
    Wilson,
}

impl LrSchedule {
    pub fn from_name(name: &str) -> Result<Self, FlowError> {
        match name.to_lowercase().as_str() {
            "no" | "constant" => Ok(LrSchedule::Constant),
            "wilson" => Ok(LrSchedule::Wilson),
            _ => Err(FlowError::UnknownOption {
                kind: "schedule",
                name: name.to_string(),
            }),
        }
    }
}

impl fmt::Display for LrSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LrSchedule::Constant => f.write_str("constant"),
            LrSchedule::Wilson => f.write_str("wilson"),
        }
    }
}

/// Configuration for semi-supervised flow training.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub dataset: Dataset,
    pub flow: FlowArchitecture,
    pub optimizer: OptimizerKind,
    pub learning_rate: f64,
    pub schedule: LrSchedule,
    /// Gradient norm above which gradients are clipped.
    pub max_grad_norm: f64,
    /// L2 penalty on flow parameters. Mixture means are never decayed.
    pub weight_decay: f64,
    pub epochs: usize,
    /// Must match the batch size of sources that report one.
    pub batch_size: usize,
    pub num_classes: usize,
    pub means: MeansInit,
    pub means_r: f64,
    pub cov_std: f64,
    pub means_trainable: bool,
    /// Weight of the labeled cross-entropy term.
    pub label_weight: f64,
    /// Final weight of the consistency term, reached after `consistency_rampup` epochs.
    pub consistency_weight: f64,
    pub consistency_rampup: usize,
    /// Drop the unsupervised likelihood term.
    pub supervised_only: bool,
    /// Quantization levels of the input data, for the dequantization correction.
    pub k: f64,
    pub save_freq: usize,
    pub eval_freq: usize,
    /// Number of images sampled (across all classes) at evaluation.
    pub num_samples: usize,
    pub ckptdir: PathBuf,
    /// Metrics directory used by [`train`](super::train).
    pub logdir: PathBuf,
    /// Checkpoint to resume from (`{dir}/{epoch}` with or without `.mpk`).
    pub resume: Option<PathBuf>,
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            dataset: Dataset::Cifar10,
            flow: FlowArchitecture::SpectralFlow,
            optimizer: OptimizerKind::Adam,
            learning_rate: 1e-3,
            schedule: LrSchedule::Constant,
            max_grad_norm: 100.0,
            weight_decay: 0.0,
            epochs: 100,
            batch_size: 64,
            num_classes: 10,
            means: MeansInit::Random,
            means_r: 1.0,
            cov_std: 1.0,
            means_trainable: false,
            label_weight: 1.0,
            consistency_weight: 1.0,
            consistency_rampup: 1,
            supervised_only: false,
            k: 256.0,
            save_freq: 25,
            eval_freq: 1,
            num_samples: 50,
            ckptdir: PathBuf::from("ckpts"),
            logdir: PathBuf::from("logs"),
            resume: None,
            seed: 0,
        }
    }
}

impl TrainingConfig {
    /// Creates a new TrainingConfig with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the dataset and its class count.
    pub fn dataset(mut self, dataset: Dataset) -> Self {
        self.dataset = dataset;
        self.num_classes = dataset.num_classes();
        self
    }

    pub fn flow(mut self, flow: FlowArchitecture) -> Self {
        self.flow = flow;
        self
    }

    pub fn optimizer(mut self, optimizer: OptimizerKind) -> Self {
        self.optimizer = optimizer;
        self
    }

    /// Sets the learning rate.
    pub fn learning_rate(mut self, lr: f64) -> Self {
        self.learning_rate = lr;
        self
    }

    pub fn schedule(mut self, schedule: LrSchedule) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn max_grad_norm(mut self, norm: f64) -> Self {
        self.max_grad_norm = norm;
        self
    }

    pub fn weight_decay(mut self, weight_decay: f64) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    /// Sets the number of epochs.
    pub fn epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    /// Sets the batch size.
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn num_classes(mut self, num_classes: usize) -> Self {
        self.num_classes = num_classes;
        self
    }

    /// Sets the means policy and its radius.
    pub fn means(mut self, means: MeansInit, r: f64) -> Self {
        self.means = means;
        self.means_r = r;
        self
    }

    pub fn cov_std(mut self, cov_std: f64) -> Self {
        self.cov_std = cov_std;
        self
    }

    pub fn means_trainable(mut self, trainable: bool) -> Self {
        self.means_trainable = trainable;
        self
    }

    pub fn label_weight(mut self, weight: f64) -> Self {
        self.label_weight = weight;
        self
    }

    /// Sets the consistency weight and the number of epochs to ramp up to it.
    pub fn consistency(mut self, weight: f64, rampup: usize) -> Self {
        self.consistency_weight = weight;
        self.consistency_rampup = rampup;
        self
    }

    pub fn supervised_only(mut self, supervised_only: bool) -> Self {
        self.supervised_only = supervised_only;
        self
    }

    pub fn save_freq(mut self, freq: usize) -> Self {
        self.save_freq = freq;
        self
    }

    pub fn eval_freq(mut self, freq: usize) -> Self {
        self.eval_freq = freq;
        self
    }

    pub fn num_samples(mut self, num_samples: usize) -> Self {
        self.num_samples = num_samples;
        self
    }

    pub fn ckptdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.ckptdir = dir.into();
        self
    }

    pub fn logdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.logdir = dir.into();
        self
    }

    pub fn resume(mut self, checkpoint: impl Into<PathBuf>) -> Self {
        self.resume = Some(checkpoint.into());
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Checks numeric ranges before any computation starts.
    pub fn validate(&self) -> Result<(), FlowError> {
        let invalid = |message: String| Err(FlowError::InvalidConfig { message });
        let positive = [
            ("learning_rate", self.learning_rate),
            ("max_grad_norm", self.max_grad_norm),
            ("cov_std", self.cov_std),
            ("k", self.k),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return invalid(format!("{name} must be positive, got {value}"));
            }
        }
        let non_negative = [
            ("weight_decay", self.weight_decay),
            ("means_r", self.means_r),
            ("label_weight", self.label_weight),
            ("consistency_weight", self.consistency_weight),
        ];
        for (name, value) in non_negative {
            if !(value.is_finite() && value >= 0.0) {
                return invalid(format!("{name} must be non-negative, got {value}"));
            }
        }
        let counts = [
            ("epochs", self.epochs),
            ("batch_size", self.batch_size),
            ("num_classes", self.num_classes),
            ("consistency_rampup", self.consistency_rampup),
            ("save_freq", self.save_freq),
            ("eval_freq", self.eval_freq),
        ];
        for (name, value) in counts {
            if value == 0 {
                return invalid(format!("{name} must be at least 1"));
            }
        }
        Ok(())
    }

    /// Model configuration for `image_shape` images.
    pub fn model_config(&self, image_shape: [usize; 3]) -> SemiSupervisedFlowConfig {
        SemiSupervisedFlowConfig::new(self.flow, image_shape, self.num_classes)
            .with_means(self.means, self.means_r)
            .with_cov_std(self.cov_std)
            .with_trainable_means(self.means_trainable)
            .with_seed(self.seed)
    }

    /// Writes the config as pretty JSON to `path`.
    pub fn save(&self, path: &Path) -> Result<(), FlowError> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, FlowError> {
        let config: Self = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        config.validate()?;
        Ok(config)
    }
}
