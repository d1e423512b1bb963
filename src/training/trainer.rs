//! Semi-supervised training loop.

use std::fs;

use burn::{
    grad_clipping::GradientClippingConfig,
    module::AutodiffModule,
    optim::{AdamConfig, GradientsParams, Optimizer, SgdConfig, decay::WeightDecayConfig},
    tensor::{Tensor, backend::AutodiffBackend, backend::Backend},
};

use super::checkpoint::{load_checkpoint, save_checkpoint};
use super::config::{OptimizerKind, TrainingConfig};
use super::evaluate::{EvalMetrics, accuracy, evaluate};
use super::loss::{FlowLoss, bits_per_dim, labeled_cross_entropy};
use super::metrics::{AverageMeter, JsonLinesSink, MetricSink, make_grid};
use super::schedule::linear_rampup;
use crate::data::{DataSource, EvalBatch, TrainBatch, check_labels};
use crate::errors::FlowError;
use crate::flow::Flow;
use crate::layers::host;
use crate::model::SemiSupervisedFlow;
use crate::prior::GaussianMixture;

/// Images shown per `data/x*` grid.
const PREVIEW_IMAGES: usize = 10;

/// One optimizer for the flow and one for the mixture means.
///
/// Weight decay applies to the flow only; the means are never decayed.
#[derive(Debug)]
pub struct FlowOptimizers<OF, OP> {
    pub flow: OF,
    pub prior: OP,
}

fn clipping(config: &TrainingConfig) -> Option<GradientClippingConfig> {
    // Burn clips each parameter tensor's norm separately, not the global norm.
    Some(GradientClippingConfig::Norm(config.max_grad_norm as f32))
}

fn decay(config: &TrainingConfig) -> Option<WeightDecayConfig> {
    (config.weight_decay > 0.0).then(|| WeightDecayConfig::new(config.weight_decay as f32))
}

/// Adam optimizers configured from `config`.
pub fn adam_optimizers<B: AutodiffBackend>(
    config: &TrainingConfig,
) -> FlowOptimizers<impl Optimizer<Flow<B>, B> + use<B>, impl Optimizer<GaussianMixture<B>, B> + use<B>> {
    FlowOptimizers {
        flow: AdamConfig::new()
            .with_weight_decay(decay(config))
            .with_grad_clipping(clipping(config))
            .init::<B, Flow<B>>(),
        prior: AdamConfig::new()
            .with_grad_clipping(clipping(config))
            .init::<B, GaussianMixture<B>>(),
    }
}

/// Plain SGD optimizers configured from `config`.
pub fn sgd_optimizers<B: AutodiffBackend>(
    config: &TrainingConfig,
) -> FlowOptimizers<impl Optimizer<Flow<B>, B> + use<B>, impl Optimizer<GaussianMixture<B>, B> + use<B>> {
    FlowOptimizers {
        flow: SgdConfig::new()
            .with_weight_decay(decay(config))
            .with_gradient_clipping(clipping(config))
            .init::<B, Flow<B>>(),
        prior: SgdConfig::new()
            .with_gradient_clipping(clipping(config))
            .init::<B, GaussianMixture<B>>(),
    }
}

/// Weights of the three loss terms for one step.
#[derive(Debug, Clone, Copy)]
pub struct LossWeights {
    pub label_weight: f64,
    pub consistency_weight: f64,
    pub supervised_only: bool,
}

impl LossWeights {
    fn from_config(config: &TrainingConfig, consistency_weight: f64) -> Self {
        Self {
            label_weight: config.label_weight,
            consistency_weight,
            supervised_only: config.supervised_only,
        }
    }
}

/// Scalars of one optimization step.
#[derive(Debug, Clone, Copy)]
pub struct StepOutput {
    pub loss: f64,
    pub loss_unsup: f64,
    /// Cross-entropy on the labeled rows.
    pub loss_ce: f64,
    pub loss_consistency: f64,
    /// Mean flow log-determinant.
    pub jaclogdet: f64,
    /// Accuracy on the labeled rows, `None` when the batch has none.
    pub acc: Option<f64>,
    pub labeled: usize,
    pub batch_size: usize,
}

/// Per-epoch summary returned by [`fit`].
#[derive(Debug, Clone)]
pub struct EpochSummary {
    pub epoch: usize,
    pub learning_rate: f64,
    pub consistency_weight: f64,
    pub loss: f64,
    pub acc: f64,
    pub eval: Option<EvalMetrics>,
}

/// Training result containing the trained model and per-epoch history.
#[derive(Debug)]
pub struct TrainingResult<B: AutodiffBackend> {
    pub model: SemiSupervisedFlow<B>,
    /// First epoch run; non-zero after resuming.
    pub start_epoch: usize,
    pub history: Vec<EpochSummary>,
}

/// Class predictions for the second view, computed without gradients.
fn pseudo_labels<B: AutodiffBackend>(
    model: &SemiSupervisedFlow<B>,
    x2: Tensor<B, 4>,
) -> Result<Vec<i64>, FlowError> {
    let inner = model.valid();
    let encoded = inner.encode(x2.inner())?;
    let predictions = host::to_host_indices(inner.prior.classify(encoded.z)?)?;
    Ok(predictions.into_iter().map(|p| p as i64).collect())
}

/// One optimization step on `batch`.
///
/// The second view is classified without gradients to produce pseudo
/// labels. The first view contributes the labeled cross-entropy, the
/// unsupervised mixture NLL and the NLL under the pseudo labels:
/// `loss = ce * label_weight + unsup + consistency * consistency_weight`.
pub fn train_step<B, OF, OP>(
    model: SemiSupervisedFlow<B>,
    optimizers: &mut FlowOptimizers<OF, OP>,
    batch: &TrainBatch<B>,
    loss_fn: &FlowLoss,
    weights: LossWeights,
    learning_rate: f64,
) -> Result<(SemiSupervisedFlow<B>, StepOutput), FlowError>
where
    B: AutodiffBackend,
    OF: Optimizer<Flow<B>, B>,
    OP: Optimizer<GaussianMixture<B>, B>,
{
    check_labels(&batch.labels, model.num_classes())?;
    let device = batch.x1.device();
    let pred2 = pseudo_labels(&model, batch.x2.clone())?;

    let encoded = model.encode(batch.x1.clone())?;
    let logits = model.prior.class_logits(encoded.z.clone())?;
    let predictions = host::to_host_indices(logits.clone().detach().argmax(1))?;
    let (loss_ce, _) = labeled_cross_entropy(logits, &batch.labels)?;

    let loss_unsup = if weights.supervised_only {
        Tensor::<B, 1>::zeros([1], &device)
    } else {
        loss_fn.compute(&model.prior, encoded.z.clone(), encoded.logdet.clone(), None)?
    };
    let loss_consistency = loss_fn.compute(
        &model.prior,
        encoded.z,
        encoded.logdet.clone(),
        Some(&pred2),
    )?;

    let loss = loss_ce.clone().mul_scalar(weights.label_weight)
        + loss_unsup.clone()
        + loss_consistency.clone().mul_scalar(weights.consistency_weight);

    let output = StepOutput {
        loss: host::scalar(loss.clone())?,
        loss_unsup: host::scalar(loss_unsup)?,
        loss_ce: host::scalar(loss_ce)?,
        loss_consistency: host::scalar(loss_consistency)?,
        jaclogdet: host::scalar(encoded.logdet.detach().mean())?,
        acc: accuracy(&predictions, &batch.labels),
        labeled: batch.labeled_count(),
        batch_size: batch.batch_size(),
    };
    if !output.loss.is_finite() {
        return Err(FlowError::InvalidConfig {
            message: format!("training loss diverged to {}", output.loss),
        });
    }

    let mut grads = loss.backward();
    let flow_grads = GradientsParams::from_module(&mut grads, &model.flow);
    let prior_grads = GradientsParams::from_module(&mut grads, &model.prior);
    let SemiSupervisedFlow { flow, prior } = model;
    let model = SemiSupervisedFlow {
        flow: optimizers.flow.step(learning_rate, flow, flow_grads),
        prior: optimizers.prior.step(learning_rate, prior, prior_grads),
    };
    Ok((model, output))
}

/// Runs one epoch over `batches`, recording `train/*` scalars and the
/// `data/x1`, `data/x2` previews of the first batch.
#[allow(clippy::too_many_arguments)]
pub fn train_epoch<B, OF, OP, M>(
    mut model: SemiSupervisedFlow<B>,
    optimizers: &mut FlowOptimizers<OF, OP>,
    batches: &[TrainBatch<B>],
    loss_fn: &FlowLoss,
    weights: LossWeights,
    learning_rate: f64,
    epoch: usize,
    sink: &mut M,
) -> Result<(SemiSupervisedFlow<B>, f64, f64), FlowError>
where
    B: AutodiffBackend,
    OF: Optimizer<Flow<B>, B>,
    OP: Optimizer<GaussianMixture<B>, B>,
    M: MetricSink,
{
    let mut loss_meter = AverageMeter::new();
    let mut unsup_meter = AverageMeter::new();
    let mut ce_meter = AverageMeter::new();
    let mut consistency_meter = AverageMeter::new();
    let mut jaclogdet_meter = AverageMeter::new();
    let mut acc_meter = AverageMeter::new();
    let mut unlabeled_batches = 0;

    for batch in batches {
        let (next, out) = train_step(model, optimizers, batch, loss_fn, weights, learning_rate)?;
        model = next;
        loss_meter.update(out.loss, out.batch_size);
        unsup_meter.update(out.loss_unsup, out.batch_size);
        ce_meter.update(out.loss_ce, out.batch_size);
        consistency_meter.update(out.loss_consistency, out.batch_size);
        jaclogdet_meter.update(out.jaclogdet, out.batch_size);
        match out.acc {
            Some(acc) => acc_meter.update(acc, out.labeled),
            None => unlabeled_batches += 1,
        }
    }
    if unlabeled_batches > 0 {
        log::warn!("Epoch {epoch}: {unlabeled_batches} batches had no labeled samples");
    }

    let dims = model.flow.latent_dim();
    let scalars = [
        ("train/loss", loss_meter.avg()),
        ("train/loss_unsup", unsup_meter.avg()),
        ("train/loss_nll", ce_meter.avg()),
        ("train/loss_consistency", consistency_meter.avg()),
        ("train/jaclogdet", jaclogdet_meter.avg()),
        ("train/acc", acc_meter.avg()),
        ("train/bpd", bits_per_dim(unsup_meter.avg(), dims)),
    ];
    for (name, value) in scalars {
        sink.record_scalar(name, value, epoch)?;
    }

    if let Some(batch) = batches.first() {
        let n = batch.batch_size().min(PREVIEW_IMAGES);
        for (name, x) in [("data/x1", &batch.x1), ("data/x2", &batch.x2)] {
            let grid = make_grid(x.clone().detach().narrow(0, 0, n), 2, 2, 1.0)?;
            sink.record_image(name, &grid, epoch)?;
        }
    }

    log::info!(
        "Epoch {epoch}: loss {:.4}, unsup {:.4}, ce {:.4}, consistency {:.4}, acc {:.4}",
        loss_meter.avg(),
        unsup_meter.avg(),
        ce_meter.avg(),
        consistency_meter.avg(),
        acc_meter.avg()
    );
    Ok((model, loss_meter.avg(), acc_meter.avg()))
}

/// Records the mixture means as images, when latents have image shape.
fn record_means<B: Backend, M: MetricSink>(
    model: &SemiSupervisedFlow<B>,
    sink: &mut M,
    epoch: usize,
) -> Result<(), FlowError> {
    let [c, h, w] = model.image_shape();
    if model.flow.latent_dim() != c * h * w {
        return Ok(());
    }
    let means: Vec<f64> = model.prior.means_host()?.into_iter().flatten().collect();
    let k = model.num_classes();
    let device = model.prior.means().device();
    let images = host::from_host::<B, 4>(&means, [k, c, h, w], &device);
    sink.record_image("means", &make_grid(images, 5, 2, 1.0)?, epoch)
}

/// Evaluation at the end of an epoch: held-out metrics, means and
/// class-conditional samples. The combined sample grid is also written to
/// `{ckptdir}/samples/epoch_{epoch}`.
fn evaluate_epoch<B, M>(
    model: &SemiSupervisedFlow<B>,
    eval_batches: &[EvalBatch<B>],
    config: &TrainingConfig,
    loss_fn: &FlowLoss,
    epoch: usize,
    sink: &mut M,
) -> Result<EvalMetrics, FlowError>
where
    B: AutodiffBackend,
    M: MetricSink,
{
    let inner = model.valid();
    let batches: Vec<EvalBatch<B::InnerBackend>> = eval_batches
        .iter()
        .map(|b| EvalBatch {
            images: b.images.clone().inner(),
            labels: b.labels.clone(),
        })
        .collect();
    let metrics = evaluate(&inner, &batches, loss_fn)?;
    sink.record_scalar("test/acc", metrics.acc, epoch)?;
    sink.record_scalar("test/loss", metrics.loss, epoch)?;
    sink.record_scalar("test/bpd", metrics.bpd, epoch)?;

    record_means(&inner, sink, epoch)?;

    let device = inner.prior.means().device();
    let per_class = (config.num_samples / inner.num_classes()).max(1);
    let mut all = Vec::with_capacity(inner.num_classes());
    for class in 0..inner.num_classes() {
        let samples = inner.sample(per_class, class, &device)?;
        let grid = make_grid(samples.clone(), 2, 2, 1.0)?;
        sink.record_image(&format!("samples/class_{class}"), &grid, epoch)?;
        all.push(samples);
    }
    let combined = make_grid(Tensor::cat(all, 0), per_class, 2, 1.0)?;
    let dir = config.ckptdir.join("samples");
    fs::create_dir_all(&dir)?;
    combined.save(&dir.join(format!("epoch_{epoch}.png")))?;

    Ok(metrics)
}

#[allow(clippy::too_many_arguments)]
fn run<B, OF, OP, S, M>(
    mut model: SemiSupervisedFlow<B>,
    mut optimizers: FlowOptimizers<OF, OP>,
    config: &TrainingConfig,
    start_epoch: usize,
    source: &mut S,
    sink: &mut M,
    device: &B::Device,
) -> Result<TrainingResult<B>, FlowError>
where
    B: AutodiffBackend,
    OF: Optimizer<Flow<B>, B>,
    OP: Optimizer<GaussianMixture<B>, B>,
    S: DataSource<B>,
    M: MetricSink,
{
    let loss_fn = FlowLoss::new(config.k);
    let eval_batches = source.eval_batches(device)?;
    let mut history = Vec::with_capacity(config.epochs.saturating_sub(start_epoch));

    for epoch in start_epoch..config.epochs {
        let learning_rate = config
            .schedule
            .learning_rate(config.learning_rate, epoch, config.epochs);
        let consistency_weight = linear_rampup(
            config.consistency_weight,
            epoch,
            config.consistency_rampup,
            start_epoch,
        );
        sink.record_scalar("hypers/learning_rate", learning_rate, epoch)?;
        sink.record_scalar("hypers/consistency_weight", consistency_weight, epoch)?;

        let batches = source.train_batches(epoch, device)?;
        let weights = LossWeights::from_config(config, consistency_weight);
        let (next, loss, acc) = train_epoch(
            model,
            &mut optimizers,
            &batches,
            &loss_fn,
            weights,
            learning_rate,
            epoch,
            sink,
        )?;
        model = next;

        if epoch % config.save_freq == 0 {
            save_checkpoint(&config.ckptdir, epoch, &model)?;
        }

        let eval = if epoch % config.eval_freq == 0 && !eval_batches.is_empty() {
            Some(evaluate_epoch(&model, &eval_batches, config, &loss_fn, epoch, sink)?)
        } else {
            None
        };

        history.push(EpochSummary {
            epoch,
            learning_rate,
            consistency_weight,
            loss,
            acc,
            eval,
        });
    }

    Ok(TrainingResult {
        model,
        start_epoch,
        history,
    })
}

/// Trains a semi-supervised flow on `source` as configured.
///
/// Writes `config.json` and checkpoints to `config.ckptdir`; resumes from
/// `config.resume` at the epoch after the saved one. A source that reports
/// its batch size must match `config.batch_size`.
pub fn fit<B, S, M>(
    config: &TrainingConfig,
    source: &mut S,
    sink: &mut M,
    device: &B::Device,
) -> Result<TrainingResult<B>, FlowError>
where
    B: AutodiffBackend,
    S: DataSource<B>,
    M: MetricSink,
{
    config.validate()?;
    if source.num_classes() != config.num_classes {
        return Err(FlowError::InvalidConfig {
            message: format!(
                "data has {} classes but the model is configured for {}",
                source.num_classes(),
                config.num_classes
            ),
        });
    }
    if let Some(batch_size) = source.batch_size().filter(|&b| b != config.batch_size) {
        return Err(FlowError::InvalidConfig {
            message: format!(
                "data is batched by {batch_size} but the config asks for {}",
                config.batch_size
            ),
        });
    }
    fs::create_dir_all(&config.ckptdir)?;
    config.save(&config.ckptdir.join("config.json"))?;

    let model = config
        .model_config(source.image_shape())
        .init::<B>(&source.labeled_samples(), device)?;
    let (model, start_epoch) = match &config.resume {
        Some(path) => {
            let (model, epoch) = load_checkpoint(path, model, device)?;
            (model, epoch + 1)
        }
        None => (model, 0),
    };
    log::info!(
        "Training {} on {} for epochs {start_epoch}..{} with {:?}",
        config.flow,
        config.dataset,
        config.epochs,
        config.optimizer
    );

    match config.optimizer {
        OptimizerKind::Adam => {
            let optimizers = adam_optimizers::<B>(config);
            run(model, optimizers, config, start_epoch, source, sink, device)
        }
        OptimizerKind::Sgd => {
            let optimizers = sgd_optimizers::<B>(config);
            run(model, optimizers, config, start_epoch, source, sink, device)
        }
    }
}

/// [`fit`] with metrics written by a [`JsonLinesSink`] in `config.logdir`.
pub fn train<B, S>(
    config: &TrainingConfig,
    source: &mut S,
    device: &B::Device,
) -> Result<TrainingResult<B>, FlowError>
where
    B: AutodiffBackend,
    S: DataSource<B>,
{
    let mut sink = JsonLinesSink::new(&config.logdir)?;
    fit(config, source, &mut sink, device)
}
