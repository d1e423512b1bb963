//! Held-out evaluation of a trained model.

use burn::tensor::backend::Backend;

use super::loss::{FlowLoss, bits_per_dim};
use super::metrics::AverageMeter;
use crate::data::{EvalBatch, check_labels, label_from_raw};
use crate::errors::FlowError;
use crate::layers::host;
use crate::model::SemiSupervisedFlow;

/// Averages over an evaluation pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalMetrics {
    /// Fraction of labeled items classified correctly.
    pub acc: f64,
    /// Class-conditional NLL per item, in nats.
    pub loss: f64,
    pub bpd: f64,
}

/// Fraction of labeled rows whose prediction matches, or `None` when no row
/// is labeled.
pub fn accuracy(predictions: &[usize], labels: &[i64]) -> Option<f64> {
    let (correct, total) = predictions
        .iter()
        .zip(labels)
        .filter_map(|(pred, raw)| label_from_raw(*raw).map(|label| label == *pred))
        .fold((0usize, 0usize), |(c, t), hit| (c + usize::from(hit), t + 1));
    (total > 0).then(|| correct as f64 / total as f64)
}

/// Scores `model` on `batches`: accuracy on labeled items and the NLL of
/// each item under its labeled component (mixture for unlabeled ones).
pub fn evaluate<B: Backend>(
    model: &SemiSupervisedFlow<B>,
    batches: &[EvalBatch<B>],
    loss_fn: &FlowLoss,
) -> Result<EvalMetrics, FlowError> {
    if batches.is_empty() {
        return Err(FlowError::InvalidConfig {
            message: "evaluation needs at least one batch".to_string(),
        });
    }

    let mut acc_meter = AverageMeter::new();
    let mut loss_meter = AverageMeter::new();
    for batch in batches {
        let n = batch.labels.len();
        check_labels(&batch.labels, model.num_classes())?;
        let encoded = model.encode(batch.images.clone())?;
        let predictions = host::to_host_indices(model.prior.classify(encoded.z.clone())?)?;
        if let Some(acc) = accuracy(&predictions, &batch.labels) {
            let labeled = batch.labels.iter().filter(|l| label_from_raw(**l).is_some()).count();
            acc_meter.update(acc, labeled);
        }

        let loss = loss_fn.compute(&model.prior, encoded.z, encoded.logdet, Some(&batch.labels))?;
        loss_meter.update(host::scalar(loss)?, n);
    }

    let dims = model.flow.latent_dim();
    let loss = loss_meter.avg();
    let metrics = EvalMetrics {
        acc: acc_meter.avg(),
        loss,
        bpd: bits_per_dim(loss, dims),
    };
    log::info!(
        "Eval: acc {:.4}, loss {:.4}, bpd {:.4}",
        metrics.acc,
        metrics.loss,
        metrics.bpd
    );
    Ok(metrics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{DataSource, NO_LABEL, SyntheticSourceConfig};
    use crate::flow::FlowArchitecture;
    use crate::model::SemiSupervisedFlowConfig;
    use crate::prior::MeansInit;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_accuracy_ignores_unlabeled_rows() {
        assert_eq!(accuracy(&[0, 1, 2, 2], &[0, NO_LABEL, 1, 2]), Some(2.0 / 3.0));
        assert_eq!(accuracy(&[0, 1], &[NO_LABEL, NO_LABEL]), None);
    }

    #[test]
    fn test_evaluate_reports_finite_metrics() {
        let device = <TestBackend as Backend>::Device::default();
        let source = SyntheticSourceConfig::new()
            .image_shape([1, 4, 4])
            .num_classes(2)
            .eval_samples_per_class(3)
            .init()
            .unwrap();
        let model = SemiSupervisedFlowConfig::new(FlowArchitecture::ToyFlow, [1, 4, 4], 2)
            .with_means(MeansInit::SplitDims, 2.0)
            .init::<TestBackend>(&[], &device)
            .unwrap();
        let batches = DataSource::<TestBackend>::eval_batches(&source, &device).unwrap();

        let metrics = evaluate(&model, &batches, &FlowLoss::default()).unwrap();
        assert!((0.0..=1.0).contains(&metrics.acc));
        assert!(metrics.loss.is_finite());
        assert!((metrics.bpd - bits_per_dim(metrics.loss, 16)).abs() < 1e-12);
    }

    #[test]
    fn test_evaluate_without_batches_fails() {
        let device = <TestBackend as Backend>::Device::default();
        let model = SemiSupervisedFlowConfig::new(FlowArchitecture::ToyFlow, [1, 4, 4], 2)
            .init::<TestBackend>(&[], &device)
            .unwrap();
        assert!(evaluate(&model, &[], &FlowLoss::default()).is_err());
    }
}
