//! Loss functions for semi-supervised flow training.

use std::f64::consts::LN_2;

use burn::{
    nn::loss::CrossEntropyLossConfig,
    tensor::{Tensor, backend::Backend},
};

use crate::data::{check_labels, label_from_raw};
use crate::errors::FlowError;
use crate::layers::host;
use crate::prior::GaussianMixture;

/// Negative log-likelihood of a flow under a mixture prior, with the
/// dequantization correction for data with `k` discrete levels.
///
/// `nll = -mean(log p(z) - ln(k) * D + log|det dz/dx|)`
#[derive(Debug, Clone, Copy)]
pub struct FlowLoss {
    pub k: f64,
}

impl Default for FlowLoss {
    fn default() -> Self {
        Self { k: 256.0 }
    }
}

impl FlowLoss {
    pub fn new(k: f64) -> Self {
        Self { k }
    }

    /// Mean NLL from per-item prior log-densities and flow log-determinants.
    pub fn from_log_prob<B: Backend>(
        &self,
        prior_ll: Tensor<B, 1>,
        logdet: Tensor<B, 1>,
        dims: usize,
    ) -> Tensor<B, 1> {
        let correction = self.k.ln() * dims as f64;
        (prior_ll.sub_scalar(correction) + logdet).mean().neg()
    }

    /// NLL of latents `z` (`[N, D]`), optionally scored against the class
    /// components given by `labels`.
    pub fn compute<B: Backend>(
        &self,
        prior: &GaussianMixture<B>,
        z: Tensor<B, 2>,
        logdet: Tensor<B, 1>,
        labels: Option<&[i64]>,
    ) -> Result<Tensor<B, 1>, FlowError> {
        let dims = z.dims()[1];
        let prior_ll = prior.log_prob(z, labels)?;
        Ok(self.from_log_prob(prior_ll, logdet, dims))
    }
}

/// Converts a per-item NLL in nats to bits per dimension.
pub fn bits_per_dim(nll: f64, dims: usize) -> f64 {
    nll / (LN_2 * dims as f64)
}

/// Cross-entropy of class logits `[N, K]` over the labeled rows only.
///
/// Returns the loss and the labeled rows' logits, or a zero loss and `None`
/// when no row is labeled.
pub fn labeled_cross_entropy<B: Backend>(
    logits: Tensor<B, 2>,
    labels: &[i64],
) -> Result<(Tensor<B, 1>, Option<Tensor<B, 2>>), FlowError> {
    let [n, k] = logits.dims();
    if labels.len() != n {
        return Err(FlowError::shape(format!(
            "{} labels for {n} logit rows",
            labels.len()
        )));
    }
    check_labels(labels, k)?;
    let device = logits.device();
    let (rows, classes): (Vec<usize>, Vec<usize>) = labels
        .iter()
        .enumerate()
        .filter_map(|(i, l)| label_from_raw(*l).map(|c| (i, c)))
        .unzip();
    if rows.is_empty() {
        return Ok((Tensor::zeros([1], &device), None));
    }

    let selected = logits.select(0, host::indices_to_device::<B>(&rows, &device));
    let targets = host::indices_to_device::<B>(&classes, &device);
    let loss = CrossEntropyLossConfig::new()
        .init(&device)
        .forward(selected.clone(), targets);
    Ok((loss, Some(selected)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::NO_LABEL;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    fn device() -> <TestBackend as Backend>::Device {
        <TestBackend as Backend>::Device::default()
    }

    #[test]
    fn test_flow_loss_formula() {
        let loss = FlowLoss::new(256.0);
        let prior_ll = Tensor::<TestBackend, 1>::from_floats([-10.0, -12.0], &device());
        let logdet = Tensor::<TestBackend, 1>::from_floats([1.0, 3.0], &device());
        let nll = host::scalar(loss.from_log_prob(prior_ll, logdet, 4)).unwrap();

        let expected = -((-10.0 + 1.0 + -12.0 + 3.0) / 2.0 - 256f64.ln() * 4.0);
        assert!((nll - expected).abs() < 1e-3, "nll {nll} vs {expected}");
    }

    #[test]
    fn test_bits_per_dim() {
        assert!((bits_per_dim(LN_2 * 12.0, 12) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_cross_entropy_without_labels_is_zero() {
        let logits = Tensor::<TestBackend, 2>::from_floats([[1.0, 2.0], [0.5, -1.0]], &device());
        let (loss, selected) = labeled_cross_entropy(logits, &[NO_LABEL, NO_LABEL]).unwrap();
        assert_eq!(host::scalar(loss).unwrap(), 0.0);
        assert!(selected.is_none());
    }

    #[test]
    fn test_cross_entropy_rejects_negative_labels_other_than_unlabeled() {
        let logits = Tensor::<TestBackend, 2>::from_floats([[1.0, 2.0], [0.5, -1.0]], &device());
        let result = labeled_cross_entropy(logits, &[0, -2]);
        assert!(matches!(result, Err(FlowError::InvalidLabel { label: -2, .. })));
    }

    #[test]
    fn test_cross_entropy_uses_labeled_rows_only() {
        let logits = Tensor::<TestBackend, 2>::from_floats(
            [[2.0, 0.0], [100.0, -100.0], [0.0, 1.0]],
            &device(),
        );
        let (loss, selected) = labeled_cross_entropy(logits, &[0, NO_LABEL, 1]).unwrap();
        assert_eq!(selected.unwrap().dims(), [2, 2]);

        let row = |a: f64, b: f64| -(a - (a.exp() + b.exp()).ln());
        let expected = (row(2.0, 0.0) + row(1.0, 0.0)) / 2.0;
        assert!((host::scalar(loss).unwrap() - expected).abs() < 1e-5);
    }
}
