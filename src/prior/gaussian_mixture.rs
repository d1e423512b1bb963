//! Gaussian mixture over the flattened latent space.

use std::f64::consts::PI;

use burn::{
    module::{Ignored, Module, Param},
    tensor::{Distribution, Int, Tensor, activation::softmax, backend::Backend},
};

use crate::data::{NO_LABEL, check_labels};
use crate::errors::FlowError;
use crate::layers::host;

/// Equally weighted mixture of isotropic Gaussians, one per class.
///
/// Component `k` is `N(means[k], stds[k]^2 I)`. Means may be trainable; the
/// standard deviations are fixed.
#[derive(Module, Debug)]
pub struct GaussianMixture<B: Backend> {
    means: Param<Tensor<B, 2>>,
    stds: Ignored<Vec<f64>>,
    trainable: Ignored<bool>,
}

/// Smallest Euclidean distance between two rows.
fn min_pairwise_distance(means: &[Vec<f64>]) -> f64 {
    let mut min = f64::INFINITY;
    for (i, a) in means.iter().enumerate() {
        for b in &means[i + 1..] {
            let d = a
                .iter()
                .zip(b.iter())
                .map(|(x, y)| (x - y).powi(2))
                .sum::<f64>()
                .sqrt();
            min = min.min(d);
        }
    }
    min
}

fn validate(means: &[Vec<f64>], stds: &[f64]) -> Result<(), FlowError> {
    let degenerate = |message: String| Err(FlowError::DegeneratePrior { message });
    if means.is_empty() {
        return degenerate("mixture needs at least one component".to_string());
    }
    let dim = means[0].len();
    if dim == 0 || means.iter().any(|m| m.len() != dim) {
        return degenerate(format!("means must share a non-zero dimension, first has {dim}"));
    }
    if means.iter().flatten().any(|v| !v.is_finite()) {
        return degenerate("means contain non-finite values".to_string());
    }
    if stds.len() != means.len() {
        return degenerate(format!(
            "{} standard deviations for {} components",
            stds.len(),
            means.len()
        ));
    }
    if let Some(std) = stds.iter().find(|s| !(s.is_finite() && **s > 0.0)) {
        return degenerate(format!("standard deviation must be positive, got {std}"));
    }
    let min_distance = min_pairwise_distance(means);
    if min_distance <= 0.0 {
        return degenerate("two components share the same mean".to_string());
    }
    Ok(())
}

impl<B: Backend> GaussianMixture<B> {
    /// Creates a mixture from `K` mean rows sharing one standard deviation.
    pub fn new(
        means: &[Vec<f64>],
        cov_std: f64,
        trainable: bool,
        device: &B::Device,
    ) -> Result<Self, FlowError> {
        Self::with_stds(means, vec![cov_std; means.len()], trainable, device)
    }

    /// Creates a mixture with a separate standard deviation per component.
    pub fn with_stds(
        means: &[Vec<f64>],
        stds: Vec<f64>,
        trainable: bool,
        device: &B::Device,
    ) -> Result<Self, FlowError> {
        validate(means, &stds)?;
        log::info!(
            "Mixture prior: {} components in {} dims, min pairwise mean distance {:.4}",
            means.len(),
            means[0].len(),
            min_pairwise_distance(means)
        );
        let flat: Vec<f64> = means.iter().flatten().copied().collect();
        let tensor = host::from_host(&flat, [means.len(), means[0].len()], device);
        Ok(Self {
            means: Param::from_tensor(tensor),
            stds: Ignored(stds),
            trainable: Ignored(trainable),
        })
    }

    pub fn num_components(&self) -> usize {
        self.stds.len()
    }

    pub fn dim(&self) -> usize {
        self.means.val().dims()[1]
    }

    pub fn is_trainable(&self) -> bool {
        *self.trainable
    }

    pub fn stds(&self) -> &[f64] {
        &self.stds
    }

    /// Means as used in the density; detached unless the means are trainable.
    pub fn means(&self) -> Tensor<B, 2> {
        if *self.trainable {
            self.means.val()
        } else {
            self.means.val().detach()
        }
    }

    pub fn means_host(&self) -> Result<Vec<Vec<f64>>, FlowError> {
        let dim = self.dim();
        let flat = host::to_host(self.means.val())?;
        Ok(flat.chunks(dim).map(<[f64]>::to_vec).collect())
    }

    /// Replaces the means, e.g. with the ones stored in a checkpoint.
    pub fn set_means(&mut self, means: &[Vec<f64>]) -> Result<(), FlowError> {
        if means.len() != self.num_components() || means.first().map(Vec::len) != Some(self.dim()) {
            return Err(FlowError::DegeneratePrior {
                message: format!(
                    "expected {} means of dimension {}",
                    self.num_components(),
                    self.dim()
                ),
            });
        }
        validate(means, &self.stds)?;
        let device = self.means.val().device();
        let flat: Vec<f64> = means.iter().flatten().copied().collect();
        let tensor = host::from_host(&flat, [means.len(), self.dim()], &device);
        self.means = Param::from_tensor(tensor);
        Ok(())
    }

    fn check_dim(&self, z: &Tensor<B, 2>) -> Result<(), FlowError> {
        let [_, dim] = z.dims();
        if dim != self.dim() {
            return Err(FlowError::shape(format!(
                "prior expects {} latent dims, got {dim}",
                self.dim()
            )));
        }
        Ok(())
    }

    /// Per-component log-densities `[N, K]`, used as class logits.
    pub fn class_logits(&self, z: Tensor<B, 2>) -> Result<Tensor<B, 2>, FlowError> {
        self.check_dim(&z)?;
        let [n, dim] = z.dims();
        let k = self.num_components();
        let device = z.device();
        let means = self.means();

        // |z - m|^2 = |z|^2 - 2 z.m + |m|^2
        let z_sq = z.clone().powf_scalar(2.0).sum_dim(1);
        let cross = z.matmul(means.clone().transpose());
        let m_sq = means.powf_scalar(2.0).sum_dim(1).reshape([1, k]);
        let sq_dist = z_sq.expand([n, k]) - cross.mul_scalar(2.0) + m_sq.expand([n, k]);

        let d = dim as f64;
        let inv_var: Vec<f64> = self.stds.iter().map(|s| -0.5 / (s * s)).collect();
        let offset: Vec<f64> = self
            .stds
            .iter()
            .map(|s| -d * s.ln() - 0.5 * d * (2.0 * PI).ln())
            .collect();
        let inv_var = host::from_host::<B, 2>(&inv_var, [1, k], &device);
        let offset = host::from_host::<B, 2>(&offset, [1, k], &device);

        Ok(sq_dist * inv_var.expand([n, k]) + offset.expand([n, k]))
    }

    /// Mixture log-density per item, `logsumexp_k(logits) - ln K`.
    fn mixture_log_prob(&self, logits: Tensor<B, 2>) -> Tensor<B, 1> {
        let [n, k] = logits.dims();
        let max = logits.clone().max_dim(1).detach();
        let lse = (logits - max.clone().expand([n, k]))
            .exp()
            .sum_dim(1)
            .log()
            + max;
        lse.reshape([n]).sub_scalar((k as f64).ln())
    }

    /// Log-density of each latent row.
    ///
    /// Without labels this is the mixture density. With labels, rows with a
    /// class use that component's density and rows marked [`NO_LABEL`] fall
    /// back to the mixture.
    pub fn log_prob(
        &self,
        z: Tensor<B, 2>,
        labels: Option<&[i64]>,
    ) -> Result<Tensor<B, 1>, FlowError> {
        let [n, _] = z.dims();
        let device = z.device();
        let logits = self.class_logits(z)?;
        let mixture = self.mixture_log_prob(logits.clone());

        let Some(labels) = labels else {
            return Ok(mixture);
        };
        if labels.len() != n {
            return Err(FlowError::shape(format!(
                "{} labels for {n} latent rows",
                labels.len()
            )));
        }
        check_labels(labels, self.num_components())?;

        let mask: Vec<f64> = labels
            .iter()
            .map(|&l| if l == NO_LABEL { 0.0 } else { 1.0 })
            .collect();
        let indices: Vec<usize> = labels.iter().map(|&l| l.max(0) as usize).collect();
        let mask = host::from_host::<B, 1>(&mask, [n], &device);
        let indices = host::indices_to_device::<B>(&indices, &device).reshape([n, 1]);

        let picked = logits.gather(1, indices).reshape([n]);
        Ok(picked * mask.clone() + mixture * mask.neg().add_scalar(1.0))
    }

    /// Most likely component per row.
    pub fn classify(&self, z: Tensor<B, 2>) -> Result<Tensor<B, 1, Int>, FlowError> {
        let [n, _] = z.dims();
        Ok(self.class_logits(z)?.argmax(1).reshape([n]))
    }

    /// Component posterior `p(k | z)` per row.
    pub fn posterior(&self, z: Tensor<B, 2>) -> Result<Tensor<B, 2>, FlowError> {
        Ok(softmax(self.class_logits(z)?, 1))
    }

    /// Draws `n` latents from component `class`.
    pub fn sample(
        &self,
        n: usize,
        class: usize,
        device: &B::Device,
    ) -> Result<Tensor<B, 2>, FlowError> {
        let k = self.num_components();
        if class >= k {
            return Err(FlowError::shape(format!("class {class} outside [0, {k})")));
        }
        let dim = self.dim();
        let mean = self.means().narrow(0, class, 1).expand([n, dim]);
        let noise = Tensor::<B, 2>::random([n, dim], Distribution::Normal(0.0, 1.0), device);
        Ok(mean + noise.mul_scalar(self.stds[class]))
    }
}
