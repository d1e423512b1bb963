//! The semi-supervised flow model: an invertible network plus a mixture prior.

use burn::{
    module::Module,
    tensor::{Int, Tensor, backend::Backend},
};

use crate::errors::FlowError;
use crate::flow::{Flow, FlowArchitecture};
use crate::prior::{GaussianMixture, MeansInit};

/// Configuration for a [`SemiSupervisedFlow`].
#[derive(Debug, Clone)]
pub struct SemiSupervisedFlowConfig {
    pub architecture: FlowArchitecture,
    /// Image shape `[C, H, W]`.
    pub image_shape: [usize; 3],
    pub num_classes: usize,
    pub means: MeansInit,
    /// Radius applied by the means policy.
    pub means_r: f64,
    pub cov_std: f64,
    pub trainable_means: bool,
    pub seed: u64,
}

impl SemiSupervisedFlowConfig {
    pub fn new(architecture: FlowArchitecture, image_shape: [usize; 3], num_classes: usize) -> Self {
        Self {
            architecture,
            image_shape,
            num_classes,
            means: MeansInit::Random,
            means_r: 1.0,
            cov_std: 1.0,
            trainable_means: false,
            seed: 0,
        }
    }

    pub fn with_means(mut self, means: MeansInit, r: f64) -> Self {
        self.means = means;
        self.means_r = r;
        self
    }

    pub fn with_cov_std(mut self, cov_std: f64) -> Self {
        self.cov_std = cov_std;
        self
    }

    pub fn with_trainable_means(mut self, trainable: bool) -> Self {
        self.trainable_means = trainable;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Builds the flow and places the means. `labeled` feeds
    /// [`MeansInit::FromData`] and is ignored by the other policies.
    pub fn init<B: Backend>(
        &self,
        labeled: &[(Vec<f64>, usize)],
        device: &B::Device,
    ) -> Result<SemiSupervisedFlow<B>, FlowError> {
        let flow = self.architecture.build(self.image_shape, self.seed, device)?;
        let means = self.means.generate(
            self.num_classes,
            flow.latent_dim(),
            self.means_r,
            self.seed,
            labeled,
        )?;
        let prior = GaussianMixture::new(&means, self.cov_std, self.trainable_means, device)?;
        SemiSupervisedFlow::new(flow, prior)
    }
}

/// Latents of a batch with the flow's log-determinant.
#[derive(Debug, Clone)]
pub struct Encoded<B: Backend> {
    /// Flattened latents `[N, D]`.
    pub z: Tensor<B, 2>,
    /// `log|det dz/dx|` per item.
    pub logdet: Tensor<B, 1>,
}

/// A flow whose latent density is a class-conditional Gaussian mixture, so
/// the same model scores likelihoods and classifies.
#[derive(Module, Debug)]
pub struct SemiSupervisedFlow<B: Backend> {
    pub flow: Flow<B>,
    pub prior: GaussianMixture<B>,
}

impl<B: Backend> SemiSupervisedFlow<B> {
    pub fn new(flow: Flow<B>, prior: GaussianMixture<B>) -> Result<Self, FlowError> {
        if prior.dim() != flow.latent_dim() {
            return Err(FlowError::shape(format!(
                "prior has {} dims but the flow produces {}",
                prior.dim(),
                flow.latent_dim()
            )));
        }
        Ok(Self { flow, prior })
    }

    pub fn num_classes(&self) -> usize {
        self.prior.num_components()
    }

    pub fn image_shape(&self) -> [usize; 3] {
        self.flow.input_shape()
    }

    /// Maps images to flattened latents and the flow log-determinant.
    pub fn encode(&self, x: Tensor<B, 4>) -> Result<Encoded<B>, FlowError> {
        let batch = x.dims()[0];
        let (z, ctx) = self.flow.forward(x)?;
        let logdet = self.flow.logdet(&ctx)?;
        Ok(Encoded {
            z: z.reshape([batch, self.flow.latent_dim()]),
            logdet,
        })
    }

    /// Predicted class per image.
    pub fn classify(&self, x: Tensor<B, 4>) -> Result<Tensor<B, 1, Int>, FlowError> {
        let batch = x.dims()[0];
        let (z, _) = self.flow.forward(x)?;
        self.prior.classify(z.reshape([batch, self.flow.latent_dim()]))
    }

    /// Maps flattened latents back to images.
    pub fn decode(&self, z: Tensor<B, 2>) -> Result<Tensor<B, 4>, FlowError> {
        let [batch, dim] = z.dims();
        if dim != self.flow.latent_dim() {
            return Err(FlowError::shape(format!(
                "decode expects {} latent dims, got {dim}",
                self.flow.latent_dim()
            )));
        }
        let [c, h, w] = self.flow.latent_shape();
        let ctx = self.flow.trace(batch, &z.device())?;
        self.flow.inverse(z.reshape([batch, c, h, w]), &ctx)
    }

    /// Draws `n` images of class `class`.
    pub fn sample(
        &self,
        n: usize,
        class: usize,
        device: &B::Device,
    ) -> Result<Tensor<B, 4>, FlowError> {
        let z = self.prior.sample(n, class, device)?;
        self.decode(z)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::host;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray;

    fn device() -> <TestBackend as Backend>::Device {
        <TestBackend as Backend>::Device::default()
    }

    fn toy_model() -> SemiSupervisedFlow<TestBackend> {
        SemiSupervisedFlowConfig::new(FlowArchitecture::ToyFlow, [2, 4, 4], 3)
            .with_means(MeansInit::SplitDims, 2.0)
            .with_seed(4)
            .init(&[], &device())
            .unwrap()
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let model = toy_model();
        let x = Tensor::<TestBackend, 4>::random([3, 2, 4, 4], Distribution::Uniform(0.0, 1.0), &device());
        let encoded = model.encode(x.clone()).unwrap();
        assert_eq!(encoded.z.dims(), [3, 32]);
        assert_eq!(encoded.logdet.dims(), [3]);

        let decoded = model.decode(encoded.z).unwrap();
        let diff = host::to_host(decoded - x)
            .unwrap()
            .into_iter()
            .fold(0.0f64, |m, v| m.max(v.abs()));
        assert!(diff < 1e-4);
    }

    #[test]
    fn test_sample_and_classify_shapes() {
        let model = toy_model();
        let samples = model.sample(5, 2, &device()).unwrap();
        assert_eq!(samples.dims(), [5, 2, 4, 4]);

        let classes = host::to_host_indices(model.classify(samples).unwrap()).unwrap();
        assert_eq!(classes.len(), 5);
        assert!(classes.iter().all(|c| *c < 3));
    }

    #[test]
    fn test_prior_dimension_must_match_flow() {
        let flow = FlowArchitecture::ToyFlow
            .build::<TestBackend>([1, 4, 4], 0, &device())
            .unwrap();
        let prior = GaussianMixture::new(&[vec![0.0; 3], vec![1.0; 3]], 1.0, false, &device()).unwrap();
        assert!(matches!(
            SemiSupervisedFlow::new(flow, prior),
            Err(FlowError::InvalidShape { .. })
        ));
    }
}
