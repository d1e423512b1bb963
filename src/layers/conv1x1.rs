//! Invertible 1×1 convolution: a learned channel-mixing matrix.

use burn::{
    module::{Module, Param},
    tensor::{Tensor, backend::Backend, module::conv2d, ops::ConvOptions},
};
use nalgebra::DMatrix;
use rand::{SeedableRng, rngs::StdRng};
use rand_distr::{Distribution, StandardNormal};

use super::spectral::{check_conditioning, row_major};
use super::{InvertibleLayer, LayerContext, host, record, with_gradient};
use crate::errors::FlowError;

const NAME: &str = "conv1x1";

/// Configuration for an [`InvConv1x1`] layer.
#[derive(Debug, Clone)]
pub struct InvConv1x1Config {
    /// Number of channels mixed by the layer.
    pub channels: usize,
    /// Seed for the random orthogonal initialisation.
    pub seed: u64,
}

impl InvConv1x1Config {
    /// Creates a new InvConv1x1Config.
    pub fn new(channels: usize) -> Self {
        Self { channels, seed: 0 }
    }

    /// Sets the initialisation seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Initializes the layer with a random orthogonal weight and zero bias.
    pub fn init<B: Backend>(&self, device: &B::Device) -> InvConv1x1<B> {
        let c = self.channels;
        let mut rng = StdRng::seed_from_u64(self.seed);
        let gaussian = DMatrix::<f64>::from_fn(c, c, |_, _| StandardNormal.sample(&mut rng));
        let q = gaussian.qr().q();

        InvConv1x1 {
            weight: Param::from_tensor(host::from_host(&row_major(&q), [c, c], device)),
            bias: Param::from_tensor(Tensor::zeros([c], device)),
            channels: c,
        }
    }
}

/// Per-pixel linear map `y = W x + b` over channels.
///
/// The inverse and log-determinant are computed in double precision on the
/// host; a singular or badly conditioned `W` is reported as
/// [`FlowError::NonInvertible`].
#[derive(Module, Debug)]
pub struct InvConv1x1<B: Backend> {
    weight: Param<Tensor<B, 2>>,
    bias: Param<Tensor<B, 1>>,
    channels: usize,
}

impl<B: Backend> InvConv1x1<B> {
    /// Builds a layer from explicit parameters (`weight` is `[C, C]`).
    pub fn from_weights(weight: Tensor<B, 2>, bias: Tensor<B, 1>) -> Result<Self, FlowError> {
        let [rows, cols] = weight.dims();
        let [bias_len] = bias.dims();
        if rows != cols || bias_len != rows {
            return Err(FlowError::InvalidLayerConfig {
                message: format!(
                    "conv1x1 needs a square weight and matching bias, got [{rows}, {cols}] and [{bias_len}]"
                ),
            });
        }
        Ok(Self {
            weight: Param::from_tensor(weight),
            bias: Param::from_tensor(bias),
            channels: rows,
        })
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Current weight as a `[C, C]` tensor.
    pub fn weight(&self) -> Tensor<B, 2> {
        self.weight.val()
    }

    fn weight_matrix(&self) -> Result<DMatrix<f64>, FlowError> {
        let values = host::to_host(self.weight.val())?;
        Ok(DMatrix::from_row_slice(self.channels, self.channels, &values))
    }

    fn check_channels(&self, dims: [usize; 4]) -> Result<(), FlowError> {
        if dims[1] != self.channels {
            return Err(FlowError::shape(format!(
                "conv1x1 expects {} channels, got {:?}",
                self.channels, dims
            )));
        }
        Ok(())
    }
}

impl<B: Backend> InvertibleLayer<B> for InvConv1x1<B> {
    fn name(&self) -> &'static str {
        NAME
    }

    fn output_dims(&self, input: [usize; 4]) -> Result<[usize; 4], FlowError> {
        self.check_channels(input)?;
        Ok(input)
    }

    fn forward(&self, x: Tensor<B, 4>) -> Result<(Tensor<B, 4>, LayerContext<B>), FlowError> {
        let dims = x.dims();
        self.check_channels(dims)?;
        let c = self.channels;
        let y = conv2d(
            x,
            self.weight.val().reshape([c, c, 1, 1]),
            Some(self.bias.val()),
            ConvOptions::new([1, 1], [0, 0], [1, 1], 1),
        );
        let ctx = record(NAME, dims, &y);
        Ok((y, ctx))
    }

    fn inverse(&self, y: Tensor<B, 4>, ctx: &LayerContext<B>) -> Result<Tensor<B, 4>, FlowError> {
        let dims = y.dims();
        ctx.expect_output(NAME, dims)?;
        let c = self.channels;

        let matrix = self.weight_matrix()?;
        check_conditioning(NAME, &matrix)?;
        let inverse = matrix
            .try_inverse()
            .ok_or_else(|| FlowError::non_invertible(NAME, "weight matrix is singular"))?;
        let inverse = host::from_host::<B, 4>(&row_major(&inverse), [c, c, 1, 1], &y.device());

        let bias = self.bias.val().reshape([1, c, 1, 1]).expand(dims);
        Ok(conv2d(
            y - bias,
            inverse,
            None,
            ConvOptions::new([1, 1], [0, 0], [1, 1], 1),
        ))
    }

    fn logdet(&self, ctx: &LayerContext<B>) -> Result<Tensor<B, 1>, FlowError> {
        ctx.expect_input_channels(NAME, self.channels)?;
        let [batch, _, height, width] = ctx.input_dims();
        let pixels = (height * width) as f64;

        let matrix = self.weight_matrix()?;
        check_conditioning(NAME, &matrix)?;
        let determinant = matrix.clone().lu().determinant();
        if determinant == 0.0 || !determinant.is_finite() {
            return Err(FlowError::non_invertible(
                NAME,
                format!("determinant is {determinant}"),
            ));
        }
        let inverse = matrix
            .try_inverse()
            .ok_or_else(|| FlowError::non_invertible(NAME, "weight matrix is singular"))?;

        // d log|det W| / dW = W^-T
        let grad: Vec<f64> = row_major(&inverse.transpose())
            .into_iter()
            .map(|g| g * pixels)
            .collect();
        let c = self.channels;
        let weight = self.weight.val();
        let grad = host::from_host::<B, 2>(&grad, [c, c], &weight.device());

        Ok(with_gradient(determinant.abs().ln() * pixels, weight, grad).expand([batch]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::testing::{assert_close, jacobian_logdet, max_abs_diff};
    use burn::backend::{Autodiff, NdArray};
    use burn::tensor::Distribution as TensorDistribution;

    type TestBackend = NdArray;

    fn device() -> <TestBackend as Backend>::Device {
        <TestBackend as Backend>::Device::default()
    }

    fn layer_with(values: &[f32], c: usize) -> InvConv1x1<TestBackend> {
        let device = device();
        let weight = Tensor::<TestBackend, 1>::from_floats(values, &device).reshape([c, c]);
        let bias_values = [0.5f32, -0.25, 1.0];
        let bias = Tensor::<TestBackend, 1>::from_floats(&bias_values[..c], &device);
        InvConv1x1::from_weights(weight, bias).unwrap()
    }

    #[test]
    fn test_orthogonal_init_has_zero_logdet() {
        let device = device();
        let layer: InvConv1x1<TestBackend> = InvConv1x1Config::new(4).with_seed(7).init(&device);
        let x = Tensor::<TestBackend, 4>::zeros([3, 4, 5, 5], &device);
        let (_, ctx) = layer.forward(x).unwrap();
        let logdet: Vec<f64> = host::to_host(layer.logdet(&ctx).unwrap()).unwrap();

        assert_eq!(logdet.len(), 3);
        for value in logdet {
            assert!(value.abs() < 1e-4, "orthogonal W should have |det| = 1, got {value}");
        }
    }

    #[test]
    fn test_roundtrip() {
        let device = device();
        let layer = layer_with(&[2.0, 0.5, 0.1, -0.3, 1.5, 0.2, 0.0, 0.4, 0.8], 3);
        let x = Tensor::<TestBackend, 4>::random(
            [2, 3, 4, 6],
            TensorDistribution::Normal(0.0, 1.0),
            &device,
        );
        let (y, ctx) = layer.forward(x.clone()).unwrap();
        let recovered = layer.inverse(y, &ctx).unwrap();

        assert!(max_abs_diff(x, recovered) < 1e-5);
    }

    #[test]
    fn test_logdet_matches_jacobian_determinant() {
        let layer = layer_with(&[2.0, 0.5, 0.1, -0.3, 1.5, 0.2, 0.0, 0.4, 0.8], 3);
        let device = device();
        let x = Tensor::<TestBackend, 4>::zeros([1, 3, 2, 3], &device);
        let (_, ctx) = layer.forward(x).unwrap();
        let analytic = host::scalar(layer.logdet(&ctx).unwrap()).unwrap();

        let direct = jacobian_logdet(&layer, [1, 3, 2, 3]);
        assert_close(analytic, direct, 1e-3);
    }

    #[test]
    fn test_singular_weight_is_reported() {
        let layer = layer_with(&[1.0, 2.0, 2.0, 4.0], 2);
        let device = device();
        let x = Tensor::<TestBackend, 4>::ones([1, 2, 3, 3], &device);
        let (y, ctx) = layer.forward(x).unwrap();

        assert!(matches!(
            layer.logdet(&ctx),
            Err(FlowError::NonInvertible { .. })
        ));
        assert!(matches!(
            layer.inverse(y, &ctx),
            Err(FlowError::NonInvertible { .. })
        ));
    }

    #[test]
    fn test_inverse_rejects_mismatched_context() {
        let device = device();
        let layer: InvConv1x1<TestBackend> = InvConv1x1Config::new(2).init(&device);
        let (_, ctx) = layer
            .forward(Tensor::zeros([1, 2, 4, 4], &device))
            .unwrap();
        let other = Tensor::<TestBackend, 4>::zeros([1, 2, 5, 5], &device);

        assert!(matches!(
            layer.inverse(other, &ctx),
            Err(FlowError::StaleContext { .. })
        ));
    }

    #[test]
    fn test_logdet_gradient_is_inverse_transpose() {
        type AdBackend = Autodiff<NdArray>;
        let device = <AdBackend as Backend>::Device::default();
        let weight = Tensor::<AdBackend, 1>::from_floats([2.0, 1.0, 0.5, 3.0], &device)
            .reshape([2, 2]);
        let layer = InvConv1x1::from_weights(weight, Tensor::zeros([2], &device)).unwrap();

        let (_, ctx) = layer
            .forward(Tensor::zeros([1, 2, 2, 2], &device))
            .unwrap();
        let grads = layer.logdet(&ctx).unwrap().sum().backward();
        let grad = layer.weight().grad(&grads).unwrap();
        let grad: Vec<f64> = host::to_host(grad).unwrap();

        // det = 5.5, W^-T = [[3, -0.5], [-1, 2]] / 5.5, scaled by H*W = 4
        let expected = [3.0, -0.5, -1.0, 2.0].map(|v| v / 5.5 * 4.0);
        for (g, e) in grad.iter().zip(expected.iter()) {
            assert_close(*g, *e, 1e-4);
        }
    }
}
