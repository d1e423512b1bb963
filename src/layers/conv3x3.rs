//! Invertible 3×3 convolution with circular (wrap-around) padding.
//!
//! Wrap-around convolution is block-circulant, so the 2-D DFT turns it into
//! one `C×C` matrix per frequency bin. The log-determinant and the inverse
//! are computed bin by bin on the host (see `spectral`).

use burn::{
    module::{Module, Param},
    tensor::{Tensor, backend::Backend, module::conv2d, ops::ConvOptions},
};
use rand::{SeedableRng, rngs::StdRng};
use rand_distr::{Distribution, StandardNormal};

use super::spectral::KernelSpectrum;
use super::{InvertibleLayer, LayerContext, host, record, with_gradient};
use crate::errors::FlowError;

const NAME: &str = "conv3x3";
const KERNEL: usize = 3;

/// Configuration for an [`InvConv3x3`] layer.
#[derive(Debug, Clone)]
pub struct InvConv3x3Config {
    pub channels: usize,
    /// Standard deviation of the noise added around the identity kernel.
    pub init_std: f64,
    pub seed: u64,
}

impl InvConv3x3Config {
    /// Creates a new InvConv3x3Config.
    pub fn new(channels: usize) -> Self {
        Self {
            channels,
            init_std: 0.01,
            seed: 0,
        }
    }

    pub fn with_init_std(mut self, init_std: f64) -> Self {
        self.init_std = init_std;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Initializes the kernel as a noisy identity tap at the centre.
    pub fn init<B: Backend>(&self, device: &B::Device) -> InvConv3x3<B> {
        let c = self.channels;
        let mut rng = StdRng::seed_from_u64(self.seed);

        let mut kernel = vec![0.0; c * c * KERNEL * KERNEL];
        for o in 0..c {
            for i in 0..c {
                for tap in 0..KERNEL * KERNEL {
                    let index = (o * c + i) * KERNEL * KERNEL + tap;
                    let sample: f64 = StandardNormal.sample(&mut rng);
                    kernel[index] = sample * self.init_std;
                    if o == i && tap == KERNEL * KERNEL / 2 {
                        kernel[index] += 1.0;
                    }
                }
            }
        }

        InvConv3x3 {
            weight: Param::from_tensor(host::from_host(&kernel, [c, c, KERNEL, KERNEL], device)),
            bias: Param::from_tensor(Tensor::zeros([c], device)),
            channels: c,
        }
    }
}

/// 3×3 convolution over a torus, `y = K ⋆ pad_circular(x) + b`.
#[derive(Module, Debug)]
pub struct InvConv3x3<B: Backend> {
    weight: Param<Tensor<B, 4>>,
    bias: Param<Tensor<B, 1>>,
    channels: usize,
}

impl<B: Backend> InvConv3x3<B> {
    /// Builds a layer from an explicit `[C, C, 3, 3]` kernel and `[C]` bias.
    pub fn from_weights(weight: Tensor<B, 4>, bias: Tensor<B, 1>) -> Result<Self, FlowError> {
        let [out_c, in_c, kh, kw] = weight.dims();
        let [bias_len] = bias.dims();
        if out_c != in_c || kh != KERNEL || kw != KERNEL || bias_len != out_c {
            return Err(FlowError::InvalidLayerConfig {
                message: format!(
                    "conv3x3 needs a [C, C, 3, 3] kernel and [C] bias, got {:?} and [{bias_len}]",
                    [out_c, in_c, kh, kw]
                ),
            });
        }
        Ok(Self {
            weight: Param::from_tensor(weight),
            bias: Param::from_tensor(bias),
            channels: out_c,
        })
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Current kernel as a `[C, C, 3, 3]` tensor.
    pub fn weight(&self) -> Tensor<B, 4> {
        self.weight.val()
    }

    fn check_input(&self, dims: [usize; 4]) -> Result<(), FlowError> {
        if dims[1] != self.channels {
            return Err(FlowError::shape(format!(
                "conv3x3 expects {} channels, got {:?}",
                self.channels, dims
            )));
        }
        if dims[2] < KERNEL || dims[3] < KERNEL {
            return Err(FlowError::shape(format!(
                "conv3x3 needs at least 3x3 spatial size, got {:?}",
                dims
            )));
        }
        Ok(())
    }

    fn spectrum(&self, height: usize, width: usize) -> Result<KernelSpectrum, FlowError> {
        let kernel = host::to_host(self.weight.val())?;
        KernelSpectrum::new(&kernel, self.channels, [KERNEL, KERNEL], height, width)
    }
}

/// Pads the two spatial axes by one pixel, wrapping around.
fn circular_pad<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    let [_, _, h, w] = x.dims();
    let x = Tensor::cat(
        vec![x.clone().narrow(2, h - 1, 1), x.clone(), x.narrow(2, 0, 1)],
        2,
    );
    Tensor::cat(
        vec![x.clone().narrow(3, w - 1, 1), x.clone(), x.narrow(3, 0, 1)],
        3,
    )
}

impl<B: Backend> InvertibleLayer<B> for InvConv3x3<B> {
    fn name(&self) -> &'static str {
        NAME
    }

    fn output_dims(&self, input: [usize; 4]) -> Result<[usize; 4], FlowError> {
        self.check_input(input)?;
        Ok(input)
    }

    fn forward(&self, x: Tensor<B, 4>) -> Result<(Tensor<B, 4>, LayerContext<B>), FlowError> {
        let dims = x.dims();
        self.check_input(dims)?;
        let y = conv2d(
            circular_pad(x),
            self.weight.val(),
            Some(self.bias.val()),
            ConvOptions::new([1, 1], [0, 0], [1, 1], 1),
        );
        let ctx = record(NAME, dims, &y);
        Ok((y, ctx))
    }

    fn inverse(&self, y: Tensor<B, 4>, ctx: &LayerContext<B>) -> Result<Tensor<B, 4>, FlowError> {
        let dims = y.dims();
        ctx.expect_output(NAME, dims)?;
        let [batch, c, height, width] = dims;

        let spectrum = self.spectrum(height, width)?;
        let inverses = spectrum.inverses(NAME)?;

        let bias = self.bias.val().reshape([1, c, 1, 1]).expand(dims);
        let device = y.device();
        let centered = host::to_host(y - bias)?;

        let item = c * height * width;
        let mut restored = Vec::with_capacity(centered.len());
        for b in 0..batch {
            restored.extend(spectrum.solve_image(&centered[b * item..(b + 1) * item], &inverses));
        }
        Ok(host::from_host(&restored, dims, &device))
    }

    fn logdet(&self, ctx: &LayerContext<B>) -> Result<Tensor<B, 1>, FlowError> {
        ctx.expect_input_channels(NAME, self.channels)?;
        let [batch, _, height, width] = ctx.input_dims();

        let spectrum = self.spectrum(height, width)?;
        let value = spectrum.log_abs_det(NAME)?;
        let inverses = spectrum.inverses(NAME)?;
        let grad = spectrum.log_abs_det_gradient(&inverses);

        let weight = self.weight.val();
        let grad = host::from_host::<B, 4>(&grad, weight.dims(), &weight.device());
        Ok(with_gradient(value, weight, grad).expand([batch]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::testing::{assert_close, jacobian_logdet, max_abs_diff};
    use burn::backend::{Autodiff, NdArray};
    use burn::tensor::Distribution as TensorDistribution;
    use rstest::rstest;

    type TestBackend = NdArray;

    fn device() -> <TestBackend as Backend>::Device {
        <TestBackend as Backend>::Device::default()
    }

    fn noisy_layer(channels: usize) -> InvConv3x3<TestBackend> {
        let layer: InvConv3x3<TestBackend> = InvConv3x3Config::new(channels)
            .with_init_std(0.1)
            .with_seed(3)
            .init(&device());
        let bias = Tensor::<TestBackend, 1>::random(
            [channels],
            TensorDistribution::Normal(0.0, 1.0),
            &device(),
        );
        InvConv3x3::from_weights(layer.weight(), bias).unwrap()
    }

    #[rstest]
    #[case(3, 3)]
    #[case(4, 4)]
    #[case(5, 5)]
    #[case(8, 8)]
    #[case(5, 6)]
    #[case(4, 7)]
    fn test_roundtrip_over_spatial_sizes(#[case] height: usize, #[case] width: usize) {
        let layer = noisy_layer(2);
        let x = Tensor::<TestBackend, 4>::random(
            [2, 2, height, width],
            TensorDistribution::Normal(0.0, 1.0),
            &device(),
        );
        let (y, ctx) = layer.forward(x.clone()).unwrap();
        let recovered = layer.inverse(y, &ctx).unwrap();

        let diff = max_abs_diff(x, recovered);
        assert!(diff < 1e-4, "{height}x{width} roundtrip error {diff}");
    }

    #[test]
    fn test_circular_pad_wraps_edges() {
        let values: Vec<f64> = (0..9).map(f64::from).collect();
        let x = host::from_host::<TestBackend, 4>(&values, [1, 1, 3, 3], &device());
        let padded = host::to_host(circular_pad(x)).unwrap();

        assert_eq!(padded.len(), 25);
        assert_eq!(&padded[0..5], &[8.0, 6.0, 7.0, 8.0, 6.0]);
        assert_eq!(&padded[20..25], &[2.0, 0.0, 1.0, 2.0, 0.0]);
    }

    #[rstest]
    #[case(1, 3, 3)]
    #[case(2, 4, 4)]
    #[case(2, 3, 5)]
    fn test_logdet_matches_jacobian_determinant(
        #[case] channels: usize,
        #[case] height: usize,
        #[case] width: usize,
    ) {
        let layer = noisy_layer(channels);
        let dims = [1, channels, height, width];
        let (_, ctx) = layer.forward(Tensor::zeros(dims, &device())).unwrap();
        let analytic = host::scalar(layer.logdet(&ctx).unwrap()).unwrap();

        let direct = jacobian_logdet(&layer, dims);
        assert_close(analytic, direct, 1e-3);
    }

    #[test]
    fn test_logdet_broadcasts_over_batch() {
        let layer = noisy_layer(2);
        let (_, ctx) = layer.forward(Tensor::zeros([3, 2, 4, 4], &device())).unwrap();
        let logdet = host::to_host(layer.logdet(&ctx).unwrap()).unwrap();

        assert_eq!(logdet.len(), 3);
        assert!(logdet.iter().all(|v| (v - logdet[0]).abs() < 1e-9));
    }

    #[test]
    fn test_zero_kernel_is_reported() {
        let device = device();
        let layer = InvConv3x3::<TestBackend>::from_weights(
            Tensor::zeros([2, 2, 3, 3], &device),
            Tensor::zeros([2], &device),
        )
        .unwrap();
        let (y, ctx) = layer.forward(Tensor::ones([1, 2, 4, 4], &device)).unwrap();

        assert!(matches!(
            layer.inverse(y, &ctx),
            Err(FlowError::NonInvertible { .. })
        ));
        assert!(matches!(
            layer.logdet(&ctx),
            Err(FlowError::NonInvertible { .. })
        ));
    }

    #[test]
    fn test_too_small_input_is_rejected() {
        let layer = noisy_layer(1);
        let x = Tensor::<TestBackend, 4>::zeros([1, 1, 2, 5], &device());
        assert!(matches!(
            layer.forward(x),
            Err(FlowError::InvalidShape { .. })
        ));
    }

    #[test]
    fn test_logdet_gradient_matches_finite_difference() {
        type AdBackend = Autodiff<NdArray>;
        let base: InvConv3x3<TestBackend> = InvConv3x3Config::new(2)
            .with_init_std(0.2)
            .with_seed(11)
            .init(&device());
        let device = <AdBackend as Backend>::Device::default();
        let kernel = host::to_host(base.weight()).unwrap();

        let weight = host::from_host::<AdBackend, 4>(&kernel, [2, 2, 3, 3], &device);
        let layer = InvConv3x3::from_weights(weight, Tensor::zeros([2], &device)).unwrap();
        let (_, ctx) = layer.forward(Tensor::zeros([1, 2, 4, 5], &device)).unwrap();
        let grads = layer.logdet(&ctx).unwrap().sum().backward();
        let grad = host::to_host(layer.weight().grad(&grads).unwrap()).unwrap();

        let logdet_at = |values: &[f64]| {
            KernelSpectrum::new(values, 2, [3, 3], 4, 5)
                .unwrap()
                .log_abs_det("test")
                .unwrap()
        };
        let eps = 1e-4;
        for index in [0, 4, 13, 22, 35] {
            let mut plus = kernel.clone();
            plus[index] += eps;
            let mut minus = kernel.clone();
            minus[index] -= eps;
            let numeric = (logdet_at(&plus) - logdet_at(&minus)) / (2.0 * eps);
            assert_close(grad[index], numeric, 1e-2);
        }
    }
}
