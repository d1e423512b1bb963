//! Coordinate injection: a position-dependent element-wise affine map.

use burn::{
    module::Module,
    nn::{
        Initializer, PaddingConfig2d, Relu,
        conv::{Conv2d, Conv2dConfig},
    },
    tensor::{Tensor, backend::Backend},
};

use super::{InvertibleLayer, LayerContext, host, record};
use crate::errors::FlowError;

const NAME: &str = "coord_injection";
const COORD_CHANNELS: usize = 2;

/// Configuration for a [`CoordInjection`] layer.
#[derive(Debug, Clone)]
pub struct CoordInjectionConfig {
    /// Channels of the transformed tensor.
    pub channels: usize,
    /// Hidden width of the coordinate sub-networks.
    pub mid_channels: usize,
}

impl CoordInjectionConfig {
    /// Creates a new CoordInjectionConfig with 8 hidden channels.
    pub fn new(channels: usize) -> Self {
        Self {
            channels,
            mid_channels: 8,
        }
    }

    pub fn with_mid_channels(mut self, mid_channels: usize) -> Self {
        self.mid_channels = mid_channels;
        self
    }

    /// Initializes both sub-networks; output convs start at zero so the
    /// layer starts as the identity.
    pub fn init<B: Backend>(&self, device: &B::Device) -> CoordInjection<B> {
        CoordInjection {
            mul_net: self.init_net(device),
            bias_net: self.init_net(device),
            channels: self.channels,
        }
    }

    fn init_net<B: Backend>(&self, device: &B::Device) -> CoordNet<B> {
        let padding = PaddingConfig2d::Explicit(1, 1);
        CoordNet {
            hidden: Conv2dConfig::new([COORD_CHANNELS, self.mid_channels], [3, 3])
                .with_padding(padding.clone())
                .init(device),
            output: Conv2dConfig::new([self.mid_channels + COORD_CHANNELS, self.channels], [3, 3])
                .with_padding(padding)
                .with_initializer(Initializer::Zeros)
                .init(device),
            activation: Relu::new(),
        }
    }
}

/// `coords -> conv -> ReLU -> conv`, with the coordinates appended to the
/// input of every convolution.
#[derive(Module, Debug)]
pub struct CoordNet<B: Backend> {
    hidden: Conv2d<B>,
    output: Conv2d<B>,
    activation: Relu,
}

impl<B: Backend> CoordNet<B> {
    pub fn forward(&self, coords: Tensor<B, 4>) -> Tensor<B, 4> {
        let hidden = self.activation.forward(self.hidden.forward(coords.clone()));
        self.output.forward(Tensor::cat(vec![hidden, coords], 1))
    }
}

/// `y = x * exp(log_mul(pos)) + bias(pos)`, where both maps see only the
/// pixel coordinates. The Jacobian is diagonal with entries `exp(log_mul)`.
#[derive(Module, Debug)]
pub struct CoordInjection<B: Backend> {
    mul_net: CoordNet<B>,
    bias_net: CoordNet<B>,
    channels: usize,
}

/// Row and column coordinates in `[-1, 1]`, shaped `[1, 2, height, width]`.
fn coordinate_grid<B: Backend>(height: usize, width: usize, device: &B::Device) -> Tensor<B, 4> {
    let axis = |i: usize, n: usize| {
        if n > 1 {
            2.0 * i as f64 / (n - 1) as f64 - 1.0
        } else {
            0.0
        }
    };
    let mut values = Vec::with_capacity(2 * height * width);
    for r in 0..height {
        for _ in 0..width {
            values.push(axis(r, height));
        }
    }
    for _ in 0..height {
        for c in 0..width {
            values.push(axis(c, width));
        }
    }
    host::from_host(&values, [1, COORD_CHANNELS, height, width], device)
}

impl<B: Backend> CoordInjection<B> {
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Per-pixel `(log_mul, bias)`, each `[1, C, height, width]`.
    pub fn scale_and_bias(
        &self,
        height: usize,
        width: usize,
        device: &B::Device,
    ) -> (Tensor<B, 4>, Tensor<B, 4>) {
        let coords = coordinate_grid::<B>(height, width, device);
        (
            self.mul_net.forward(coords.clone()),
            self.bias_net.forward(coords),
        )
    }

    fn check_channels(&self, dims: [usize; 4]) -> Result<(), FlowError> {
        if dims[1] != self.channels {
            return Err(FlowError::shape(format!(
                "coord_injection expects {} channels, got {:?}",
                self.channels, dims
            )));
        }
        Ok(())
    }
}

impl<B: Backend> InvertibleLayer<B> for CoordInjection<B> {
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
        let (log_mul, bias) = self.scale_and_bias(dims[2], dims[3], &x.device());
        let y = x * log_mul.exp().expand(dims) + bias.expand(dims);
        let ctx = record(NAME, dims, &y);
        Ok((y, ctx))
    }

    fn inverse(&self, y: Tensor<B, 4>, ctx: &LayerContext<B>) -> Result<Tensor<B, 4>, FlowError> {
        let dims = y.dims();
        ctx.expect_output(NAME, dims)?;
        let (log_mul, bias) = self.scale_and_bias(dims[2], dims[3], &y.device());
        Ok((y - bias.expand(dims)) * log_mul.neg().exp().expand(dims))
    }

    fn logdet(&self, ctx: &LayerContext<B>) -> Result<Tensor<B, 1>, FlowError> {
        ctx.expect_input_channels(NAME, self.channels)?;
        let [batch, _, height, width] = ctx.input_dims();
        let (log_mul, _) = self.scale_and_bias(height, width, ctx.device());
        Ok(log_mul.sum().expand([batch]))
    }
}
