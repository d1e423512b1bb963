//! Invertible layer implementations.
//!
//! Every layer is data (its parameters) plus three operations satisfying
//! `inverse(forward(x)) == x` and reporting the log-absolute-determinant of
//! its Jacobian per batch item. `forward` returns an explicit
//! [`LayerContext`] that `inverse` and `logdet` consume.

pub mod channels;
pub mod context;
pub mod conv1x1;
pub mod conv3x3;
pub mod coord_injection;
pub mod host;
pub mod reshape;
mod spectral;
#[cfg(test)]
mod testing;

pub use channels::{ChannelSplit, PadChannels, merge, split};
pub use context::LayerContext;
pub use conv1x1::{InvConv1x1, InvConv1x1Config};
pub use conv3x3::{InvConv3x3, InvConv3x3Config};
pub use coord_injection::{CoordInjection, CoordInjectionConfig};
pub use reshape::{Squeeze, Unsqueeze, squeeze, unsqueeze};

use burn::tensor::{Tensor, backend::Backend};

use crate::errors::FlowError;

/// Condition number above which a channel-mixing matrix is treated as singular.
pub const MAX_CONDITION_NUMBER: f64 = 1e10;

/// An exactly invertible transform of image-shaped tensors.
pub trait InvertibleLayer<B: Backend> {
    /// Stable layer name, recorded in contexts.
    fn name(&self) -> &'static str;

    /// Output dims for a given input without running the transform.
    fn output_dims(&self, input: [usize; 4]) -> Result<[usize; 4], FlowError>;

    /// Applies the transform and records the context for `inverse`/`logdet`.
    fn forward(&self, x: Tensor<B, 4>) -> Result<(Tensor<B, 4>, LayerContext<B>), FlowError>;

    /// Inverts the transform for an output shaped like `ctx.output_dims()`.
    fn inverse(&self, y: Tensor<B, 4>, ctx: &LayerContext<B>) -> Result<Tensor<B, 4>, FlowError>;

    /// Log-absolute-determinant of the Jacobian, one value per batch item.
    fn logdet(&self, ctx: &LayerContext<B>) -> Result<Tensor<B, 1>, FlowError>;

    /// Builds a context from shapes alone, e.g. to invert latent samples.
    fn trace(
        &self,
        input: [usize; 4],
        device: &B::Device,
    ) -> Result<LayerContext<B>, FlowError> {
        let output = self.output_dims(input)?;
        Ok(LayerContext::new(self.name(), input, output, device.clone()))
    }
}

/// Records a context for `layer` from the tensors around a forward call.
pub(crate) fn record<B: Backend>(
    layer: &'static str,
    input: [usize; 4],
    output: &Tensor<B, 4>,
) -> LayerContext<B> {
    LayerContext::new(layer, input, output.dims(), output.device())
}

/// Per-item zero logdet for volume-preserving layers.
pub(crate) fn zero_logdet<B: Backend>(ctx: &LayerContext<B>) -> Tensor<B, 1> {
    Tensor::zeros([ctx.batch_size()], ctx.device())
}

/// Attaches an analytically known gradient to a host-computed scalar.
///
/// The result has value `value` and gradient `grad` with respect to `param`:
/// `value + sum((param - detach(param)) * grad)`.
pub(crate) fn with_gradient<B: Backend, const D: usize>(
    value: f64,
    param: Tensor<B, D>,
    grad: Tensor<B, D>,
) -> Tensor<B, 1> {
    let delta = param.clone() - param.detach();
    (delta * grad).sum().add_scalar(value)
}
