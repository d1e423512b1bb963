//! Explicit forward-pass context threaded into `inverse` and `logdet`.

use burn::tensor::backend::Backend;

use crate::errors::FlowError;

/// Shape record produced by a layer's `forward` (or by a shape-only trace).
///
/// A context is immutable and owned by the caller, so the same layer instance
/// can serve any number of overlapping passes.
#[derive(Debug, Clone)]
pub struct LayerContext<B: Backend> {
    layer: &'static str,
    input_dims: [usize; 4],
    output_dims: [usize; 4],
    device: B::Device,
}

impl<B: Backend> LayerContext<B> {
    /// Creates a context for `layer` mapping `input_dims` to `output_dims`.
    pub fn new(
        layer: &'static str,
        input_dims: [usize; 4],
        output_dims: [usize; 4],
        device: B::Device,
    ) -> Self {
        Self {
            layer,
            input_dims,
            output_dims,
            device,
        }
    }

    /// Name of the layer that produced this context.
    pub fn layer(&self) -> &'static str {
        self.layer
    }

    /// Dims of the forward input `[batch, channels, height, width]`.
    pub fn input_dims(&self) -> [usize; 4] {
        self.input_dims
    }

    /// Dims of the forward output.
    pub fn output_dims(&self) -> [usize; 4] {
        self.output_dims
    }

    pub fn batch_size(&self) -> usize {
        self.input_dims[0]
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    /// Fails unless this context was produced by `layer`.
    pub fn expect_layer(&self, layer: &'static str) -> Result<(), FlowError> {
        if self.layer == layer {
            Ok(())
        } else {
            Err(FlowError::stale(layer, layer, self.layer))
        }
    }

    /// Fails unless this context was produced by `layer` and its forward
    /// input had `channels` channels.
    pub fn expect_input_channels(
        &self,
        layer: &'static str,
        channels: usize,
    ) -> Result<(), FlowError> {
        self.expect_layer(layer)?;
        if self.input_dims[1] != channels {
            return Err(FlowError::stale(
                layer,
                format!("{channels} input channels"),
                format!("{} input channels", self.input_dims[1]),
            ));
        }
        Ok(())
    }

    /// Fails unless `dims` are exactly the forward output dims recorded here.
    pub fn expect_output(&self, layer: &'static str, dims: [usize; 4]) -> Result<(), FlowError> {
        self.expect_layer(layer)?;
        if self.output_dims != dims {
            return Err(FlowError::stale(
                layer,
                format!("{:?}", self.output_dims),
                format!("{:?}", dims),
            ));
        }
        Ok(())
    }
}
