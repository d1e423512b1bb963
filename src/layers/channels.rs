//! Channel padding, splitting and merging for multi-scale flows.

use burn::tensor::{Tensor, backend::Backend};

use super::{InvertibleLayer, LayerContext, record, zero_logdet};
use crate::errors::FlowError;

const PAD: &str = "pad_channels";

/// The two channel groups produced by [`split`].
///
/// Either side may be empty (`k = 0` or `k = channels`), in which case it is
/// `None`.
#[derive(Debug, Clone)]
pub struct ChannelSplit<B: Backend> {
    pub head: Option<Tensor<B, 4>>,
    pub tail: Option<Tensor<B, 4>>,
}

impl<B: Backend> ChannelSplit<B> {
    pub fn head_channels(&self) -> usize {
        self.head.as_ref().map_or(0, |t| t.dims()[1])
    }

    pub fn tail_channels(&self) -> usize {
        self.tail.as_ref().map_or(0, |t| t.dims()[1])
    }
}

/// Splits `x` into its first `k` channels and the remaining ones.
pub fn split<B: Backend>(x: Tensor<B, 4>, k: usize) -> Result<ChannelSplit<B>, FlowError> {
    let channels = x.dims()[1];
    if k > channels {
        return Err(FlowError::shape(format!(
            "cannot split {k} channels off a {channels}-channel tensor"
        )));
    }
    let split = if k == 0 {
        ChannelSplit {
            head: None,
            tail: Some(x),
        }
    } else if k == channels {
        ChannelSplit {
            head: Some(x),
            tail: None,
        }
    } else {
        ChannelSplit {
            head: Some(x.clone().narrow(1, 0, k)),
            tail: Some(x.narrow(1, k, channels - k)),
        }
    };
    Ok(split)
}

/// Concatenates the two groups of a [`ChannelSplit`] back together.
pub fn merge<B: Backend>(parts: ChannelSplit<B>) -> Result<Tensor<B, 4>, FlowError> {
    match (parts.head, parts.tail) {
        (Some(head), Some(tail)) => {
            let (hd, td) = (head.dims(), tail.dims());
            if hd[0] != td[0] || hd[2..] != td[2..] {
                return Err(FlowError::shape(format!(
                    "cannot merge {hd:?} with {td:?}"
                )));
            }
            Ok(Tensor::cat(vec![head, tail], 1))
        }
        (Some(only), None) | (None, Some(only)) => Ok(only),
        (None, None) => Err(FlowError::shape("cannot merge two empty channel groups")),
    }
}

/// Appends `pad` zero channels; the inverse drops them again.
#[derive(Debug, Clone, Copy)]
pub struct PadChannels {
    pub pad: usize,
}

impl PadChannels {
    pub fn new(pad: usize) -> Self {
        Self { pad }
    }
}

impl<B: Backend> InvertibleLayer<B> for PadChannels {
    fn name(&self) -> &'static str {
        PAD
    }

    fn output_dims(&self, input: [usize; 4]) -> Result<[usize; 4], FlowError> {
        let [b, c, h, w] = input;
        Ok([b, c + self.pad, h, w])
    }

    fn forward(&self, x: Tensor<B, 4>) -> Result<(Tensor<B, 4>, LayerContext<B>), FlowError> {
        let dims = x.dims();
        let y = if self.pad == 0 {
            x
        } else {
            let [b, _, h, w] = dims;
            let zeros = Tensor::zeros([b, self.pad, h, w], &x.device());
            Tensor::cat(vec![x, zeros], 1)
        };
        let ctx = record(PAD, dims, &y);
        Ok((y, ctx))
    }

    fn inverse(&self, y: Tensor<B, 4>, ctx: &LayerContext<B>) -> Result<Tensor<B, 4>, FlowError> {
        ctx.expect_output(PAD, y.dims())?;
        Ok(y.narrow(1, 0, ctx.input_dims()[1]))
    }

    /// Zero: the padded channels carry no density.
    fn logdet(&self, ctx: &LayerContext<B>) -> Result<Tensor<B, 1>, FlowError> {
        ctx.expect_layer(PAD)?;
        Ok(zero_logdet(ctx))
    }
}
