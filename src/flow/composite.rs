//! The composite flow: an ordered plan of invertible steps.

use burn::{
    module::{Ignored, Module},
    tensor::{Tensor, backend::Backend},
};

use crate::errors::FlowError;
use crate::layers::{
    ChannelSplit, CoordInjection, InvConv1x1, InvConv3x3, InvertibleLayer, LayerContext,
    PadChannels, Squeeze, Unsqueeze, merge, split,
};

const NAME: &str = "flow";

/// One entry of a flow's execution plan.
///
/// Parameterised layers refer to their position in the flow's layer lists;
/// reshapes carry their factor directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStep {
    Conv1x1 { index: usize },
    Conv3x3 { index: usize },
    CoordInjection { index: usize },
    Squeeze { factor: usize },
    Unsqueeze { factor: usize },
    PadChannels { pad: usize },
    /// Keeps the first `channels` channels and pushes the rest on a stack.
    Split { channels: usize },
    /// Pops the most recently split-off channels and appends them.
    Merge,
}

impl FlowStep {
    pub fn name(&self) -> &'static str {
        match self {
            FlowStep::Conv1x1 { .. } => "conv1x1",
            FlowStep::Conv3x3 { .. } => "conv3x3",
            FlowStep::CoordInjection { .. } => "coord_injection",
            FlowStep::Squeeze { .. } => "squeeze",
            FlowStep::Unsqueeze { .. } => "unsqueeze",
            FlowStep::PadChannels { .. } => "pad_channels",
            FlowStep::Split { .. } => "split",
            FlowStep::Merge => "merge",
        }
    }
}

/// Per-step record of a forward pass (or of a shape-only trace).
#[derive(Debug, Clone)]
enum StepContext<B: Backend> {
    Layer(LayerContext<B>),
    Split { head_channels: usize },
    Merge { head_channels: usize },
}

/// Context of a whole-flow forward pass, consumed by [`Flow::inverse`] and
/// [`Flow::logdet`].
#[derive(Debug, Clone)]
pub struct FlowContext<B: Backend> {
    steps: Vec<StepContext<B>>,
    input_dims: [usize; 4],
    output_dims: [usize; 4],
    device: B::Device,
}

impl<B: Backend> FlowContext<B> {
    pub fn input_dims(&self) -> [usize; 4] {
        self.input_dims
    }

    pub fn output_dims(&self) -> [usize; 4] {
        self.output_dims
    }

    pub fn batch_size(&self) -> usize {
        self.input_dims[0]
    }

    /// Number of recorded steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// A bijection from image space to latent space built from invertible layers.
///
/// The flow owns the parameterised layers; `steps` fixes the order in which
/// they and the parameter-free reshapes run. Construct it with
/// [`FlowBuilder`](super::FlowBuilder) or a [`FlowArchitecture`](super::FlowArchitecture).
#[derive(Module, Debug)]
pub struct Flow<B: Backend> {
    conv1x1: Vec<InvConv1x1<B>>,
    conv3x3: Vec<InvConv3x3<B>>,
    coords: Vec<CoordInjection<B>>,
    steps: Ignored<Vec<FlowStep>>,
    input_shape: Ignored<[usize; 3]>,
    latent_shape: Ignored<[usize; 3]>,
}

fn lookup<'a, T>(layers: &'a [T], index: usize, kind: &str) -> Result<&'a T, FlowError> {
    layers.get(index).ok_or_else(|| FlowError::InvalidLayerConfig {
        message: format!("flow step refers to missing {kind} layer {index}"),
    })
}

fn take_both<B: Backend>(
    parts: ChannelSplit<B>,
) -> Result<(Tensor<B, 4>, Tensor<B, 4>), FlowError> {
    match (parts.head, parts.tail) {
        (Some(head), Some(tail)) => Ok((head, tail)),
        _ => Err(FlowError::shape("flow split must leave both channel groups non-empty")),
    }
}

impl<B: Backend> Flow<B> {
    pub(super) fn from_parts(
        conv1x1: Vec<InvConv1x1<B>>,
        conv3x3: Vec<InvConv3x3<B>>,
        coords: Vec<CoordInjection<B>>,
        steps: Vec<FlowStep>,
        input_shape: [usize; 3],
        latent_shape: [usize; 3],
    ) -> Self {
        Self {
            conv1x1,
            conv3x3,
            coords,
            steps: Ignored(steps),
            input_shape: Ignored(input_shape),
            latent_shape: Ignored(latent_shape),
        }
    }

    /// Image shape `[C, H, W]` accepted by `forward`.
    pub fn input_shape(&self) -> [usize; 3] {
        *self.input_shape
    }

    /// Latent shape `[C, H, W]` produced by `forward`.
    pub fn latent_shape(&self) -> [usize; 3] {
        *self.latent_shape
    }

    /// Number of latent dimensions per item.
    pub fn latent_dim(&self) -> usize {
        self.latent_shape.iter().product()
    }

    pub fn steps(&self) -> &[FlowStep] {
        &self.steps
    }

    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(FlowStep::name).collect()
    }

    fn with_layer<R>(
        &self,
        step: FlowStep,
        f: impl FnOnce(&dyn InvertibleLayer<B>) -> Result<R, FlowError>,
    ) -> Result<R, FlowError> {
        match step {
            FlowStep::Conv1x1 { index } => f(lookup(&self.conv1x1, index, "conv1x1")?),
            FlowStep::Conv3x3 { index } => f(lookup(&self.conv3x3, index, "conv3x3")?),
            FlowStep::CoordInjection { index } => {
                f(lookup(&self.coords, index, "coord_injection")?)
            }
            FlowStep::Squeeze { factor } => f(&Squeeze::new(factor)),
            FlowStep::Unsqueeze { factor } => f(&Unsqueeze::new(factor)),
            FlowStep::PadChannels { pad } => f(&PadChannels::new(pad)),
            FlowStep::Split { .. } | FlowStep::Merge => Err(FlowError::InvalidLayerConfig {
                message: format!("{} is not a layer", step.name()),
            }),
        }
    }

    fn check_input(&self, dims: [usize; 4]) -> Result<(), FlowError> {
        if dims[1..] != self.input_shape[..] {
            return Err(FlowError::shape(format!(
                "flow expects [_, {:?}], got {:?}",
                *self.input_shape, dims
            )));
        }
        Ok(())
    }

    fn check_context(&self, ctx: &FlowContext<B>) -> Result<(), FlowError> {
        if ctx.steps.len() != self.steps.len() {
            return Err(FlowError::stale(
                NAME,
                format!("{} steps", self.steps.len()),
                format!("{} steps", ctx.steps.len()),
            ));
        }
        Ok(())
    }

    /// Maps images to latents and records a context for every step.
    pub fn forward(&self, x: Tensor<B, 4>) -> Result<(Tensor<B, 4>, FlowContext<B>), FlowError> {
        let input_dims = x.dims();
        self.check_input(input_dims)?;
        let device = x.device();

        let mut x = x;
        let mut stack = Vec::new();
        let mut contexts = Vec::with_capacity(self.steps.len());
        for &step in self.steps.iter() {
            match step {
                FlowStep::Split { channels } => {
                    let (head, tail) = take_both(split(x, channels)?)?;
                    stack.push(tail);
                    x = head;
                    contexts.push(StepContext::Split {
                        head_channels: channels,
                    });
                }
                FlowStep::Merge => {
                    let tail = stack
                        .pop()
                        .ok_or_else(|| FlowError::shape("merge without a pending split"))?;
                    let head_channels = x.dims()[1];
                    x = merge(ChannelSplit {
                        head: Some(x),
                        tail: Some(tail),
                    })?;
                    contexts.push(StepContext::Merge { head_channels });
                }
                _ => {
                    let (y, ctx) = self.with_layer(step, |layer| layer.forward(x))?;
                    x = y;
                    contexts.push(StepContext::Layer(ctx));
                }
            }
        }

        let ctx = FlowContext {
            steps: contexts,
            input_dims,
            output_dims: x.dims(),
            device,
        };
        Ok((x, ctx))
    }

    /// Maps latents back to images, running the steps in reverse order.
    pub fn inverse(&self, z: Tensor<B, 4>, ctx: &FlowContext<B>) -> Result<Tensor<B, 4>, FlowError> {
        self.check_context(ctx)?;
        if z.dims() != ctx.output_dims {
            return Err(FlowError::stale(
                NAME,
                format!("{:?}", ctx.output_dims),
                format!("{:?}", z.dims()),
            ));
        }

        let mut y = z;
        let mut stack = Vec::new();
        for (&step, step_ctx) in self.steps.iter().zip(ctx.steps.iter()).rev() {
            match (step, step_ctx) {
                (FlowStep::Merge, StepContext::Merge { head_channels }) => {
                    let (head, tail) = take_both(split(y, *head_channels)?)?;
                    stack.push(tail);
                    y = head;
                }
                (FlowStep::Split { .. }, StepContext::Split { .. }) => {
                    let tail = stack
                        .pop()
                        .ok_or_else(|| FlowError::shape("split without a pending merge"))?;
                    y = merge(ChannelSplit {
                        head: Some(y),
                        tail: Some(tail),
                    })?;
                }
                (_, StepContext::Layer(layer_ctx)) => {
                    y = self.with_layer(step, |layer| layer.inverse(y, layer_ctx))?;
                }
                _ => {
                    return Err(FlowError::stale(NAME, step.name(), "context of another step"));
                }
            }
        }
        Ok(y)
    }

    /// Per-step log-determinants, named by step, for every parameterised or
    /// reshaping layer.
    pub fn layer_logdets(
        &self,
        ctx: &FlowContext<B>,
    ) -> Result<Vec<(&'static str, Tensor<B, 1>)>, FlowError> {
        self.check_context(ctx)?;
        let mut logdets = Vec::new();
        for (&step, step_ctx) in self.steps.iter().zip(ctx.steps.iter()) {
            if let StepContext::Layer(layer_ctx) = step_ctx {
                let logdet = self.with_layer(step, |layer| layer.logdet(layer_ctx))?;
                logdets.push((step.name(), logdet));
            }
        }
        Ok(logdets)
    }

    /// Total log-determinant per batch item: the sum of all layer logdets.
    pub fn logdet(&self, ctx: &FlowContext<B>) -> Result<Tensor<B, 1>, FlowError> {
        let total = Tensor::zeros([ctx.batch_size()], &ctx.device);
        Ok(self
            .layer_logdets(ctx)?
            .into_iter()
            .fold(total, |acc, (_, logdet)| acc + logdet))
    }

    /// Builds a context for `batch` items from shapes alone, so latents can be
    /// inverted without a preceding forward pass.
    pub fn trace(&self, batch: usize, device: &B::Device) -> Result<FlowContext<B>, FlowError> {
        let [c, h, w] = *self.input_shape;
        let input_dims = [batch, c, h, w];
        let mut dims = input_dims;
        let mut stack = Vec::new();
        let mut contexts = Vec::with_capacity(self.steps.len());

        for &step in self.steps.iter() {
            match step {
                FlowStep::Split { channels } => {
                    stack.push(dims[1] - channels);
                    dims[1] = channels;
                    contexts.push(StepContext::Split {
                        head_channels: channels,
                    });
                }
                FlowStep::Merge => {
                    let tail = stack
                        .pop()
                        .ok_or_else(|| FlowError::shape("merge without a pending split"))?;
                    contexts.push(StepContext::Merge {
                        head_channels: dims[1],
                    });
                    dims[1] += tail;
                }
                _ => {
                    let ctx = self.with_layer(step, |layer| layer.trace(dims, device))?;
                    dims = ctx.output_dims();
                    contexts.push(StepContext::Layer(ctx));
                }
            }
        }

        Ok(FlowContext {
            steps: contexts,
            input_dims,
            output_dims: dims,
            device: device.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::FlowBuilder;
    use crate::layers::host;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray;

    fn device() -> <TestBackend as Backend>::Device {
        <TestBackend as Backend>::Device::default()
    }

    fn heterogeneous_flow() -> Flow<TestBackend> {
        FlowBuilder::new([2, 8, 8])
            .with_seed(5)
            .with_conv3x3_init_std(0.1)
            .conv1x1()
            .squeeze(2)
            .conv3x3()
            .coord_injection(4)
            .split(4)
            .conv1x1()
            .merge()
            .unsqueeze(2)
            .build(&device())
            .unwrap()
    }

    #[test]
    fn test_roundtrip() {
        let flow = heterogeneous_flow();
        let x = Tensor::<TestBackend, 4>::random([3, 2, 8, 8], Distribution::Normal(0.0, 1.0), &device());
        let (z, ctx) = flow.forward(x.clone()).unwrap();
        assert_eq!(z.dims(), [3, 2, 8, 8]);

        let recovered = flow.inverse(z, &ctx).unwrap();
        let diff = host::to_host(recovered - x)
            .unwrap()
            .into_iter()
            .fold(0.0f64, |m, v| m.max(v.abs()));
        assert!(diff < 1e-4, "roundtrip error {diff}");
    }

    #[test]
    fn test_logdet_is_sum_of_layer_logdets() {
        let flow = heterogeneous_flow();
        let x = Tensor::<TestBackend, 4>::random([2, 2, 8, 8], Distribution::Normal(0.0, 1.0), &device());
        let (_, ctx) = flow.forward(x).unwrap();

        let per_layer = flow.layer_logdets(&ctx).unwrap();
        let names: Vec<&str> = per_layer.iter().map(|(name, _)| *name).collect();
        assert_eq!(
            names,
            vec!["conv1x1", "squeeze", "conv3x3", "coord_injection", "conv1x1", "unsqueeze"]
        );

        let mut expected = vec![0.0; 2];
        for (_, logdet) in per_layer {
            for (acc, v) in expected.iter_mut().zip(host::to_host(logdet).unwrap()) {
                *acc += v;
            }
        }
        let total = host::to_host(flow.logdet(&ctx).unwrap()).unwrap();
        for (t, e) in total.iter().zip(expected.iter()) {
            assert!((t - e).abs() < 1e-4, "total {t} vs sum {e}");
        }
    }

    #[test]
    fn test_trace_inverts_like_forward_context() {
        let flow = heterogeneous_flow();
        let x = Tensor::<TestBackend, 4>::random([2, 2, 8, 8], Distribution::Normal(0.0, 1.0), &device());
        let (z, _) = flow.forward(x.clone()).unwrap();

        let traced = flow.trace(2, &device()).unwrap();
        assert_eq!(traced.output_dims(), [2, 2, 8, 8]);
        assert_eq!(traced.len(), flow.steps().len());
        let recovered = flow.inverse(z, &traced).unwrap();
        let diff = host::to_host(recovered - x)
            .unwrap()
            .into_iter()
            .fold(0.0f64, |m, v| m.max(v.abs()));
        assert!(diff < 1e-4);
    }

    #[test]
    fn test_wrong_input_shape_is_rejected() {
        let flow = heterogeneous_flow();
        let x = Tensor::<TestBackend, 4>::zeros([1, 3, 8, 8], &device());
        assert!(matches!(flow.forward(x), Err(FlowError::InvalidShape { .. })));
    }

    #[test]
    fn test_inverse_rejects_context_of_other_batch() {
        let flow = heterogeneous_flow();
        let ctx = flow.trace(4, &device()).unwrap();
        let z = Tensor::<TestBackend, 4>::zeros([2, 2, 8, 8], &device());
        assert!(matches!(flow.inverse(z, &ctx), Err(FlowError::StaleContext { .. })));
    }
}
