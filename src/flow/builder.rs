//! Fluent construction of [`Flow`]s with shape checking at build time.

use burn::tensor::backend::Backend;

use super::composite::{Flow, FlowStep};
use crate::errors::FlowError;
use crate::layers::{
    CoordInjectionConfig, InvConv1x1Config, InvConv3x3Config, InvertibleLayer, PadChannels,
    Squeeze, Unsqueeze,
};

#[derive(Debug, Clone, Copy)]
enum PlannedStep {
    Conv1x1,
    Conv3x3,
    CoordInjection { mid_channels: usize },
    Squeeze(usize),
    Unsqueeze(usize),
    PadChannels(usize),
    Split(usize),
    Merge,
}

/// Builder for a [`Flow`] over images of a fixed `[C, H, W]` shape.
///
/// Layer widths follow from the running shape, so only the structure is
/// specified. `split(k)` sends the first `k` channels on through the following
/// steps and parks the rest until the matching `merge()`.
#[derive(Debug, Clone)]
pub struct FlowBuilder {
    input_shape: [usize; 3],
    plan: Vec<PlannedStep>,
    seed: u64,
    conv3x3_init_std: f64,
}

impl FlowBuilder {
    /// Creates an empty plan for `[C, H, W]` images.
    pub fn new(input_shape: [usize; 3]) -> Self {
        Self {
            input_shape,
            plan: Vec::new(),
            seed: 0,
            conv3x3_init_std: 0.01,
        }
    }

    /// Base seed for layer initialisation; each layer offsets it by its position.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_conv3x3_init_std(mut self, std: f64) -> Self {
        self.conv3x3_init_std = std;
        self
    }

    pub fn conv1x1(mut self) -> Self {
        self.plan.push(PlannedStep::Conv1x1);
        self
    }

    pub fn conv3x3(mut self) -> Self {
        self.plan.push(PlannedStep::Conv3x3);
        self
    }

    pub fn coord_injection(mut self, mid_channels: usize) -> Self {
        self.plan.push(PlannedStep::CoordInjection { mid_channels });
        self
    }

    pub fn squeeze(mut self, factor: usize) -> Self {
        self.plan.push(PlannedStep::Squeeze(factor));
        self
    }

    pub fn unsqueeze(mut self, factor: usize) -> Self {
        self.plan.push(PlannedStep::Unsqueeze(factor));
        self
    }

    pub fn pad_channels(mut self, pad: usize) -> Self {
        self.plan.push(PlannedStep::PadChannels(pad));
        self
    }

    pub fn split(mut self, channels: usize) -> Self {
        self.plan.push(PlannedStep::Split(channels));
        self
    }

    pub fn merge(mut self) -> Self {
        self.plan.push(PlannedStep::Merge);
        self
    }

    /// Appends `count` copies of whatever `block` adds.
    pub fn repeat(self, count: usize, block: impl Fn(Self) -> Self) -> Self {
        (0..count).fold(self, |builder, _| block(builder))
    }

    /// Number of planned steps.
    pub fn len(&self) -> usize {
        self.plan.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plan.is_empty()
    }

    /// Initializes every layer and checks that shapes line up.
    pub fn build<B: Backend>(&self, device: &B::Device) -> Result<Flow<B>, FlowError> {
        if self.plan.is_empty() {
            return Err(FlowError::NoLayers);
        }
        let [c, h, w] = self.input_shape;
        if c == 0 || h == 0 || w == 0 {
            return Err(FlowError::shape(format!(
                "flow input shape must be non-empty, got {:?}",
                self.input_shape
            )));
        }

        let mut dims = [1, c, h, w];
        let mut pending: Vec<[usize; 4]> = Vec::new();
        let mut conv1x1 = Vec::new();
        let mut conv3x3 = Vec::new();
        let mut coords = Vec::new();
        let mut steps = Vec::with_capacity(self.plan.len());

        for (position, planned) in self.plan.iter().enumerate() {
            let seed = self.seed.wrapping_add(position as u64);
            let step = match *planned {
                PlannedStep::Conv1x1 => {
                    let layer = InvConv1x1Config::new(dims[1]).with_seed(seed).init::<B>(device);
                    dims = layer.output_dims(dims)?;
                    conv1x1.push(layer);
                    FlowStep::Conv1x1 {
                        index: conv1x1.len() - 1,
                    }
                }
                PlannedStep::Conv3x3 => {
                    let layer = InvConv3x3Config::new(dims[1])
                        .with_init_std(self.conv3x3_init_std)
                        .with_seed(seed)
                        .init::<B>(device);
                    dims = layer.output_dims(dims)?;
                    conv3x3.push(layer);
                    FlowStep::Conv3x3 {
                        index: conv3x3.len() - 1,
                    }
                }
                PlannedStep::CoordInjection { mid_channels } => {
                    let layer = CoordInjectionConfig::new(dims[1])
                        .with_mid_channels(mid_channels)
                        .init::<B>(device);
                    dims = layer.output_dims(dims)?;
                    coords.push(layer);
                    FlowStep::CoordInjection {
                        index: coords.len() - 1,
                    }
                }
                PlannedStep::Squeeze(factor) => {
                    dims = InvertibleLayer::<B>::output_dims(&Squeeze::new(factor), dims)?;
                    FlowStep::Squeeze { factor }
                }
                PlannedStep::Unsqueeze(factor) => {
                    dims = InvertibleLayer::<B>::output_dims(&Unsqueeze::new(factor), dims)?;
                    FlowStep::Unsqueeze { factor }
                }
                PlannedStep::PadChannels(pad) => {
                    dims = InvertibleLayer::<B>::output_dims(&PadChannels::new(pad), dims)?;
                    FlowStep::PadChannels { pad }
                }
                PlannedStep::Split(channels) => {
                    if channels == 0 || channels >= dims[1] {
                        return Err(FlowError::InvalidLayerConfig {
                            message: format!(
                                "split at step {position} must keep between 1 and {} of {} channels, got {channels}",
                                dims[1].saturating_sub(1),
                                dims[1]
                            ),
                        });
                    }
                    pending.push([dims[0], dims[1] - channels, dims[2], dims[3]]);
                    dims[1] = channels;
                    FlowStep::Split { channels }
                }
                PlannedStep::Merge => {
                    let tail = pending.pop().ok_or_else(|| FlowError::InvalidLayerConfig {
                        message: format!("merge at step {position} has no matching split"),
                    })?;
                    if tail[2..] != dims[2..] {
                        return Err(FlowError::shape(format!(
                            "merge at step {position}: spatial size {:?} does not match the split-off {:?}",
                            &dims[2..],
                            &tail[2..]
                        )));
                    }
                    dims[1] += tail[1];
                    FlowStep::Merge
                }
            };
            steps.push(step);
        }

        if !pending.is_empty() {
            return Err(FlowError::InvalidLayerConfig {
                message: format!("{} split(s) without a matching merge", pending.len()),
            });
        }

        let latent_shape = [dims[1], dims[2], dims[3]];
        log::debug!(
            "Built flow with {} steps: {:?} -> {:?}",
            steps.len(),
            self.input_shape,
            latent_shape
        );
        Ok(Flow::from_parts(
            conv1x1,
            conv3x3,
            coords,
            steps,
            self.input_shape,
            latent_shape,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    fn device() -> <TestBackend as Backend>::Device {
        <TestBackend as Backend>::Device::default()
    }

    #[test]
    fn test_build_tracks_shapes() {
        let flow = FlowBuilder::new([3, 8, 8])
            .pad_channels(1)
            .squeeze(2)
            .repeat(2, |b| b.conv3x3().conv1x1())
            .build::<TestBackend>(&device())
            .unwrap();

        assert_eq!(flow.input_shape(), [3, 8, 8]);
        assert_eq!(flow.latent_shape(), [16, 4, 4]);
        assert_eq!(flow.latent_dim(), 256);
        assert_eq!(
            flow.step_names(),
            vec!["pad_channels", "squeeze", "conv3x3", "conv1x1", "conv3x3", "conv1x1"]
        );
    }

    #[test]
    fn test_empty_plan_fails() {
        let result = FlowBuilder::new([1, 4, 4]).build::<TestBackend>(&device());
        assert!(matches!(result, Err(FlowError::NoLayers)));
    }

    #[test]
    fn test_unbalanced_split_fails() {
        let result = FlowBuilder::new([4, 4, 4])
            .split(2)
            .conv1x1()
            .build::<TestBackend>(&device());
        assert!(matches!(result, Err(FlowError::InvalidLayerConfig { .. })));

        let result = FlowBuilder::new([4, 4, 4]).merge().build::<TestBackend>(&device());
        assert!(matches!(result, Err(FlowError::InvalidLayerConfig { .. })));
    }

    #[test]
    fn test_degenerate_split_fails() {
        for k in [0, 4, 5] {
            let result = FlowBuilder::new([4, 4, 4])
                .split(k)
                .merge()
                .build::<TestBackend>(&device());
            assert!(
                matches!(result, Err(FlowError::InvalidLayerConfig { .. })),
                "split({k}) should be rejected"
            );
        }
    }

    #[test]
    fn test_merge_after_spatial_change_fails() {
        let result = FlowBuilder::new([2, 4, 4])
            .split(1)
            .squeeze(2)
            .merge()
            .build::<TestBackend>(&device());
        assert!(matches!(result, Err(FlowError::InvalidShape { .. })));
    }

    #[test]
    fn test_indivisible_squeeze_fails() {
        let result = FlowBuilder::new([1, 5, 5]).squeeze(2).build::<TestBackend>(&device());
        assert!(matches!(result, Err(FlowError::InvalidShape { .. })));
    }

    #[test]
    fn test_conv3x3_needs_room_for_kernel() {
        let result = FlowBuilder::new([1, 4, 4])
            .squeeze(2)
            .conv3x3()
            .build::<TestBackend>(&device());
        assert!(matches!(result, Err(FlowError::InvalidShape { .. })));
    }
}
