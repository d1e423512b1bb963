//! Named flow architectures selectable from configuration.

use std::fmt;

use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};

use super::{Flow, FlowBuilder};
use crate::errors::FlowError;

/// Registry of the flow architectures this crate can build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowArchitecture {
    /// A 1×1 convolution followed by coordinate injection.
    ToyFlow,
    /// Squeeze, then blocks of `[3×3 conv, coordinate injection, 1×1 conv]`.
    SpectralFlow,
    /// Two scales of spectral blocks: half the channels go through a second
    /// squeeze and more blocks before being merged back.
    MultiScaleSpectralFlow,
}

impl FlowArchitecture {
    pub const ALL: [FlowArchitecture; 3] = [
        FlowArchitecture::ToyFlow,
        FlowArchitecture::SpectralFlow,
        FlowArchitecture::MultiScaleSpectralFlow,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            FlowArchitecture::ToyFlow => "ToyFlow",
            FlowArchitecture::SpectralFlow => "SpectralFlow",
            FlowArchitecture::MultiScaleSpectralFlow => "MultiScaleSpectralFlow",
        }
    }

    /// Case-insensitive lookup that ignores `_` and `-`.
    pub fn from_name(name: &str) -> Result<Self, FlowError> {
        let normalize = |s: &str| {
            s.chars()
                .filter(|c| *c != '_' && *c != '-')
                .collect::<String>()
                .to_lowercase()
        };
        let wanted = normalize(name);
        Self::ALL
            .into_iter()
            .find(|arch| normalize(arch.name()) == wanted)
            .ok_or_else(|| FlowError::UnknownArchitecture {
                name: name.to_string(),
            })
    }

    /// The layer plan for `[C, H, W]` images.
    pub fn builder(&self, input_shape: [usize; 3]) -> FlowBuilder {
        let block = |b: FlowBuilder| b.conv3x3().coord_injection(8).conv1x1();
        let builder = FlowBuilder::new(input_shape);
        match self {
            FlowArchitecture::ToyFlow => builder.conv1x1().coord_injection(8),
            FlowArchitecture::SpectralFlow => builder.squeeze(2).repeat(4, block),
            FlowArchitecture::MultiScaleSpectralFlow => {
                let half = input_shape[0] * 2;
                builder
                    .squeeze(2)
                    .repeat(2, block)
                    .split(half)
                    .squeeze(2)
                    .repeat(2, block)
                    .unsqueeze(2)
                    .merge()
                    .unsqueeze(2)
            }
        }
    }

    pub fn build<B: Backend>(
        &self,
        input_shape: [usize; 3],
        seed: u64,
        device: &B::Device,
    ) -> Result<Flow<B>, FlowError> {
        let flow = self.builder(input_shape).with_seed(seed).build(device)?;
        log::info!(
            "Building {} model for {:?}: {} steps",
            self.name(),
            input_shape,
            flow.steps().len()
        );
        Ok(flow)
    }
}

impl fmt::Display for FlowArchitecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
