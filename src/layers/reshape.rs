//! Squeeze and unsqueeze: volume-preserving spatial/channel reshapes.

use burn::tensor::{Tensor, backend::Backend};

use super::{InvertibleLayer, LayerContext, record, zero_logdet};
use crate::errors::FlowError;

const SQUEEZE: &str = "squeeze";
const UNSQUEEZE: &str = "unsqueeze";

fn squeezed_dims(dims: [usize; 4], factor: usize) -> Result<[usize; 4], FlowError> {
    let [b, c, h, w] = dims;
    if factor == 0 || h % factor != 0 || w % factor != 0 {
        return Err(FlowError::shape(format!(
            "squeeze factor {factor} does not divide spatial size {h}x{w}"
        )));
    }
    Ok([b, c * factor * factor, h / factor, w / factor])
}

fn unsqueezed_dims(dims: [usize; 4], factor: usize) -> Result<[usize; 4], FlowError> {
    let [b, c, h, w] = dims;
    let block = factor * factor;
    if factor == 0 || c % block != 0 {
        return Err(FlowError::shape(format!(
            "unsqueeze factor {factor} needs channels divisible by {block}, got {c}"
        )));
    }
    Ok([b, c / block, h * factor, w * factor])
}

/// Moves each `factor×factor` spatial block into channels.
///
/// Output channel `c·r² + i·r + j` holds pixel `(i, j)` of each block of input
/// channel `c`.
pub fn squeeze<B: Backend>(x: Tensor<B, 4>, factor: usize) -> Result<Tensor<B, 4>, FlowError> {
    let dims = x.dims();
    let out = squeezed_dims(dims, factor)?;
    let [b, c, h, w] = dims;
    let (h2, w2) = (h / factor, w / factor);

    Ok(x.reshape([b, c, h2, factor, w2, factor])
        .swap_dims(2, 3)
        .swap_dims(3, 5)
        .swap_dims(4, 5)
        .reshape(out))
}

/// Exact inverse of [`squeeze`].
pub fn unsqueeze<B: Backend>(x: Tensor<B, 4>, factor: usize) -> Result<Tensor<B, 4>, FlowError> {
    let dims = x.dims();
    let out = unsqueezed_dims(dims, factor)?;
    let [b, _, h, w] = dims;

    Ok(x.reshape([b, out[1], factor, factor, h, w])
        .swap_dims(2, 4)
        .swap_dims(3, 4)
        .swap_dims(4, 5)
        .reshape(out))
}

/// Squeeze layer: `[B, C, H, W] -> [B, C·r², H/r, W/r]`, zero logdet.
#[derive(Debug, Clone, Copy)]
pub struct Squeeze {
    pub factor: usize,
}

impl Squeeze {
    pub fn new(factor: usize) -> Self {
        Self { factor }
    }
}

impl<B: Backend> InvertibleLayer<B> for Squeeze {
    fn name(&self) -> &'static str {
        SQUEEZE
    }

    fn output_dims(&self, input: [usize; 4]) -> Result<[usize; 4], FlowError> {
        squeezed_dims(input, self.factor)
    }

    fn forward(&self, x: Tensor<B, 4>) -> Result<(Tensor<B, 4>, LayerContext<B>), FlowError> {
        let dims = x.dims();
        let y = squeeze(x, self.factor)?;
        let ctx = record(SQUEEZE, dims, &y);
        Ok((y, ctx))
    }

    fn inverse(&self, y: Tensor<B, 4>, ctx: &LayerContext<B>) -> Result<Tensor<B, 4>, FlowError> {
        ctx.expect_output(SQUEEZE, y.dims())?;
        unsqueeze(y, self.factor)
    }

    fn logdet(&self, ctx: &LayerContext<B>) -> Result<Tensor<B, 1>, FlowError> {
        ctx.expect_layer(SQUEEZE)?;
        Ok(zero_logdet(ctx))
    }
}

/// Unsqueeze layer: `[B, C, H, W] -> [B, C/r², H·r, W·r]`, zero logdet.
#[derive(Debug, Clone, Copy)]
pub struct Unsqueeze {
    pub factor: usize,
}

impl Unsqueeze {
    pub fn new(factor: usize) -> Self {
        Self { factor }
    }
}

impl<B: Backend> InvertibleLayer<B> for Unsqueeze {
    fn name(&self) -> &'static str {
        UNSQUEEZE
    }

    fn output_dims(&self, input: [usize; 4]) -> Result<[usize; 4], FlowError> {
        unsqueezed_dims(input, self.factor)
    }

    fn forward(&self, x: Tensor<B, 4>) -> Result<(Tensor<B, 4>, LayerContext<B>), FlowError> {
        let dims = x.dims();
        let y = unsqueeze(x, self.factor)?;
        let ctx = record(UNSQUEEZE, dims, &y);
        Ok((y, ctx))
    }

    fn inverse(&self, y: Tensor<B, 4>, ctx: &LayerContext<B>) -> Result<Tensor<B, 4>, FlowError> {
        ctx.expect_output(UNSQUEEZE, y.dims())?;
        squeeze(y, self.factor)
    }

    fn logdet(&self, ctx: &LayerContext<B>) -> Result<Tensor<B, 1>, FlowError> {
        ctx.expect_layer(UNSQUEEZE)?;
        Ok(zero_logdet(ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::host;
    use crate::layers::testing::max_abs_diff;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;
    use rstest::rstest;

    type TestBackend = NdArray;

    fn device() -> <TestBackend as Backend>::Device {
        <TestBackend as Backend>::Device::default()
    }

    #[test]
    fn test_squeeze_block_layout() {
        let values: Vec<f64> = (0..16).map(f64::from).collect();
        let x = host::from_host::<TestBackend, 4>(&values, [1, 1, 4, 4], &device());
        let y = squeeze(x, 2).unwrap();

        assert_eq!(y.dims(), [1, 4, 2, 2]);
        // channel 0: top-left pixel of each 2x2 block, channel 1: top-right
        let y = host::to_host(y).unwrap();
        assert_eq!(&y[0..4], &[0.0, 2.0, 8.0, 10.0]);
        assert_eq!(&y[4..8], &[1.0, 3.0, 9.0, 11.0]);
        assert_eq!(&y[8..12], &[4.0, 6.0, 12.0, 14.0]);
    }

    #[rstest]
    #[case([2, 3, 8, 8], 2)]
    #[case([1, 1, 6, 4], 2)]
    #[case([3, 2, 9, 3], 3)]
    #[case([1, 4, 4, 4], 1)]
    fn test_squeeze_then_unsqueeze_is_identity(#[case] dims: [usize; 4], #[case] factor: usize) {
        let x = Tensor::<TestBackend, 4>::random(dims, Distribution::Normal(0.0, 1.0), &device());
        let layer = Squeeze::new(factor);
        let (y, ctx) = InvertibleLayer::<TestBackend>::forward(&layer, x.clone()).unwrap();
        assert_eq!(y.dims(), layer_output(&layer, dims));

        let logdet = host::to_host(layer.logdet(&ctx).unwrap()).unwrap();
        assert_eq!(logdet, vec![0.0; dims[0]]);

        let recovered = layer.inverse(y, &ctx).unwrap();
        assert_eq!(max_abs_diff(x, recovered), 0.0);
    }

    fn layer_output(layer: &Squeeze, dims: [usize; 4]) -> [usize; 4] {
        InvertibleLayer::<TestBackend>::output_dims(layer, dims).unwrap()
    }

    #[test]
    fn test_unsqueeze_layer_inverts_squeeze() {
        let x = Tensor::<TestBackend, 4>::random(
            [2, 8, 2, 3],
            Distribution::Normal(0.0, 1.0),
            &device(),
        );
        let layer = Unsqueeze::new(2);
        let (y, ctx) = layer.forward(x.clone()).unwrap();
        assert_eq!(y.dims(), [2, 2, 4, 6]);
        assert_eq!(max_abs_diff(squeeze(y.clone(), 2).unwrap(), x.clone()), 0.0);
        assert_eq!(max_abs_diff(layer.inverse(y, &ctx).unwrap(), x), 0.0);
    }

    #[test]
    fn test_indivisible_shapes_are_rejected() {
        let x = Tensor::<TestBackend, 4>::zeros([1, 3, 5, 4], &device());
        assert!(matches!(squeeze(x.clone(), 2), Err(FlowError::InvalidShape { .. })));
        assert!(matches!(unsqueeze(x, 2), Err(FlowError::InvalidShape { .. })));
    }

    #[test]
    fn test_logdet_rejects_foreign_context() {
        let ctx = LayerContext::<TestBackend>::new("conv1x1", [1, 4, 2, 2], [1, 4, 2, 2], device());
        assert!(matches!(
            Squeeze::new(2).logdet(&ctx),
            Err(FlowError::StaleContext { .. })
        ));
    }
}
