//! Shared test helpers for layer checks.

use burn::backend::NdArray;
use burn::tensor::{Tensor, backend::Backend};
use nalgebra::DMatrix;

use super::{InvertibleLayer, host};

type TestBackend = NdArray;

pub(crate) fn assert_close(actual: f64, expected: f64, tol: f64) {
    assert!(
        (actual - expected).abs() <= tol * (1.0 + expected.abs()),
        "expected {expected}, got {actual} (tol {tol})"
    );
}

pub(crate) fn max_abs_diff<B: Backend, const D: usize>(a: Tensor<B, D>, b: Tensor<B, D>) -> f64 {
    let a = host::to_host(a).unwrap();
    let b = host::to_host(b).unwrap();
    assert_eq!(a.len(), b.len());
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f64::max)
}

/// `log|det J|` of an affine layer, built column by column from unit inputs.
pub(crate) fn jacobian_logdet<L: InvertibleLayer<TestBackend>>(layer: &L, dims: [usize; 4]) -> f64 {
    assert_eq!(dims[0], 1, "jacobian_logdet works on a single item");
    let device = <TestBackend as Backend>::Device::default();
    let n = dims[1] * dims[2] * dims[3];

    let (base, _) = layer.forward(Tensor::zeros(dims, &device)).unwrap();
    let base = host::to_host(base).unwrap();
    assert_eq!(base.len(), n, "layer must preserve dimensionality");

    let mut jacobian = DMatrix::<f64>::zeros(n, n);
    for j in 0..n {
        let mut unit = vec![0.0; n];
        unit[j] = 1.0;
        let input = host::from_host::<TestBackend, 4>(&unit, dims, &device);
        let (out, _) = layer.forward(input).unwrap();
        let out = host::to_host(out).unwrap();
        for i in 0..n {
            jacobian[(i, j)] = out[i] - base[i];
        }
    }
    jacobian.lu().determinant().abs().ln()
}
