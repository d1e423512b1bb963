//! Host-side linear algebra for the spectral layers.
//!
//! A convolution with wrap-around boundary is block-circulant, so the 2-D DFT
//! diagonalises it into one `C×C` complex matrix per frequency bin. Each bin
//! is stored in realified form `[[A, -B], [B, A]]` (`2C×2C`, real) so that
//! determinants and inverses use real factorizations.

use std::f64::consts::PI;
use std::sync::Arc;

use nalgebra::{Cholesky, DMatrix, DVector};
use rustfft::{Fft, FftPlanner, num_complex::Complex};

use super::MAX_CONDITION_NUMBER;
use crate::errors::FlowError;

/// Diagonal regularizer added before the Cholesky factorization.
pub(crate) const CHOLESKY_JITTER: f64 = 1e-5;

/// Row-major copy of a matrix.
pub(crate) fn row_major(matrix: &DMatrix<f64>) -> Vec<f64> {
    matrix.transpose().as_slice().to_vec()
}

/// Ratio of the largest to the smallest singular value.
pub(crate) fn condition_number(matrix: &DMatrix<f64>) -> f64 {
    let singular = matrix.clone().svd(false, false).singular_values;
    let (max, min) = (singular.max(), singular.min());
    if min > 0.0 { max / min } else { f64::INFINITY }
}

pub(crate) fn check_conditioning(layer: &str, matrix: &DMatrix<f64>) -> Result<(), FlowError> {
    let condition = condition_number(matrix);
    if !condition.is_finite() || condition > MAX_CONDITION_NUMBER {
        return Err(FlowError::non_invertible(
            layer,
            format!("condition number {condition:.3e} exceeds {MAX_CONDITION_NUMBER:.0e}"),
        ));
    }
    log::debug!("{layer}: condition number {condition:.3e}");
    Ok(())
}

/// Maps `A + iB` to the real matrix `[[A, -B], [B, A]]`.
pub(crate) fn realify(re: &DMatrix<f64>, im: &DMatrix<f64>) -> DMatrix<f64> {
    let c = re.nrows();
    let mut out = DMatrix::zeros(2 * c, 2 * c);
    out.view_mut((0, 0), (c, c)).copy_from(re);
    out.view_mut((0, c), (c, c)).copy_from(&(-im));
    out.view_mut((c, 0), (c, c)).copy_from(im);
    out.view_mut((c, c), (c, c)).copy_from(re);
    out
}

/// Planned 2-D FFT over row-major `height × width` buffers.
pub(crate) struct Fft2 {
    height: usize,
    width: usize,
    rows: Arc<dyn Fft<f64>>,
    cols: Arc<dyn Fft<f64>>,
    rows_inv: Arc<dyn Fft<f64>>,
    cols_inv: Arc<dyn Fft<f64>>,
}

impl Fft2 {
    pub(crate) fn new(height: usize, width: usize) -> Self {
        let mut planner = FftPlanner::new();
        Self {
            height,
            width,
            rows: planner.plan_fft_forward(width),
            cols: planner.plan_fft_forward(height),
            rows_inv: planner.plan_fft_inverse(width),
            cols_inv: planner.plan_fft_inverse(height),
        }
    }

    /// Unnormalized forward transform, in place.
    pub(crate) fn forward(&self, buffer: &mut [Complex<f64>]) {
        self.apply(buffer, &self.rows, &self.cols);
    }

    /// Inverse transform normalized by `1 / (height * width)`, in place.
    pub(crate) fn inverse(&self, buffer: &mut [Complex<f64>]) {
        self.apply(buffer, &self.rows_inv, &self.cols_inv);
        let scale = 1.0 / (self.height * self.width) as f64;
        for value in buffer.iter_mut() {
            *value *= scale;
        }
    }

    fn apply(&self, buffer: &mut [Complex<f64>], rows: &Arc<dyn Fft<f64>>, cols: &Arc<dyn Fft<f64>>) {
        let (h, w) = (self.height, self.width);
        rows.process(buffer);

        let mut transposed = vec![Complex::new(0.0, 0.0); h * w];
        for r in 0..h {
            for c in 0..w {
                transposed[c * h + r] = buffer[r * w + c];
            }
        }
        cols.process(&mut transposed);
        for r in 0..h {
            for c in 0..w {
                buffer[r * w + c] = transposed[c * h + r];
            }
        }
    }
}

/// Frequency response of a `[C, C, kh, kw]` kernel applied circularly on a
/// `height × width` grid.
///
/// The kernel is zero-padded to the full grid at offset
/// `((height - kh) / 2, (width - kw) / 2)` and its DFT is conjugated, which
/// turns cross-correlation into a per-bin matrix product. Inverting in the
/// frequency domain therefore lands `shift()` pixels off, undone by a
/// circular roll.
pub(crate) struct KernelSpectrum {
    channels: usize,
    kernel_size: [usize; 2],
    height: usize,
    width: usize,
    offset: [usize; 2],
    bins: Vec<DMatrix<f64>>,
}

impl KernelSpectrum {
    pub(crate) fn new(
        kernel: &[f64],
        channels: usize,
        kernel_size: [usize; 2],
        height: usize,
        width: usize,
    ) -> Result<Self, FlowError> {
        let [kh, kw] = kernel_size;
        if height < kh || width < kw {
            return Err(FlowError::shape(format!(
                "spatial size {height}x{width} is smaller than the {kh}x{kw} kernel"
            )));
        }
        if kernel.len() != channels * channels * kh * kw {
            return Err(FlowError::shape(format!(
                "kernel has {} values, expected {}",
                kernel.len(),
                channels * channels * kh * kw
            )));
        }

        let offset = [(height - kh) / 2, (width - kw) / 2];
        let bins_count = height * width;
        let fft = Fft2::new(height, width);
        let mut re = vec![DMatrix::<f64>::zeros(channels, channels); bins_count];
        let mut im = vec![DMatrix::<f64>::zeros(channels, channels); bins_count];

        let mut grid = vec![Complex::new(0.0, 0.0); bins_count];
        for o in 0..channels {
            for i in 0..channels {
                grid.iter_mut().for_each(|v| *v = Complex::new(0.0, 0.0));
                for p in 0..kh {
                    for q in 0..kw {
                        let tap = kernel[((o * channels + i) * kh + p) * kw + q];
                        grid[(p + offset[0]) * width + q + offset[1]] = Complex::new(tap, 0.0);
                    }
                }
                fft.forward(&mut grid);
                for (bin, value) in grid.iter().enumerate() {
                    re[bin][(o, i)] = value.re;
                    im[bin][(o, i)] = -value.im;
                }
            }
        }

        let bins = re
            .iter()
            .zip(im.iter())
            .map(|(a, b)| realify(a, b))
            .collect();

        Ok(Self {
            channels,
            kernel_size,
            height,
            width,
            offset,
            bins,
        })
    }

    /// Circular shift between the frequency-domain inverse and the input grid.
    pub(crate) fn shift(&self) -> [usize; 2] {
        [
            self.offset[0] + self.kernel_size[0] / 2,
            self.offset[1] + self.kernel_size[1] / 2,
        ]
    }

    /// Realified matrices, one per frequency bin in row-major bin order.
    pub(crate) fn bins(&self) -> &[DMatrix<f64>] {
        &self.bins
    }

    /// `sum_f log|det M_f|`, via Cholesky factors of `D_f D_f^T + eps I`.
    pub(crate) fn log_abs_det(&self, layer: &str) -> Result<f64, FlowError> {
        let size = 2 * self.channels;
        let jitter = DMatrix::<f64>::identity(size, size) * CHOLESKY_JITTER;
        let mut total = 0.0;
        for (bin, d) in self.bins.iter().enumerate() {
            let gram = d * d.transpose() + &jitter;
            let cholesky = Cholesky::new(gram).ok_or_else(|| {
                FlowError::non_invertible(layer, format!("Cholesky failed at frequency bin {bin}"))
            })?;
            let diagonal_logs: f64 = cholesky.l().diagonal().iter().map(|v| v.ln()).sum();
            // det(D D^T) = |det M|^4
            total += diagonal_logs / 2.0;
        }
        if !total.is_finite() {
            return Err(FlowError::non_invertible(layer, "log-determinant is not finite"));
        }
        Ok(total)
    }

    /// Inverts every bin, failing on the first ill-conditioned one.
    pub(crate) fn inverses(&self, layer: &str) -> Result<Vec<DMatrix<f64>>, FlowError> {
        self.bins
            .iter()
            .enumerate()
            .map(|(bin, d)| {
                check_conditioning(layer, d).map_err(|err| match err {
                    FlowError::NonInvertible { layer, reason } => FlowError::NonInvertible {
                        layer,
                        reason: format!("frequency bin {bin}: {reason}"),
                    },
                    other => other,
                })?;
                d.clone().try_inverse().ok_or_else(|| {
                    FlowError::non_invertible(layer, format!("frequency bin {bin} is singular"))
                })
            })
            .collect()
    }

    /// Gradient of `sum_f log|det M_f|` with respect to each kernel tap,
    /// laid out like the kernel (`[C, C, kh, kw]`).
    ///
    /// `d log|det M| / dK[o,i,p,q] = sum_f Re(M_f^-1[i,o] * w_f(p,q))`
    /// where `w_f` is the conjugated DFT phase of tap `(p, q)`.
    pub(crate) fn log_abs_det_gradient(&self, inverses: &[DMatrix<f64>]) -> Vec<f64> {
        let c = self.channels;
        let [kh, kw] = self.kernel_size;
        let mut grad = vec![0.0; c * c * kh * kw];

        for fh in 0..self.height {
            for fw in 0..self.width {
                let inverse = &inverses[fh * self.width + fw];
                for p in 0..kh {
                    for q in 0..kw {
                        let theta = 2.0
                            * PI
                            * ((fh * (p + self.offset[0])) as f64 / self.height as f64
                                + (fw * (q + self.offset[1])) as f64 / self.width as f64);
                        let (sin, cos) = theta.sin_cos();
                        for o in 0..c {
                            for i in 0..c {
                                let re = inverse[(i, o)];
                                let im = inverse[(c + i, o)];
                                grad[((o * c + i) * kh + p) * kw + q] += re * cos - im * sin;
                            }
                        }
                    }
                }
            }
        }
        grad
    }

    /// Solves `M_f x_f = y_f` for every bin of a multi-channel image.
    ///
    /// `image` is `[C, height, width]` row-major; the result is rolled back
    /// by `shift()` so it lines up with the forward input.
    pub(crate) fn solve_image(&self, image: &[f64], inverses: &[DMatrix<f64>]) -> Vec<f64> {
        let c = self.channels;
        let (h, w) = (self.height, self.width);
        let hw = h * w;
        let fft = Fft2::new(h, w);

        let mut spectra: Vec<Vec<Complex<f64>>> = (0..c)
            .map(|ch| {
                let mut buffer: Vec<Complex<f64>> = image[ch * hw..(ch + 1) * hw]
                    .iter()
                    .map(|&v| Complex::new(v, 0.0))
                    .collect();
                fft.forward(&mut buffer);
                buffer
            })
            .collect();

        let mut stacked = DVector::<f64>::zeros(2 * c);
        for bin in 0..hw {
            for ch in 0..c {
                stacked[ch] = spectra[ch][bin].re;
                stacked[c + ch] = spectra[ch][bin].im;
            }
            let solved = &inverses[bin] * &stacked;
            for ch in 0..c {
                spectra[ch][bin] = Complex::new(solved[ch], solved[c + ch]);
            }
        }

        let [sh, sw] = self.shift();
        let mut out = vec![0.0; c * hw];
        for (ch, spectrum) in spectra.iter_mut().enumerate() {
            fft.inverse(spectrum);
            for r in 0..h {
                for col in 0..w {
                    let src = ((r + sh) % h) * w + (col + sw) % w;
                    out[ch * hw + r * w + col] = spectrum[src].re;
                }
            }
        }
        out
    }
}
