//! Per-epoch learning-rate and loss-weight schedules.

use super::config::LrSchedule;

/// Flat for the first half of training, then linear decay to 1% of `base`
/// at 90%, flat afterwards.
pub fn wilson_schedule(base: f64, epoch: usize, num_epochs: usize) -> f64 {
    let t = epoch as f64 / num_epochs.max(1) as f64;
    let min_ratio = 0.01;
    let factor = if t <= 0.5 {
        1.0
    } else if t <= 0.9 {
        1.0 - (1.0 - min_ratio) * (t - 0.5) / 0.4
    } else {
        min_ratio
    };
    base * factor
}

/// Ramps linearly to `final_value` over `num_epochs` epochs counted from
/// `start_epoch`, reaching it at epoch `start_epoch + num_epochs - 1`.
pub fn linear_rampup(final_value: f64, epoch: usize, num_epochs: usize, start_epoch: usize) -> f64 {
    let t = (epoch as f64 - start_epoch as f64 + 1.0) / num_epochs.max(1) as f64;
    t.min(1.0) * final_value
}

impl LrSchedule {
    pub fn learning_rate(&self, base: f64, epoch: usize, num_epochs: usize) -> f64 {
        match self {
            LrSchedule::Constant => base,
            LrSchedule::Wilson => wilson_schedule(base, epoch, num_epochs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, 1.0)]
    #[case(50, 1.0)]
    #[case(70, 0.505)]
    #[case(90, 0.01)]
    #[case(99, 0.01)]
    fn test_wilson_schedule(#[case] epoch: usize, #[case] factor: f64) {
        let lr = wilson_schedule(0.1, epoch, 100);
        assert!((lr - 0.1 * factor).abs() < 1e-12, "epoch {epoch}: {lr}");
    }

    #[test]
    fn test_linear_rampup() {
        assert!((linear_rampup(2.0, 0, 4, 0) - 0.5).abs() < 1e-12);
        assert!((linear_rampup(2.0, 3, 4, 0) - 2.0).abs() < 1e-12);
        assert!((linear_rampup(2.0, 10, 4, 0) - 2.0).abs() < 1e-12);
        // counted from the resumed epoch
        assert!((linear_rampup(2.0, 5, 4, 5) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_constant_schedule() {
        assert_eq!(LrSchedule::Constant.learning_rate(0.3, 80, 100), 0.3);
        assert!(LrSchedule::Wilson.learning_rate(0.3, 80, 100) < 0.3);
    }
}
