//! Normalisation statistics over global joint positions.
//!
//! Computed once per split and read-only afterwards. Callers evaluating on the
//! test split are expected to pass statistics computed on the training split.

use candle_core::{Device, Tensor};
use ndarray::{Array2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::InbetweenError;
use crate::window::MotionWindow;
use crate::InbetweenResult;

/// Per-channel spread of global positions, shape `(joints, 3)`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizationStatistics {
    mean: Array2<f32>,
    std: Array2<f32>,
    /// Number of frames aggregated
    samples: usize,
}

struct Moments {
    sum: Array2<f64>,
    sum_sq: Array2<f64>,
    samples: usize,
}

impl Moments {
    fn of(window: &MotionWindow) -> Self {
        let positions = window.global_positions.mapv(f64::from);
        Self {
            sum: positions.sum_axis(Axis(0)),
            sum_sq: positions.mapv(|v| v * v).sum_axis(Axis(0)),
            samples: window.len(),
        }
    }

    fn merge(self, other: Self) -> Self {
        Self {
            sum: self.sum + other.sum,
            sum_sq: self.sum_sq + other.sum_sq,
            samples: self.samples + other.samples,
        }
    }
}

impl NormalizationStatistics {
    /// Aggregate over the window and frame axes of every window
    pub fn compute(windows: &[MotionWindow]) -> InbetweenResult<Self> {
        let first = windows.first().ok_or_else(|| {
            InbetweenError::InvalidParameter("cannot compute statistics over zero windows".into())
        })?;
        let joints = first.num_joints();
        if let Some(w) = windows.iter().find(|w| w.num_joints() != joints) {
            return Err(InbetweenError::DimensionMismatch {
                context: "statistics joints",
                expected: joints,
                got: w.num_joints(),
            });
        }

        let moments = windows
            .par_iter()
            .map(Moments::of)
            .reduce_with(Moments::merge)
            .ok_or_else(|| InbetweenError::ComputationError("empty reduction".into()))?;

        let n = moments.samples as f64;
        let mean = &moments.sum / n;
        let variance = (&moments.sum_sq / n - &mean * &mean).mapv(|v| v.max(0.0));

        let stats = Self {
            mean: mean.mapv(|v| v as f32),
            std: variance.mapv(|v| v.sqrt() as f32),
            samples: moments.samples,
        };
        log::info!(
            "Computed position statistics over {} windows ({} frames, {} joints)",
            windows.len(),
            stats.samples,
            joints
        );
        Ok(stats)
    }

    pub fn mean(&self) -> &Array2<f32> {
        &self.mean
    }

    pub fn std(&self) -> &Array2<f32> {
        &self.std
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    pub fn num_joints(&self) -> usize {
        self.std.len_of(Axis(0))
    }

    pub fn mean_tensor(&self, device: &Device) -> InbetweenResult<Tensor> {
        Ok(Tensor::from_iter(self.mean.iter().copied(), device)?.reshape(self.mean.dim())?)
    }

    pub fn std_tensor(&self, device: &Device) -> InbetweenResult<Tensor> {
        Ok(Tensor::from_iter(self.std.iter().copied(), device)?.reshape(self.std.dim())?)
    }

    /// `(positions - mean) / std` for `(..., joints, 3)` positions
    pub fn normalize(&self, positions: &Tensor) -> InbetweenResult<Tensor> {
        let mean = self.mean_tensor(positions.device())?;
        let std = self.std_tensor(positions.device())?.maximum(1e-8)?;
        Ok(positions.broadcast_sub(&mean)?.broadcast_div(&std)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array1, Array3};

    fn window_with_positions(values: &[f32]) -> MotionWindow {
        let frames = values.len();
        let mut global = Array3::<f32>::zeros((frames, 1, 3));
        for (t, v) in values.iter().enumerate() {
            global[[t, 0, 0]] = *v;
            global[[t, 0, 1]] = 2.0 * v;
        }
        MotionWindow {
            clip: "synthetic".into(),
            start_frame: 0,
            local_rotations: Array3::zeros((frames, 1, 4)),
            root_positions: Array2::zeros((frames, 3)),
            root_velocities: Array2::zeros((frames, 3)),
            global_positions: global,
            contacts: Array2::zeros((frames, 0)),
            condition: Array1::zeros(0),
        }
    }

    #[test]
    fn test_population_std_over_windows_and_frames() {
        let windows = vec![
            window_with_positions(&[1.0, 2.0]),
            window_with_positions(&[3.0, 4.0]),
        ];
        let stats = NormalizationStatistics::compute(&windows).unwrap();

        assert_eq!(stats.samples(), 4);
        assert_eq!(stats.std().dim(), (1, 3));
        // values 1..4: mean 2.5, population variance 1.25
        assert!((stats.mean()[[0, 0]] - 2.5).abs() < 1e-6);
        assert!((stats.std()[[0, 0]] - 1.25f32.sqrt()).abs() < 1e-6);
        assert!((stats.std()[[0, 1]] - 2.0 * 1.25f32.sqrt()).abs() < 1e-5);
        assert_eq!(stats.std()[[0, 2]], 0.0);
    }

    #[test]
    fn test_empty_windows_rejected() {
        assert!(NormalizationStatistics::compute(&[]).is_err());
    }

    #[test]
    fn test_normalize_is_finite_for_constant_channel() {
        let windows = vec![window_with_positions(&[1.0, 3.0])];
        let stats = NormalizationStatistics::compute(&windows).unwrap();
        let positions = Tensor::new(&[[[3.0f32, 6.0, 0.0]]], &Device::Cpu).unwrap();

        let out: Vec<f32> = stats
            .normalize(&positions)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert!((out[0] - 1.0).abs() < 1e-5);
        assert!((out[1] - 1.0).abs() < 1e-5);
        assert_eq!(out[2], 0.0);
    }
}
