//! # Evaluation Metrics
//!
//! Reconstruction error of generated frames against ground truth.
//!
//! - **L2Q**: per frame, the L2 norm of the difference of all joint
//!   quaternions stacked into one vector; averaged over frames and sequences.
//! - **L2P**: the same on global joint positions after normalising both sides
//!   with the training-split statistics.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use motion_inbetween::metrics::{evaluate, EvaluationSummary};
//!
//! let mut summary = EvaluationSummary::default();
//! for batch in loader {
//!     let batch = batch?;
//!     let generated = model.generate(&batch, &config.generation, Some(&skeleton), None)?;
//!     summary.add(&evaluate(&generated, &batch, train.stats())?);
//! }
//! log::info!("{}", summary);
//! ```

use std::fmt;

use candle_core::{Tensor, D};

use crate::dataset::WindowBatch;
use crate::error::InbetweenError;
use crate::generation::GeneratedSequence;
use crate::stats::NormalizationStatistics;
use crate::InbetweenResult;

/// Mean per-frame L2 distance between `[batch, frames, ...]` tensors
fn mean_frame_distance(predicted: &Tensor, truth: &Tensor) -> InbetweenResult<f32> {
    if predicted.dims() != truth.dims() {
        return Err(InbetweenError::InvalidParameter(format!(
            "cannot compare shapes {:?} and {:?}",
            predicted.dims(),
            truth.dims()
        )));
    }
    let (b, t) = (predicted.dims()[0], predicted.dims()[1]);
    let diff = (predicted - truth)?.reshape((b, t, ()))?;
    let distance = diff.sqr()?.sum(D::Minus1)?.sqrt()?;
    Ok(distance.mean_all()?.to_scalar::<f32>()?)
}

/// L2Q over `[batch, frames, joints, 4]` rotations
pub fn l2q(predicted: &Tensor, truth: &Tensor) -> InbetweenResult<f32> {
    mean_frame_distance(predicted, truth)
}

/// L2P over `[batch, frames, joints, 3]` global positions
pub fn l2p(predicted: &Tensor, truth: &Tensor, stats: &NormalizationStatistics) -> InbetweenResult<f32> {
    mean_frame_distance(&stats.normalize(predicted)?, &stats.normalize(truth)?)
}

/// Errors of one generated batch
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvaluationReport {
    pub sequences: usize,
    pub frames: usize,
    pub l2q: f32,
    /// Present when the generation ran forward kinematics
    pub l2p: Option<f32>,
}

/// Compare predicted frames `1..W` with the batch's ground truth
pub fn evaluate(
    generated: &GeneratedSequence,
    batch: &WindowBatch,
    stats: &NormalizationStatistics,
) -> InbetweenResult<EvaluationReport> {
    let frames = generated.frames();
    let truth_rotations = batch.local_rotations.narrow(1, 1, frames)?;
    let l2q = l2q(&generated.rotations, &truth_rotations)?;

    let l2p = match &generated.global_positions {
        Some(positions) => {
            let truth = batch.global_positions.narrow(1, 1, frames)?;
            Some(l2p(positions, &truth, stats)?)
        }
        None => None,
    };

    Ok(EvaluationReport {
        sequences: generated.batch_size(),
        frames,
        l2q,
        l2p,
    })
}

/// Sequence-weighted running mean over many batches
#[derive(Debug, Clone, Default)]
pub struct EvaluationSummary {
    sequences: usize,
    l2q_sum: f64,
    l2p_sum: f64,
    l2p_sequences: usize,
}

impl EvaluationSummary {
    pub fn add(&mut self, report: &EvaluationReport) {
        let n = report.sequences as f64;
        self.sequences += report.sequences;
        self.l2q_sum += report.l2q as f64 * n;
        if let Some(l2p) = report.l2p {
            self.l2p_sum += l2p as f64 * n;
            self.l2p_sequences += report.sequences;
        }
    }

    pub fn sequences(&self) -> usize {
        self.sequences
    }

    pub fn l2q(&self) -> Option<f64> {
        (self.sequences > 0).then(|| self.l2q_sum / self.sequences as f64)
    }

    pub fn l2p(&self) -> Option<f64> {
        (self.l2p_sequences > 0).then(|| self.l2p_sum / self.l2p_sequences as f64)
    }
}

impl fmt::Display for EvaluationSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} sequences", self.sequences)?;
        if let Some(l2q) = self.l2q() {
            write!(f, ", L2Q {:.4}", l2q)?;
        }
        if let Some(l2p) = self.l2p() {
            write!(f, ", L2P {:.4}", l2p)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_identical_inputs_have_zero_error() {
        let device = Device::Cpu;
        let q = Tensor::randn(0f32, 1.0, (2, 3, 5, 4), &device).unwrap();
        assert_eq!(l2q(&q, &q).unwrap(), 0.0);
    }

    #[test]
    fn test_l2q_is_per_frame_norm() {
        let device = Device::Cpu;
        let a = Tensor::zeros((1, 2, 2, 4), DType::F32, &device).unwrap();
        // frame 0 differs by (3, 4) spread over two joints, frame 1 by nothing
        let mut values = vec![0.0f32; 16];
        values[0] = 3.0;
        values[4] = 4.0;
        let b = Tensor::from_vec(values, (1, 2, 2, 4), &device).unwrap();
        assert!((l2q(&a, &b).unwrap() - 2.5).abs() < 1e-6);
    }

    #[test]
    fn test_shape_mismatch() {
        let device = Device::Cpu;
        let a = Tensor::zeros((1, 2, 2, 4), DType::F32, &device).unwrap();
        let b = Tensor::zeros((1, 3, 2, 4), DType::F32, &device).unwrap();
        assert!(l2q(&a, &b).is_err());
    }

    #[test]
    fn test_summary_weights_by_sequences() {
        let mut summary = EvaluationSummary::default();
        assert!(summary.l2q().is_none());
        summary.add(&EvaluationReport {
            sequences: 1,
            frames: 9,
            l2q: 1.0,
            l2p: None,
        });
        summary.add(&EvaluationReport {
            sequences: 3,
            frames: 9,
            l2q: 3.0,
            l2p: Some(2.0),
        });
        assert_eq!(summary.sequences(), 4);
        assert!((summary.l2q().unwrap() - 2.5).abs() < 1e-9);
        assert!((summary.l2p().unwrap() - 2.0).abs() < 1e-9);
        assert!(summary.to_string().contains("L2Q 2.5000"));
    }
}
