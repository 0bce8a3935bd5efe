//! # Generation Loop
//!
//! Autoregressive in-betweening of a batch of windows. Frame 0 of each window
//! seeds the loop, the last frame is the target, and the loop predicts frames
//! `1..W` one step at a time.
//!
//! ```text
//!            t = 0                1 <= t < W-1              t = W-1
//!  Seeded ───────────► Predicting ───────────► ... ───────► Done
//!  (ground truth)      (previous prediction)
//! ```
//!
//! One step:
//!
//! ```text
//! offset  = target - current
//! h_s     = pe(t) + StateEncoder(rot ‖ root_vel ‖ contact)
//! h_o     = pe(t) + OffsetEncoder(root_offset ‖ rot_offset)
//! h_t     = pe(t) + TargetEncoder(target_rot)
//! cond[t] = marker                       (permanent for this batch)
//! h       = LSTM(h_s ‖ h_o ‖ h_t ‖ cond[t])
//! rot'    = normalize(rot + Δrot)
//! root'   = root + Δroot
//! ```
//!
//! The step state is a value: [`InbetweenModel::advance`] consumes one
//! [`GenerationState`] and returns the next. Only the recurrent core keeps
//! memory between steps, and it is reset at the start of every batch.

use candle_core::{Device, Tensor};
use ndarray::{Array3, Axis};

use crate::config::GenerationConfig;
use crate::dataset::WindowBatch;
use crate::dims::{Features, QUAT_DIM};
use crate::error::InbetweenError;
use crate::export::{FrameRecord, FrameSink};
use crate::model::InbetweenModel;
use crate::quat;
use crate::skeleton::{ForwardKinematics, RotationRepr};
use crate::InbetweenResult;

/// Where the loop is for a window of a given length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Values come from ground truth
    Seeded,
    /// Values come from the previous prediction
    Predicting,
    /// All `W - 1` steps taken
    Done,
}

impl Phase {
    pub fn at(step: usize, window_length: usize) -> Self {
        if step + 1 >= window_length {
            Phase::Done
        } else if step == 0 {
            Phase::Seeded
        } else {
            Phase::Predicting
        }
    }
}

/// Pose fed into one step, all `(batch, width)`
#[derive(Debug, Clone)]
pub struct GenerationState {
    pub step: usize,
    pub root_position: Tensor,
    pub root_velocity: Tensor,
    /// Flattened `joints * 4`
    pub rotations: Tensor,
    pub contact: Tensor,
}

impl GenerationState {
    /// Ground-truth values of frame 0.
    ///
    /// The root velocity starts at zero, matching the window's frame-0
    /// velocity, rather than the `root[1] - root[0]` seed of LAFAN1 tooling.
    pub fn seed(batch: &WindowBatch) -> InbetweenResult<Self> {
        let b = batch.batch_size();
        let joints = batch.num_joints();
        Ok(Self {
            step: 0,
            root_position: batch.root_positions.narrow(1, 0, 1)?.squeeze(1)?,
            root_velocity: batch.root_velocities.narrow(1, 0, 1)?.squeeze(1)?,
            rotations: batch
                .local_rotations
                .narrow(1, 0, 1)?
                .reshape((b, joints * QUAT_DIM))?,
            contact: batch.contacts.narrow(1, 0, 1)?.squeeze(1)?,
        })
    }

    pub fn phase(&self, window_length: usize) -> Phase {
        Phase::at(self.step, window_length)
    }

    pub fn batch_size(&self) -> usize {
        self.root_position.dims()[0]
    }

    /// Rotations as `(batch, joints, 4)`
    pub fn joint_rotations(&self) -> InbetweenResult<Tensor> {
        let (b, width) = self.rotations.dims2()?;
        Ok(self.rotations.reshape((b, width / QUAT_DIM, QUAT_DIM))?)
    }
}

/// Per-batch condition buffer with the "currently generating" marks.
///
/// Column `t` is overwritten with the marker when step `t` runs and stays
/// marked; later columns keep their semantic values until reached.
#[derive(Debug, Clone)]
pub struct ConditionTrack {
    values: Array3<f32>,
    marked: Vec<bool>,
    marker: f32,
}

impl ConditionTrack {
    pub fn new(values: Array3<f32>, marker: f32) -> Self {
        let frames = values.len_of(Axis(1));
        Self {
            values,
            marked: vec![false; frames],
            marker,
        }
    }

    pub fn from_batch(batch: &WindowBatch, marker: f32) -> Self {
        Self::new(batch.conditions.clone(), marker)
    }

    pub fn frames(&self) -> usize {
        self.marked.len()
    }

    pub fn is_marked(&self, t: usize) -> bool {
        self.marked.get(t).copied().unwrap_or(false)
    }

    pub fn mark_generating(&mut self, t: usize) -> InbetweenResult<()> {
        if t >= self.frames() {
            return Err(InbetweenError::ContractViolation(format!(
                "condition column {} beyond window of {}",
                t,
                self.frames()
            )));
        }
        self.values.index_axis_mut(Axis(1), t).fill(self.marker);
        self.marked[t] = true;
        Ok(())
    }

    /// Column `t` as a `(batch, condition)` tensor
    pub fn column(&self, t: usize, device: &Device) -> InbetweenResult<Tensor> {
        let column = self.values.index_axis(Axis(1), t);
        let (b, k) = column.dim();
        Ok(Tensor::from_iter(column.iter().copied(), device)?.reshape((b, k))?)
    }

    pub fn values(&self) -> &Array3<f32> {
        &self.values
    }

    pub fn into_values(self) -> Array3<f32> {
        self.values
    }
}

/// Predicted frames `1..W` of a batch
#[derive(Debug, Clone)]
pub struct GeneratedSequence {
    pub sequence_ids: Vec<usize>,
    /// `[batch, W-1, joints, 4]`
    pub rotations: Tensor,
    /// `[batch, W-1, 3]`
    pub root_positions: Tensor,
    /// `[batch, W-1, 3]`
    pub root_velocities: Tensor,
    /// `[batch, W-1, contacts]`
    pub contacts: Tensor,
    /// `[batch, W-1, joints, 3]`, when forward kinematics ran
    pub global_positions: Option<Tensor>,
    /// Condition buffer after the loop
    pub conditions: Array3<f32>,
}

impl GeneratedSequence {
    pub fn frames(&self) -> usize {
        self.rotations.dims()[1]
    }

    pub fn batch_size(&self) -> usize {
        self.sequence_ids.len()
    }
}

#[derive(Default)]
struct Frames {
    rotations: Vec<Tensor>,
    root_positions: Vec<Tensor>,
    root_velocities: Vec<Tensor>,
    contacts: Vec<Tensor>,
    global_positions: Vec<Tensor>,
}

impl InbetweenModel {
    fn check_batch(&self, batch: &WindowBatch) -> InbetweenResult<()> {
        let dims = self.dims();
        let checks = [
            ("batch joints", dims.num_joints, batch.num_joints()),
            ("batch contacts", dims.contact_dim, batch.contacts.dims()[2]),
            ("batch condition", dims.condition_dim, batch.conditions.len_of(Axis(2))),
        ];
        for (context, expected, got) in checks {
            if expected != got {
                return Err(InbetweenError::DimensionMismatch {
                    context,
                    expected,
                    got,
                });
            }
        }
        if batch.window_length() < 2 {
            return Err(InbetweenError::InvalidParameter(format!(
                "window of {} frames has nothing to generate",
                batch.window_length()
            )));
        }
        if batch.window_length() > self.spec.max_len {
            return Err(InbetweenError::InvalidParameter(format!(
                "window of {} frames exceeds the time encoding's {} frames",
                batch.window_length(),
                self.spec.max_len
            )));
        }
        Ok(())
    }

    /// Run all `W - 1` steps for `batch`.
    ///
    /// When `fk` is given and `config.compute_global_positions` is set, every
    /// predicted frame is passed through forward kinematics and, if a sink is
    /// attached, handed to it together with the ground-truth positions.
    pub fn generate(
        &mut self,
        batch: &WindowBatch,
        config: &GenerationConfig,
        fk: Option<&dyn ForwardKinematics>,
        mut sink: Option<&mut dyn FrameSink>,
    ) -> InbetweenResult<GeneratedSequence> {
        self.check_batch(batch)?;
        let fk = fk.filter(|_| config.compute_global_positions);
        if sink.is_some() && fk.is_none() {
            return Err(InbetweenError::InvalidParameter(
                "frame export needs forward kinematics".into(),
            ));
        }

        let w = batch.window_length();
        let b = batch.batch_size();
        log::debug!("Generating {} frames for {} sequences", w - 1, b);

        self.core.reset(b)?;
        let mut track = ConditionTrack::from_batch(batch, config.condition_marker);
        let mut state = GenerationState::seed(batch)?;
        let mut frames = Frames::default();

        while state.phase(w) != Phase::Done {
            state = self.advance(state, batch, &mut track, config)?;

            let rotations = state.joint_rotations()?;
            if let Some(fk) = fk {
                let positions =
                    fk.forward_kinematics(&state.root_position, &rotations, RotationRepr::Quaternion)?;
                if let Some(sink) = sink.as_deref_mut() {
                    let truth = batch.global_positions.narrow(1, state.step, 1)?.squeeze(1)?;
                    sink.consume(&FrameRecord {
                        frame: state.step,
                        sequence_ids: &batch.sequence_ids,
                        predicted: &positions,
                        ground_truth: Some(&truth),
                    })?;
                }
                frames.global_positions.push(positions);
            }
            frames.rotations.push(rotations);
            frames.root_positions.push(state.root_position.clone());
            frames.root_velocities.push(state.root_velocity.clone());
            frames.contacts.push(state.contact.clone());
        }

        if let Some(sink) = sink.as_deref_mut() {
            sink.finish()?;
        }
        log::debug!("Finished {} steps", self.core.steps());

        let global_positions = if frames.global_positions.is_empty() {
            None
        } else {
            Some(Tensor::stack(&frames.global_positions, 1)?)
        };
        Ok(GeneratedSequence {
            sequence_ids: batch.sequence_ids.clone(),
            rotations: Tensor::stack(&frames.rotations, 1)?,
            root_positions: Tensor::stack(&frames.root_positions, 1)?,
            root_velocities: Tensor::stack(&frames.root_velocities, 1)?,
            contacts: Tensor::stack(&frames.contacts, 1)?,
            global_positions,
            conditions: track.into_values(),
        })
    }

    /// One step of the loop: consumes the pose at `state.step`, returns the
    /// predicted pose at `state.step + 1`.
    pub fn advance(
        &mut self,
        state: GenerationState,
        batch: &WindowBatch,
        track: &mut ConditionTrack,
        config: &GenerationConfig,
    ) -> InbetweenResult<GenerationState> {
        let t = state.step;
        let dims = *self.dims();

        let (target_b, _) = batch.target_root.dims2()?;
        if target_b != state.batch_size() {
            return Err(InbetweenError::ContractViolation(format!(
                "root offset batch {} does not match current root batch {}",
                target_b,
                state.batch_size()
            )));
        }
        let root_offset = (&batch.target_root - &state.root_position)?;
        let rotation_offset = (&batch.target_rotations - &state.rotations)?;

        let state_in = Features::new(
            Tensor::cat(&[&state.rotations, &state.root_velocity, &state.contact], 1)?,
            &dims,
        )?;
        let offset_in = Features::new(Tensor::cat(&[&root_offset, &rotation_offset], 1)?, &dims)?;
        let target_in = Features::new(batch.target_rotations.clone(), &dims)?;

        let h_state = self
            .time_encoder
            .encode(&self.state_encoder.encode(&state_in)?, t)?;
        let h_offset = self
            .time_encoder
            .encode(&self.offset_encoder.encode(&offset_in)?, t)?;
        let h_target = self
            .time_encoder
            .encode(&self.target_encoder.encode(&target_in)?, t)?;

        track.mark_generating(t)?;
        let condition = track.column(t, &self.device)?;

        let core_in = Features::new(
            Tensor::cat(
                &[
                    h_state.tensor(),
                    h_offset.tensor(),
                    h_target.tensor(),
                    &condition,
                ],
                1,
            )?,
            &dims,
        )?;
        let hidden = self.core.step(&core_in)?;
        let delta = self.decoder.decode(&hidden)?;

        let b = state.batch_size();
        let rotations = (&state.rotations + &delta.rotation_velocity)?
            .reshape((b, dims.num_joints, QUAT_DIM))?;
        let rotations = quat::normalize(&rotations, config.quat_epsilon)?
            .reshape((b, dims.rotation_width()))?;
        let root_position = (&state.root_position + &delta.root_velocity)?;

        Ok(GenerationState {
            step: t + 1,
            root_position,
            root_velocity: delta.root_velocity,
            rotations,
            contact: delta.contact,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelSpec;
    use crate::tests::fixtures;
    use crate::InbetweenConfig;
    use candle_core::IndexOp;

    #[test]
    fn test_phase_transitions() {
        assert_eq!(Phase::at(0, 5), Phase::Seeded);
        assert_eq!(Phase::at(1, 5), Phase::Predicting);
        assert_eq!(Phase::at(3, 5), Phase::Predicting);
        assert_eq!(Phase::at(4, 5), Phase::Done);
    }

    #[test]
    fn test_condition_track_marks_only_reached_columns() {
        let values = Array3::from_elem((2, 5, 2), 1.0f32);
        let mut track = ConditionTrack::new(values, 3.0);
        track.mark_generating(0).unwrap();
        track.mark_generating(1).unwrap();

        assert!(track.is_marked(1));
        assert!(!track.is_marked(2));
        let col: Vec<Vec<f32>> = track.column(1, &Device::Cpu).unwrap().to_vec2().unwrap();
        assert_eq!(col, vec![vec![3.0, 3.0], vec![3.0, 3.0]]);
        let col: Vec<Vec<f32>> = track.column(2, &Device::Cpu).unwrap().to_vec2().unwrap();
        assert_eq!(col, vec![vec![1.0, 1.0], vec![1.0, 1.0]]);
        assert!(track.mark_generating(5).is_err());
    }

    #[test]
    fn test_generate_shapes() {
        let device = Device::Cpu;
        let skeleton = fixtures::humanoid();
        let batch = fixtures::batch(&skeleton, 2, 8, &device);
        let config = InbetweenConfig::tiny();
        let spec = ModelSpec::from_config(&config.model, 22, 4, 2, 8);
        let (mut model, _weights) = InbetweenModel::new_random(spec, &device).unwrap();

        let out = model
            .generate(&batch, &config.generation, Some(&skeleton), None)
            .unwrap();
        assert_eq!(out.frames(), 7);
        assert_eq!(out.rotations.dims(), &[2, 7, 22, 4]);
        assert_eq!(out.contacts.dims(), &[2, 7, 4]);
        assert_eq!(out.global_positions.unwrap().dims(), &[2, 7, 22, 3]);
        assert_eq!(model.core.steps(), 7);
    }

    #[test]
    fn test_advance_rejects_mismatched_root_batch() {
        let device = Device::Cpu;
        let skeleton = fixtures::humanoid();
        let batch = fixtures::batch(&skeleton, 2, 6, &device);
        let config = InbetweenConfig::tiny();
        let spec = ModelSpec::from_config(&config.model, 22, 4, 2, 6);
        let mut model = InbetweenModel::zeros(spec, &device).unwrap();
        model.core.reset(2).unwrap();

        let mut state = GenerationState::seed(&batch).unwrap();
        state.root_position = state.root_position.i(0..1).unwrap();
        let mut track = ConditionTrack::from_batch(&batch, 3.0);
        assert!(matches!(
            model.advance(state, &batch, &mut track, &config.generation),
            Err(InbetweenError::ContractViolation(_))
        ));
    }

    #[test]
    fn test_sink_without_fk_is_rejected() {
        let device = Device::Cpu;
        let skeleton = fixtures::humanoid();
        let batch = fixtures::batch(&skeleton, 1, 6, &device);
        let config = InbetweenConfig::tiny();
        let spec = ModelSpec::from_config(&config.model, 22, 4, 2, 6);
        let mut model = InbetweenModel::zeros(spec, &device).unwrap();
        let mut sink = crate::export::MemorySink::new();

        assert!(model
            .generate(&batch, &config.generation, None, Some(&mut sink))
            .is_err());
    }

    #[test]
    fn test_joint_count_mismatch() {
        let device = Device::Cpu;
        let skeleton = fixtures::humanoid();
        let batch = fixtures::batch(&skeleton, 1, 6, &device);
        let config = InbetweenConfig::tiny();
        let spec = ModelSpec::from_config(&config.model, 21, 4, 2, 6);
        let mut model = InbetweenModel::zeros(spec, &device).unwrap();

        assert!(matches!(
            model.generate(&batch, &config.generation, None, None),
            Err(InbetweenError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_window_longer_than_time_encoding_rejected_up_front() {
        let device = Device::Cpu;
        let skeleton = fixtures::humanoid();
        let batch = fixtures::batch(&skeleton, 2, 8, &device);
        let config = InbetweenConfig::tiny();
        let spec = ModelSpec::from_config(&config.model, 22, 4, 2, 5);
        let mut model = InbetweenModel::zeros(spec, &device).unwrap();

        assert!(matches!(
            model.generate(&batch, &config.generation, None, None),
            Err(InbetweenError::InvalidParameter(_))
        ));
        // The core was never reset, so no step ran
        assert_eq!(model.core.batch_size(), None);
    }
}
