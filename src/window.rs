//! # Window Extraction
//!
//! Slides a fixed-length view across each clip and derives everything the
//! generator consumes from the slice: global positions via forward
//! kinematics, root velocity, foot contacts and a coarse semantic condition.
//!
//! ```text
//! clip frames:  |0 ........................................ L-1|
//! windows:      [0, W)  [S, S+W)  [2S, 2S+W) ...   (tail < W dropped)
//! count:        floor((L - W) / S) + 1   when L >= W, else 0
//! ```
//!
//! With facing normalisation enabled, each window is first turned about the
//! vertical axis so the root heads towards +X on a chosen key frame; root
//! positions, root rotations, velocities and FK positions all live in that
//! turned frame.
//!
//! Clips are independent, so extraction fans out over rayon; output keeps
//! clip order and, inside a clip, start-frame order.

use candle_core::{Device, Tensor};
use ndarray::{s, Array1, Array2, Array3, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::clip::MotionClip;
use crate::error::InbetweenError;
use crate::quat;
use crate::skeleton::{ForwardKinematics, RotationRepr, Skeleton};
use crate::InbetweenResult;

/// Keyword vocabulary for the semantic condition vector.
///
/// A label activates the slot of the first keyword it contains; labels that
/// match nothing get the zero vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionVocabulary {
    keywords: Vec<String>,
}

impl ConditionVocabulary {
    pub fn new(keywords: Vec<String>) -> Self {
        Self { keywords }
    }

    pub fn dim(&self) -> usize {
        self.keywords.len()
    }

    pub fn encode(&self, label: &str) -> Array1<f32> {
        let mut condition = Array1::zeros(self.dim());
        if let Some(slot) = self.keywords.iter().position(|k| label.contains(k.as_str())) {
            condition[slot] = 1.0;
        }
        condition
    }
}

impl Default for ConditionVocabulary {
    fn default() -> Self {
        Self::new(vec!["dance".to_string(), "jump".to_string()])
    }
}

/// Per-window yaw normalisation of the root.
///
/// On frame `frame` of every window, the root joint's `forward_axis` (in the
/// root's local space, Y up) is projected onto the ground and turned onto
/// +X. The same yaw is applied to every frame's root rotation and root
/// position, so the motion is unchanged up to a rigid turn about the origin.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FacingNormalization {
    /// Window-relative key frame
    pub frame: usize,
    /// Root-local axis that points where the character faces
    pub forward_axis: [f32; 3],
}

impl Default for FacingNormalization {
    /// LAFAN1: the hips' local Y points forward, tenth frame faces +X
    fn default() -> Self {
        Self {
            frame: 9,
            forward_axis: [0.0, 1.0, 0.0],
        }
    }
}

impl FacingNormalization {
    /// Yaw correction for a root rotation; `None` if its forward is vertical
    pub fn correction(&self, root_rotation: [f32; 4]) -> Option<[f32; 4]> {
        quat::yaw_to_x(quat::rotate_host(root_rotation, self.forward_axis), 1e-6)
    }

    /// Turn the root joint (joint 0) and root positions in place
    pub fn apply(&self, local_rotations: &mut Array3<f32>, root_positions: &mut Array2<f32>) {
        let key = [0, 1, 2, 3].map(|k| local_rotations[[self.frame, 0, k]]);
        let Some(yaw) = self.correction(key) else {
            return;
        };
        for t in 0..local_rotations.len_of(Axis(0)) {
            let q = [0, 1, 2, 3].map(|k| local_rotations[[t, 0, k]]);
            for (k, v) in quat::mul_host(yaw, q).into_iter().enumerate() {
                local_rotations[[t, 0, k]] = v;
            }
            let p = [0, 1, 2].map(|k| root_positions[[t, k]]);
            for (k, v) in quat::rotate_host(yaw, p).into_iter().enumerate() {
                root_positions[[t, k]] = v;
            }
        }
    }
}

/// A fixed-length slice of a clip with its derived quantities
#[derive(Debug, Clone)]
pub struct MotionWindow {
    pub clip: String,
    pub start_frame: usize,
    /// `(frames, joints, 4)` unit quaternions
    pub local_rotations: Array3<f32>,
    /// `(frames, 3)`
    pub root_positions: Array2<f32>,
    /// `(frames, 3)`; row 0 is zero, row t is `root[t] - root[t-1]`
    pub root_velocities: Array2<f32>,
    /// `(frames, joints, 3)`, forward kinematics of the two fields above
    pub global_positions: Array3<f32>,
    /// `(frames, contact channels)`, left feet then right feet
    pub contacts: Array2<f32>,
    /// Semantic condition, constant over the window
    pub condition: Array1<f32>,
}

impl MotionWindow {
    pub fn len(&self) -> usize {
        self.local_rotations.len_of(Axis(0))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_joints(&self) -> usize {
        self.local_rotations.len_of(Axis(1))
    }

    /// Rotations the generator steers towards: the last frame
    pub fn target_rotations(&self) -> ArrayView2<'_, f32> {
        self.local_rotations.index_axis(Axis(0), self.len() - 1)
    }

    /// Root position the generator steers towards: the last frame
    pub fn target_root(&self) -> ArrayView1<'_, f32> {
        self.root_positions.index_axis(Axis(0), self.len() - 1)
    }
}

pub(crate) fn tensor_to_array3(t: &Tensor) -> InbetweenResult<Array3<f32>> {
    let (a, b, c) = t.dims3()?;
    let data = t.flatten_all()?.to_vec1::<f32>()?;
    Array3::from_shape_vec((a, b, c), data)
        .map_err(|e| InbetweenError::InvalidParameter(format!("tensor to array: {}", e)))
}

/// Turns clips into windows
#[derive(Debug, Clone)]
pub struct WindowExtractor<'a> {
    skeleton: &'a Skeleton,
    window_length: usize,
    stride: usize,
    vocabulary: ConditionVocabulary,
    contact_threshold: f32,
    enforce_continuity: bool,
    facing: Option<FacingNormalization>,
}

impl<'a> WindowExtractor<'a> {
    pub fn new(skeleton: &'a Skeleton, window_length: usize, stride: usize) -> InbetweenResult<Self> {
        if window_length < 2 {
            return Err(InbetweenError::InvalidParameter(format!(
                "window length must be at least 2, got {}",
                window_length
            )));
        }
        if stride == 0 {
            return Err(InbetweenError::InvalidParameter("stride must be positive".into()));
        }
        Ok(Self {
            skeleton,
            window_length,
            stride,
            vocabulary: ConditionVocabulary::default(),
            contact_threshold: 0.02,
            enforce_continuity: true,
            facing: None,
        })
    }

    pub fn with_vocabulary(mut self, vocabulary: ConditionVocabulary) -> Self {
        self.vocabulary = vocabulary;
        self
    }

    pub fn with_contact_threshold(mut self, threshold: f32) -> Self {
        self.contact_threshold = threshold;
        self
    }

    pub fn with_continuity(mut self, enforce: bool) -> Self {
        self.enforce_continuity = enforce;
        self
    }

    /// Turn every window to face +X; the key frame must lie inside the window
    pub fn with_facing(mut self, facing: Option<FacingNormalization>) -> InbetweenResult<Self> {
        if let Some(f) = &facing {
            if f.frame >= self.window_length {
                return Err(InbetweenError::InvalidParameter(format!(
                    "facing frame {} outside window of {} frames",
                    f.frame, self.window_length
                )));
            }
        }
        self.facing = facing;
        Ok(self)
    }

    pub fn window_length(&self) -> usize {
        self.window_length
    }

    pub fn condition_dim(&self) -> usize {
        self.vocabulary.dim()
    }

    /// Number of windows a clip of `frames` frames yields
    pub fn window_count(&self, frames: usize) -> usize {
        if frames < self.window_length {
            0
        } else {
            (frames - self.window_length) / self.stride + 1
        }
    }

    /// Extract windows from every clip.
    ///
    /// All clips are validated before any work starts; one malformed clip
    /// fails the whole call.
    pub fn extract(&self, clips: &[&MotionClip]) -> InbetweenResult<Vec<MotionWindow>> {
        let channels = (self.skeleton.left_foot.len(), self.skeleton.right_foot.len());
        for clip in clips {
            clip.validate(self.skeleton.num_joints(), channels)?;
        }

        let per_clip = clips
            .par_iter()
            .map(|clip| self.extract_clip(clip))
            .collect::<InbetweenResult<Vec<Vec<MotionWindow>>>>()?;
        let windows: Vec<MotionWindow> = per_clip.into_iter().flatten().collect();

        log::debug!(
            "Extracted {} windows from {} clips (W={}, S={})",
            windows.len(),
            clips.len(),
            self.window_length,
            self.stride
        );
        Ok(windows)
    }

    fn extract_clip(&self, clip: &MotionClip) -> InbetweenResult<Vec<MotionWindow>> {
        let count = self.window_count(clip.num_frames());
        let condition = self.vocabulary.encode(&clip.label);
        (0..count)
            .map(|i| self.extract_window(clip, i * self.stride, &condition))
            .collect()
    }

    fn extract_window(
        &self,
        clip: &MotionClip,
        start: usize,
        condition: &Array1<f32>,
    ) -> InbetweenResult<MotionWindow> {
        let w = self.window_length;
        let joints = self.skeleton.num_joints();
        let frames = start..start + w;

        let mut local_rotations = Array3::<f32>::zeros((w, joints, 4));
        for (t, frame) in clip.rotations[frames.clone()].iter().enumerate() {
            for (j, q) in frame.iter().enumerate() {
                for (k, v) in q.iter().enumerate() {
                    local_rotations[[t, j, k]] = *v;
                }
            }
        }

        let mut root_positions = Array2::<f32>::zeros((w, 3));
        for (t, p) in clip.root_positions[frames.clone()].iter().enumerate() {
            for (k, v) in p.iter().enumerate() {
                root_positions[[t, k]] = *v;
            }
        }

        if let Some(facing) = &self.facing {
            facing.apply(&mut local_rotations, &mut root_positions);
        }
        if self.enforce_continuity {
            quat::enforce_continuity(&mut local_rotations);
        }

        let mut root_velocities = Array2::<f32>::zeros((w, 3));
        for t in 1..w {
            for k in 0..3 {
                root_velocities[[t, k]] = root_positions[[t, k]] - root_positions[[t - 1, k]];
            }
        }

        let global_positions = self.global_positions(&root_positions, &local_rotations)?;

        let contacts = match (&clip.left_contacts, &clip.right_contacts) {
            (Some(left), Some(right)) => {
                let channels = self.skeleton.contact_dim();
                let mut contacts = Array2::<f32>::zeros((w, channels));
                for (t, frame) in frames.enumerate() {
                    let row = left[frame].iter().chain(right[frame].iter());
                    for (c, v) in row.enumerate() {
                        contacts[[t, c]] = *v;
                    }
                }
                contacts
            }
            _ => self.derive_contacts(&global_positions),
        };

        Ok(MotionWindow {
            clip: clip.name.clone(),
            start_frame: start,
            local_rotations,
            root_positions,
            root_velocities,
            global_positions,
            contacts,
            condition: condition.clone(),
        })
    }

    fn global_positions(
        &self,
        root_positions: &Array2<f32>,
        local_rotations: &Array3<f32>,
    ) -> InbetweenResult<Array3<f32>> {
        let device = Device::Cpu;
        let (w, joints, _) = local_rotations.dim();
        let root = Tensor::from_iter(root_positions.iter().copied(), &device)?.reshape((w, 3))?;
        let rotations =
            Tensor::from_iter(local_rotations.iter().copied(), &device)?.reshape((w, joints, 4))?;
        let positions = self
            .skeleton
            .forward_kinematics(&root, &rotations, RotationRepr::Quaternion)?;
        tensor_to_array3(&positions)
    }

    /// A foot joint is planted when its squared frame-to-frame displacement
    /// is under the threshold; the last frame repeats its predecessor.
    fn derive_contacts(&self, global_positions: &Array3<f32>) -> Array2<f32> {
        let w = global_positions.len_of(Axis(0));
        let feet: Vec<usize> = self
            .skeleton
            .left_foot
            .iter()
            .chain(self.skeleton.right_foot.iter())
            .copied()
            .collect();
        let mut contacts = Array2::<f32>::zeros((w, feet.len()));
        for t in 0..w - 1 {
            for (c, &j) in feet.iter().enumerate() {
                let step = &global_positions.slice(s![t + 1, j, ..]) - &global_positions.slice(s![t, j, ..]);
                let speed_sq: f32 = step.iter().map(|v| v * v).sum();
                contacts[[t, c]] = if speed_sq < self.contact_threshold { 1.0 } else { 0.0 };
            }
        }
        for c in 0..feet.len() {
            contacts[[w - 1, c]] = contacts[[w - 2, c]];
        }
        contacts
    }
}
