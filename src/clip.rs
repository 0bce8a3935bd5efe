//! # Motion Clips
//!
//! Raw motion-capture takes as the engine receives them: per-frame local joint
//! rotations plus a root translation, tagged with a subject and an action
//! label. Clips are stored as JSON (one clip per file) and loaded as-is;
//! parsing of BVH or other capture formats happens upstream.
//!
//! File names follow the LAFAN1 convention `<action>_<subject>.json`, so a
//! clip without an explicit `subject` takes it from the name suffix.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::InbetweenError;
use crate::InbetweenResult;

/// Largest accepted deviation of a stored quaternion's norm from 1
pub const UNIT_NORM_TOLERANCE: f32 = 1e-4;

/// One immutable capture take
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotionClip {
    /// Clip identifier, e.g. `dance2_subject3`
    pub name: String,
    #[serde(default)]
    pub subject: String,
    /// Free-text action label; defaults to the name
    #[serde(default)]
    pub label: String,
    /// Local joint rotations `[frame][joint] = (w, x, y, z)`
    pub rotations: Vec<Vec<[f32; 4]>>,
    /// Root translation per frame
    pub root_positions: Vec<[f32; 3]>,
    /// Authored left-foot contact flags `[frame][channel]`
    #[serde(default)]
    pub left_contacts: Option<Vec<Vec<f32>>>,
    /// Authored right-foot contact flags `[frame][channel]`
    #[serde(default)]
    pub right_contacts: Option<Vec<Vec<f32>>>,
}

impl MotionClip {
    pub fn new(
        name: impl Into<String>,
        subject: impl Into<String>,
        label: impl Into<String>,
        rotations: Vec<Vec<[f32; 4]>>,
        root_positions: Vec<[f32; 3]>,
    ) -> Self {
        Self {
            name: name.into(),
            subject: subject.into(),
            label: label.into(),
            rotations,
            root_positions,
            left_contacts: None,
            right_contacts: None,
        }
    }

    pub fn with_contacts(mut self, left: Vec<Vec<f32>>, right: Vec<Vec<f32>>) -> Self {
        self.left_contacts = Some(left);
        self.right_contacts = Some(right);
        self
    }

    pub fn from_file(path: impl AsRef<Path>) -> InbetweenResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| InbetweenError::Io(format!("Failed to read clip {:?}: {}", path, e)))?;
        let mut clip: Self = serde_json::from_str(&content)?;
        clip.fill_defaults();
        Ok(clip)
    }

    fn fill_defaults(&mut self) {
        if self.subject.is_empty() {
            if let Some((_, subject)) = self.name.rsplit_once('_') {
                self.subject = subject.to_string();
            }
        }
        if self.label.is_empty() {
            self.label = self.name.clone();
        }
    }

    pub fn num_frames(&self) -> usize {
        self.rotations.len()
    }

    /// Check per-frame tables against the skeleton's joint count.
    ///
    /// Rotations must be finite unit quaternions, and authored contacts come
    /// as a left and right pair or not at all.
    pub fn validate(&self, num_joints: usize, contact_channels: (usize, usize)) -> InbetweenResult<()> {
        let malformed = |reason: String| InbetweenError::MalformedClip {
            clip: self.name.clone(),
            reason,
        };

        if self.root_positions.len() != self.rotations.len() {
            return Err(malformed(format!(
                "{} rotation frames but {} root frames",
                self.rotations.len(),
                self.root_positions.len()
            )));
        }
        if let Some((frame, joints)) = self
            .rotations
            .iter()
            .enumerate()
            .find(|(_, frame)| frame.len() != num_joints)
        {
            return Err(malformed(format!(
                "frame {} has {} joints, skeleton has {}",
                frame,
                joints.len(),
                num_joints
            )));
        }
        for (t, frame) in self.rotations.iter().enumerate() {
            for (j, q) in frame.iter().enumerate() {
                let norm = q.iter().map(|v| v * v).sum::<f32>().sqrt();
                if !norm.is_finite() || (norm - 1.0).abs() > UNIT_NORM_TOLERANCE {
                    return Err(malformed(format!(
                        "frame {} joint {} rotation has norm {}",
                        t, j, norm
                    )));
                }
            }
        }

        if self.left_contacts.is_some() != self.right_contacts.is_some() {
            return Err(malformed("contacts must be authored for both feet or neither".into()));
        }
        let streams = [
            ("left", &self.left_contacts, contact_channels.0),
            ("right", &self.right_contacts, contact_channels.1),
        ];
        for (side, stream, channels) in streams {
            if let Some(stream) = stream {
                if stream.len() != self.num_frames() {
                    return Err(malformed(format!(
                        "{} contacts cover {} frames, clip has {}",
                        side,
                        stream.len(),
                        self.num_frames()
                    )));
                }
                if stream.iter().any(|frame| frame.len() != channels) {
                    return Err(malformed(format!(
                        "{} contacts must have {} channels per frame",
                        side, channels
                    )));
                }
            }
        }
        Ok(())
    }
}

/// All clips found in a data directory
#[derive(Debug, Clone, Default)]
pub struct ClipLibrary {
    clips: Vec<MotionClip>,
}

impl ClipLibrary {
    pub fn new(clips: Vec<MotionClip>) -> Self {
        let mut library = Self { clips };
        library.clips.iter_mut().for_each(MotionClip::fill_defaults);
        library
    }

    /// Load every `*.json` clip in `dir`, sorted by file name
    pub fn from_directory(dir: impl AsRef<Path>) -> InbetweenResult<Self> {
        let dir = dir.as_ref();
        let mut paths = Vec::new();
        for entry in fs::read_dir(dir).map_err(|e| InbetweenError::Io(format!("{:?}: {}", dir, e)))? {
            let path = entry?.path();
            if path.is_file() && path.extension().and_then(|e| e.to_str()) == Some("json") {
                paths.push(path);
            }
        }
        paths.sort();

        let clips = paths
            .iter()
            .map(MotionClip::from_file)
            .collect::<InbetweenResult<Vec<_>>>()?;
        log::info!("Loaded {} clips from {:?}", clips.len(), dir);
        Ok(Self { clips })
    }

    pub fn len(&self) -> usize {
        self.clips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clips.is_empty()
    }

    pub fn clips(&self) -> &[MotionClip] {
        &self.clips
    }

    /// Clips whose subject is in `subjects`, in library order
    pub fn select<'a>(&'a self, subjects: &'a [String]) -> impl Iterator<Item = &'a MotionClip> + 'a {
        self.clips
            .iter()
            .filter(move |clip| subjects.iter().any(|s| *s == clip.subject))
    }
}
