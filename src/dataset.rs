//! # Window Datasets and Batching
//!
//! A [`WindowDataset`] is one split (train or test) of windows extracted from
//! a clip library, together with the position statistics of that split.
//! [`WindowLoader`] turns it into [`WindowBatch`]es of stacked tensors.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use motion_inbetween::dataset::{WindowDataset, WindowLoader};
//!
//! let train = WindowDataset::from_library(&library, &skeleton, &config.data, Split::Train)?;
//! let test = WindowDataset::from_library(&library, &skeleton, &config.data, Split::Test)?;
//!
//! let loader = WindowLoader::new(&test, config.model.batch_size, false, device);
//! for batch in loader {
//!     // batch.local_rotations: [batch, frames, joints, 4]
//! }
//! ```

use candle_core::{Device, Tensor};
use ndarray::{Array3, Axis};
use rand::seq::SliceRandom;
use rand::thread_rng;

use crate::clip::ClipLibrary;
use crate::config::{DataConfig, Split};
use crate::dims::{QUAT_DIM, ROOT_DIM};
use crate::error::InbetweenError;
use crate::skeleton::{ForwardKinematics, Skeleton};
use crate::stats::NormalizationStatistics;
use crate::window::{ConditionVocabulary, MotionWindow, WindowExtractor};
use crate::InbetweenResult;

/// All windows of one split plus their statistics
#[derive(Debug, Clone)]
pub struct WindowDataset {
    split: Split,
    windows: Vec<MotionWindow>,
    stats: NormalizationStatistics,
    window_length: usize,
    num_joints: usize,
    contact_dim: usize,
    condition_dim: usize,
}

impl WindowDataset {
    /// Extract the split's windows from `library`
    pub fn from_library(
        library: &ClipLibrary,
        skeleton: &Skeleton,
        config: &DataConfig,
        split: Split,
    ) -> InbetweenResult<Self> {
        let subjects = config.subjects(split);
        if subjects.is_empty() {
            return Err(InbetweenError::EmptySubjects(split.to_string()));
        }

        let extractor = WindowExtractor::new(skeleton, config.window_length, config.stride(split))?
            .with_vocabulary(ConditionVocabulary::new(config.condition_vocabulary.clone()))
            .with_contact_threshold(config.contact_velocity_threshold)
            .with_continuity(config.enforce_quat_continuity)
            .with_facing(config.facing)?;

        let clips: Vec<_> = library.select(subjects).collect();
        let windows = extractor.extract(&clips)?;
        log::info!(
            "{} split: {} windows from {} clips ({:?})",
            split,
            windows.len(),
            clips.len(),
            subjects
        );

        Self::from_windows(
            split,
            windows,
            config.window_length,
            skeleton.num_joints(),
            skeleton.contact_dim(),
            extractor.condition_dim(),
        )
    }

    pub fn from_windows(
        split: Split,
        windows: Vec<MotionWindow>,
        window_length: usize,
        num_joints: usize,
        contact_dim: usize,
        condition_dim: usize,
    ) -> InbetweenResult<Self> {
        if windows.is_empty() {
            return Err(InbetweenError::InvalidParameter(format!(
                "{} split produced no windows",
                split
            )));
        }
        let stats = NormalizationStatistics::compute(&windows)?;
        Ok(Self {
            split,
            windows,
            stats,
            window_length,
            num_joints,
            contact_dim,
            condition_dim,
        })
    }

    pub fn split(&self) -> Split {
        self.split
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    pub fn windows(&self) -> &[MotionWindow] {
        &self.windows
    }

    pub fn get(&self, idx: usize) -> Option<&MotionWindow> {
        self.windows.get(idx)
    }

    /// Statistics of this split's global positions
    pub fn stats(&self) -> &NormalizationStatistics {
        &self.stats
    }

    pub fn window_length(&self) -> usize {
        self.window_length
    }

    pub fn num_joints(&self) -> usize {
        self.num_joints
    }

    pub fn local_q_dim(&self) -> usize {
        self.num_joints * QUAT_DIM
    }

    pub fn contact_dim(&self) -> usize {
        self.contact_dim
    }

    pub fn condition_dim(&self) -> usize {
        self.condition_dim
    }
}

/// Windows stacked along a leading batch axis
#[derive(Debug, Clone)]
pub struct WindowBatch {
    /// Dataset index of each batch element
    pub sequence_ids: Vec<usize>,
    /// `[batch, frames, joints, 4]`
    pub local_rotations: Tensor,
    /// `[batch, frames, 3]`
    pub root_positions: Tensor,
    /// `[batch, frames, 3]`
    pub root_velocities: Tensor,
    /// `[batch, frames, joints, 3]`
    pub global_positions: Tensor,
    /// `[batch, frames, contacts]`
    pub contacts: Tensor,
    /// `[batch, frames, condition]`, host side so generation can mark it
    pub conditions: Array3<f32>,
    /// `[batch, joints * 4]`, last-frame rotations
    pub target_rotations: Tensor,
    /// `[batch, 3]`, last-frame root position
    pub target_root: Tensor,
}

fn stack<'a, I>(values: I, shape: &[usize], device: &Device) -> InbetweenResult<Tensor>
where
    I: Iterator<Item = &'a f32>,
{
    Ok(Tensor::from_iter(values.copied(), device)?.reshape(shape)?)
}

impl WindowBatch {
    pub fn from_windows(
        windows: &[&MotionWindow],
        sequence_ids: Vec<usize>,
        device: &Device,
    ) -> InbetweenResult<Self> {
        let first = windows
            .first()
            .ok_or_else(|| InbetweenError::InvalidParameter("empty batch".into()))?;
        let b = windows.len();
        let frames = first.len();
        let joints = first.num_joints();
        let contacts = first.contacts.len_of(Axis(1));
        let condition = first.condition.len();

        if sequence_ids.len() != b {
            return Err(InbetweenError::DimensionMismatch {
                context: "batch sequence ids",
                expected: b,
                got: sequence_ids.len(),
            });
        }
        for w in windows {
            if w.len() != frames || w.num_joints() != joints {
                return Err(InbetweenError::InvalidParameter(format!(
                    "window '{}'@{} is {}x{}, batch expects {}x{}",
                    w.clip,
                    w.start_frame,
                    w.len(),
                    w.num_joints(),
                    frames,
                    joints
                )));
            }
        }

        let mut conditions = Array3::<f32>::zeros((b, frames, condition));
        for (i, w) in windows.iter().enumerate() {
            for t in 0..frames {
                conditions
                    .index_axis_mut(Axis(0), i)
                    .index_axis_mut(Axis(0), t)
                    .assign(&w.condition);
            }
        }

        Ok(Self {
            sequence_ids,
            local_rotations: stack(
                windows.iter().flat_map(|w| w.local_rotations.iter()),
                &[b, frames, joints, QUAT_DIM],
                device,
            )?,
            root_positions: stack(
                windows.iter().flat_map(|w| w.root_positions.iter()),
                &[b, frames, ROOT_DIM],
                device,
            )?,
            root_velocities: stack(
                windows.iter().flat_map(|w| w.root_velocities.iter()),
                &[b, frames, ROOT_DIM],
                device,
            )?,
            global_positions: stack(
                windows.iter().flat_map(|w| w.global_positions.iter()),
                &[b, frames, joints, 3],
                device,
            )?,
            contacts: stack(
                windows.iter().flat_map(|w| w.contacts.iter()),
                &[b, frames, contacts],
                device,
            )?,
            conditions,
            target_rotations: stack(
                windows.iter().flat_map(|w| w.target_rotations().into_iter()),
                &[b, joints * QUAT_DIM],
                device,
            )?,
            target_root: stack(
                windows.iter().flat_map(|w| w.target_root().into_iter()),
                &[b, ROOT_DIM],
                device,
            )?,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.sequence_ids.len()
    }

    pub fn window_length(&self) -> usize {
        self.local_rotations.dims()[1]
    }

    pub fn num_joints(&self) -> usize {
        self.local_rotations.dims()[2]
    }
}

/// Iterates a dataset in batches
pub struct WindowLoader<'a> {
    dataset: &'a WindowDataset,
    batch_size: usize,
    shuffle: bool,
    indices: Vec<usize>,
    position: usize,
    device: Device,
}

impl<'a> WindowLoader<'a> {
    pub fn new(dataset: &'a WindowDataset, batch_size: usize, shuffle: bool, device: Device) -> Self {
        let mut loader = Self {
            dataset,
            batch_size: batch_size.max(1),
            shuffle,
            indices: (0..dataset.len()).collect(),
            position: 0,
            device,
        };
        loader.reset();
        loader
    }

    /// Rewind, reshuffling when enabled
    pub fn reset(&mut self) {
        self.position = 0;
        if self.shuffle {
            self.indices.shuffle(&mut thread_rng());
        }
    }

    pub fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    pub fn next_batch(&mut self) -> Option<InbetweenResult<WindowBatch>> {
        if self.position >= self.dataset.len() {
            return None;
        }
        let end = (self.position + self.batch_size).min(self.dataset.len());
        let ids = self.indices[self.position..end].to_vec();
        self.position = end;

        let windows: Vec<&MotionWindow> = ids.iter().map(|&i| &self.dataset.windows[i]).collect();
        Some(WindowBatch::from_windows(&windows, ids, &self.device))
    }
}

impl Iterator for WindowLoader<'_> {
    type Item = InbetweenResult<WindowBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_batch()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::fixtures;
    use candle_core::IndexOp;

    fn dataset(split: Split) -> WindowDataset {
        let skeleton = fixtures::humanoid();
        let library = fixtures::library(&skeleton);
        let config = fixtures::data_config();
        WindowDataset::from_library(&library, &skeleton, &config, split).unwrap()
    }

    #[test]
    fn test_splits_use_their_subjects_and_strides() {
        let train = dataset(Split::Train);
        let test = dataset(Split::Test);
        // train: two 30-frame clips, W=10, S=5 -> 5 each; test: one 30-frame clip, S=10 -> 3
        assert_eq!(train.len(), 10);
        assert_eq!(test.len(), 3);
        assert!(test.windows().iter().all(|w| w.clip.ends_with("subject5")));
        assert_eq!(train.local_q_dim(), 88);
        assert_eq!(train.contact_dim(), 4);
        assert_eq!(train.stats().num_joints(), 22);
    }

    #[test]
    fn test_empty_subjects_fail_fast() {
        let skeleton = fixtures::humanoid();
        let library = fixtures::library(&skeleton);
        let mut config = fixtures::data_config();
        config.test_subjects.clear();
        assert!(matches!(
            WindowDataset::from_library(&library, &skeleton, &config, Split::Test),
            Err(InbetweenError::EmptySubjects(_))
        ));
    }

    #[test]
    fn test_loader_batches() {
        let train = dataset(Split::Train);
        let mut loader = WindowLoader::new(&train, 4, true, Device::Cpu);
        assert_eq!(loader.num_batches(), 3);

        let sizes: Vec<usize> = loader.by_ref().map(|b| b.unwrap().batch_size()).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        loader.reset();
        assert!(loader.next_batch().is_some());
    }

    #[test]
    fn test_batch_shapes_and_targets() {
        let test = dataset(Split::Test);
        let batch = WindowLoader::new(&test, 8, false, Device::Cpu).next().unwrap().unwrap();

        assert_eq!(batch.sequence_ids, vec![0, 1, 2]);
        assert_eq!(batch.local_rotations.dims(), &[3, 10, 22, 4]);
        assert_eq!(batch.global_positions.dims(), &[3, 10, 22, 3]);
        assert_eq!(batch.contacts.dims(), &[3, 10, 4]);
        assert_eq!(batch.conditions.dim(), (3, 10, 2));
        assert_eq!(batch.target_rotations.dims(), &[3, 88]);

        let last_root: Vec<f32> = batch.root_positions.i((1, 9)).unwrap().to_vec1().unwrap();
        let target: Vec<f32> = batch.target_root.i(1).unwrap().to_vec1().unwrap();
        assert_eq!(last_root, target);
    }
}
