//! # Skeleton and Forward Kinematics
//!
//! The engine treats forward kinematics as a collaborator behind the
//! [`ForwardKinematics`] trait. [`Skeleton`] is the stock implementation: a
//! joint hierarchy with fixed bone offsets, evaluated by composing local
//! rotations from the root outwards.
//!
//! ```text
//! global_rot[j] = global_rot[parent(j)] ⊗ local_rot[j]
//! global_pos[j] = global_rot[parent(j)] · offset[j] + global_pos[parent(j)]
//! global_pos[root] = root_position
//! ```

use std::fs;
use std::path::Path;

use candle_core::{Tensor, D};
use serde::{Deserialize, Serialize};

use crate::error::InbetweenError;
use crate::quat;
use crate::InbetweenResult;

/// How local rotations are encoded in the last tensor dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RotationRepr {
    /// `(w, x, y, z)` unit quaternions
    Quaternion,
    /// Rotation vectors, length = angle in radians
    AxisAngle,
}

impl RotationRepr {
    pub fn width(&self) -> usize {
        match self {
            RotationRepr::Quaternion => 4,
            RotationRepr::AxisAngle => 3,
        }
    }
}

/// Global positions from root translation and local rotations.
///
/// `root_position` is `(..., 3)`, `local_rotations` is `(..., joints, width)`;
/// the result is `(..., joints, 3)`.
pub trait ForwardKinematics {
    fn num_joints(&self) -> usize;

    fn forward_kinematics(
        &self,
        root_position: &Tensor,
        local_rotations: &Tensor,
        repr: RotationRepr,
    ) -> InbetweenResult<Tensor>;
}

/// Joint hierarchy with rest-pose bone offsets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Skeleton {
    pub joint_names: Vec<String>,
    /// Parent of each joint; the root has none and must come first
    pub parents: Vec<Option<usize>>,
    /// Offset of each joint from its parent, in the parent's frame
    pub offsets: Vec<[f32; 3]>,
    /// Joints sampled for left-foot contact
    pub left_foot: Vec<usize>,
    /// Joints sampled for right-foot contact
    pub right_foot: Vec<usize>,
}

impl Skeleton {
    pub fn new(
        joint_names: Vec<String>,
        parents: Vec<Option<usize>>,
        offsets: Vec<[f32; 3]>,
        left_foot: Vec<usize>,
        right_foot: Vec<usize>,
    ) -> InbetweenResult<Self> {
        let skeleton = Self {
            joint_names,
            parents,
            offsets,
            left_foot,
            right_foot,
        };
        skeleton.validate()?;
        Ok(skeleton)
    }

    pub fn from_file(path: impl AsRef<Path>) -> InbetweenResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| InbetweenError::Io(format!("Failed to read skeleton {:?}: {}", path, e)))?;
        let skeleton: Self = serde_json::from_str(&content)?;
        skeleton.validate()?;
        log::info!(
            "Loaded skeleton with {} joints from {:?}",
            skeleton.num_joints(),
            path
        );
        Ok(skeleton)
    }

    fn validate(&self) -> InbetweenResult<()> {
        let n = self.parents.len();
        if n == 0 {
            return Err(InbetweenError::InvalidParameter("skeleton has no joints".into()));
        }
        if self.joint_names.len() != n || self.offsets.len() != n {
            return Err(InbetweenError::InvalidParameter(format!(
                "skeleton tables disagree: {} parents, {} names, {} offsets",
                n,
                self.joint_names.len(),
                self.offsets.len()
            )));
        }
        if self.parents[0].is_some() {
            return Err(InbetweenError::InvalidParameter(
                "joint 0 must be the root".into(),
            ));
        }
        for (j, parent) in self.parents.iter().enumerate().skip(1) {
            match parent {
                Some(p) if *p < j => {}
                _ => {
                    return Err(InbetweenError::InvalidParameter(format!(
                        "joint {} must have a parent listed before it",
                        j
                    )))
                }
            }
        }
        if let Some(j) = self
            .left_foot
            .iter()
            .chain(self.right_foot.iter())
            .find(|&&j| j >= n)
        {
            return Err(InbetweenError::InvalidParameter(format!(
                "foot joint {} out of range",
                j
            )));
        }
        Ok(())
    }

    /// Number of contact channels (left feet then right feet)
    pub fn contact_dim(&self) -> usize {
        self.left_foot.len() + self.right_foot.len()
    }

    /// Global rotations `(..., joints, 4)` and positions `(..., joints, 3)`
    pub fn global_transforms(
        &self,
        root_position: &Tensor,
        local_rotations: &Tensor,
        repr: RotationRepr,
    ) -> InbetweenResult<(Tensor, Tensor)> {
        let dims = local_rotations.dims();
        if dims.len() < 2 {
            return Err(InbetweenError::InvalidParameter(format!(
                "local rotations need a joint axis, got shape {:?}",
                dims
            )));
        }
        let joints = dims[dims.len() - 2];
        if joints != self.num_joints() {
            return Err(InbetweenError::DimensionMismatch {
                context: "forward kinematics joints",
                expected: self.num_joints(),
                got: joints,
            });
        }
        let width = dims[dims.len() - 1];
        if width != repr.width() {
            return Err(InbetweenError::DimensionMismatch {
                context: "forward kinematics rotation width",
                expected: repr.width(),
                got: width,
            });
        }

        let local = match repr {
            RotationRepr::Quaternion => local_rotations.clone(),
            RotationRepr::AxisAngle => quat::from_axis_angle(local_rotations, 1e-8)?,
        };
        let device = local.device();

        let mut rotations: Vec<Tensor> = Vec::with_capacity(joints);
        let mut positions: Vec<Tensor> = Vec::with_capacity(joints);
        for (j, parent) in self.parents.iter().enumerate() {
            let q = local.narrow(D::Minus2, j, 1)?.squeeze(D::Minus2)?;
            match parent {
                None => {
                    rotations.push(q);
                    positions.push(root_position.clone());
                }
                Some(p) => {
                    let offset = Tensor::new(&self.offsets[j], device)?;
                    let pos = quat::rotate(&rotations[*p], &offset)?.broadcast_add(&positions[*p])?;
                    rotations.push(quat::mul(&rotations[*p], &q)?);
                    positions.push(pos);
                }
            }
        }

        let global_rotations = Tensor::stack(&rotations, D::Minus2)?;
        let global_positions = Tensor::stack(&positions, D::Minus2)?;
        Ok((global_rotations, global_positions))
    }
}

impl ForwardKinematics for Skeleton {
    fn num_joints(&self) -> usize {
        self.parents.len()
    }

    fn forward_kinematics(
        &self,
        root_position: &Tensor,
        local_rotations: &Tensor,
        repr: RotationRepr,
    ) -> InbetweenResult<Tensor> {
        let (_, positions) = self.global_transforms(root_position, local_rotations, repr)?;
        Ok(positions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::fixtures;
    use candle_core::{DType, Device};
    use std::f32::consts::FRAC_PI_2;

    fn chain() -> Skeleton {
        Skeleton::new(
            vec!["root".into(), "mid".into(), "tip".into()],
            vec![None, Some(0), Some(1)],
            vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [1.0, 0.0, 0.0]],
            vec![1],
            vec![2],
        )
        .unwrap()
    }

    #[test]
    fn test_rest_pose_accumulates_offsets() {
        let device = Device::Cpu;
        let skeleton = chain();
        let root = Tensor::new(&[[0.0f32, 1.0, 0.0]], &device).unwrap();
        let rotations = fixtures::identity_rotations(&[1, 3], &device);

        let pos = skeleton
            .forward_kinematics(&root, &rotations, RotationRepr::Quaternion)
            .unwrap();
        assert_eq!(pos.dims(), &[1, 3, 3]);
        let v: Vec<f32> = pos.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(v, vec![0.0, 1.0, 0.0, 1.0, 1.0, 0.0, 2.0, 1.0, 0.0]);
    }

    #[test]
    fn test_root_rotation_swings_chain() {
        let device = Device::Cpu;
        let skeleton = chain();
        let root = Tensor::zeros((1, 3), DType::F32, &device).unwrap();
        let h = (FRAC_PI_2 / 2.0).cos();
        let s = (FRAC_PI_2 / 2.0).sin();
        let rotations = Tensor::new(
            &[[[h, 0.0, 0.0, s], [1.0, 0.0, 0.0, 0.0], [1.0, 0.0, 0.0, 0.0]]],
            &device,
        )
        .unwrap();

        let pos = skeleton
            .forward_kinematics(&root, &rotations, RotationRepr::Quaternion)
            .unwrap();
        let v: Vec<f32> = pos.flatten_all().unwrap().to_vec1().unwrap();
        // tip lands on +y after a quarter turn about z
        assert!(v[6].abs() < 1e-5);
        assert!((v[7] - 2.0).abs() < 1e-5);
    }

    #[test]
    fn test_axis_angle_matches_quaternion() {
        let device = Device::Cpu;
        let skeleton = chain();
        let root = Tensor::zeros((1, 3), DType::F32, &device).unwrap();
        let axis_angle = Tensor::new(
            &[[[0.0f32, 0.0, FRAC_PI_2], [0.0, 0.0, 0.0], [0.0, 0.0, 0.0]]],
            &device,
        )
        .unwrap();
        let quats = quat::from_axis_angle(&axis_angle, 1e-8).unwrap();

        let a = skeleton
            .forward_kinematics(&root, &axis_angle, RotationRepr::AxisAngle)
            .unwrap();
        let b = skeleton
            .forward_kinematics(&root, &quats, RotationRepr::Quaternion)
            .unwrap();
        let diff: f32 = (a - b).unwrap().abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert!(diff < 1e-6);
    }

    #[test]
    fn test_joint_count_mismatch_is_rejected() {
        let device = Device::Cpu;
        let skeleton = chain();
        let root = Tensor::zeros((1, 3), DType::F32, &device).unwrap();
        let rotations = fixtures::identity_rotations(&[1, 4], &device);
        assert!(matches!(
            skeleton.forward_kinematics(&root, &rotations, RotationRepr::Quaternion),
            Err(InbetweenError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_invalid_hierarchy_is_rejected() {
        let result = Skeleton::new(
            vec!["a".into(), "b".into()],
            vec![None, Some(1)],
            vec![[0.0; 3], [1.0, 0.0, 0.0]],
            vec![],
            vec![],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_humanoid_fixture_shapes() {
        let device = Device::Cpu;
        let skeleton = fixtures::humanoid();
        assert_eq!(skeleton.num_joints(), 22);
        assert_eq!(skeleton.contact_dim(), 4);
        let root = Tensor::zeros((5, 3), DType::F32, &device).unwrap();
        let rotations = fixtures::identity_rotations(&[5, 22], &device);
        let pos = skeleton
            .forward_kinematics(&root, &rotations, RotationRepr::Quaternion)
            .unwrap();
        assert_eq!(pos.dims(), &[5, 22, 3]);
    }
}
