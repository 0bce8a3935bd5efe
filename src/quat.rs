//! Batched unit-quaternion arithmetic
//!
//! Quaternions are stored `(w, x, y, z)` along the last tensor dimension. All
//! functions accept any leading shape, so the same code serves a single pose,
//! a window of frames, or a batch of windows.

use candle_core::{Result as CandleResult, Tensor, D};
use ndarray::{Array3, Axis};

fn split4(q: &Tensor) -> CandleResult<[Tensor; 4]> {
    Ok([
        q.narrow(D::Minus1, 0, 1)?,
        q.narrow(D::Minus1, 1, 1)?,
        q.narrow(D::Minus1, 2, 1)?,
        q.narrow(D::Minus1, 3, 1)?,
    ])
}

fn split3(v: &Tensor) -> CandleResult<[Tensor; 3]> {
    Ok([
        v.narrow(D::Minus1, 0, 1)?,
        v.narrow(D::Minus1, 1, 1)?,
        v.narrow(D::Minus1, 2, 1)?,
    ])
}

/// `a * b - c * d` with broadcasting
fn det2(a: &Tensor, b: &Tensor, c: &Tensor, d: &Tensor) -> CandleResult<Tensor> {
    a.broadcast_mul(b)?.broadcast_sub(&c.broadcast_mul(d)?)
}

/// Hamilton product `a ⊗ b`
pub fn mul(a: &Tensor, b: &Tensor) -> CandleResult<Tensor> {
    let [aw, ax, ay, az] = split4(a)?;
    let [bw, bx, by, bz] = split4(b)?;

    let w = det2(&aw, &bw, &ax, &bx)?.broadcast_sub(&det2(&ay, &by, &az.neg()?, &bz)?)?;
    let x = det2(&aw, &bx, &az, &by)?
        .broadcast_add(&ax.broadcast_mul(&bw)?)?
        .broadcast_add(&ay.broadcast_mul(&bz)?)?;
    let y = det2(&aw, &by, &ax, &bz)?
        .broadcast_add(&ay.broadcast_mul(&bw)?)?
        .broadcast_add(&az.broadcast_mul(&bx)?)?;
    let z = det2(&aw, &bz, &ay, &bx)?
        .broadcast_add(&ax.broadcast_mul(&by)?)?
        .broadcast_add(&az.broadcast_mul(&bw)?)?;

    Tensor::cat(&[w, x, y, z], D::Minus1)
}

/// Cross product of two `(..., 3)` tensors
pub fn cross(a: &Tensor, b: &Tensor) -> CandleResult<Tensor> {
    let [ax, ay, az] = split3(a)?;
    let [bx, by, bz] = split3(b)?;
    Tensor::cat(
        &[
            det2(&ay, &bz, &az, &by)?,
            det2(&az, &bx, &ax, &bz)?,
            det2(&ax, &by, &ay, &bx)?,
        ],
        D::Minus1,
    )
}

/// Rotate `(..., 3)` vectors by `(..., 4)` unit quaternions
pub fn rotate(q: &Tensor, v: &Tensor) -> CandleResult<Tensor> {
    let w = q.narrow(D::Minus1, 0, 1)?;
    let u = q.narrow(D::Minus1, 1, 3)?;
    let t = (cross(&u, v)? * 2.0)?;
    v.broadcast_add(&w.broadcast_mul(&t)?)?
        .broadcast_add(&cross(&u, &t)?)
}

/// Euclidean norm over the last dimension, kept as a size-1 dimension
pub fn norm(q: &Tensor) -> CandleResult<Tensor> {
    q.sqr()?.sum_keepdim(D::Minus1)?.sqrt()
}

/// Divide by the norm, clamped below at `eps` so degenerate inputs stay finite
pub fn normalize(q: &Tensor, eps: f64) -> CandleResult<Tensor> {
    let n = norm(q)?.maximum(eps)?;
    q.broadcast_div(&n)
}

/// Axis-angle `(..., 3)` (direction = axis, length = angle) to quaternions
pub fn from_axis_angle(v: &Tensor, eps: f64) -> CandleResult<Tensor> {
    let angle = norm(v)?;
    let axis = v.broadcast_div(&angle.maximum(eps)?)?;
    let half = (angle * 0.5)?;
    let w = half.cos()?;
    let xyz = axis.broadcast_mul(&half.sin()?)?;
    Tensor::cat(&[w, xyz], D::Minus1)
}

/// Hamilton product of two host quaternions
pub fn mul_host(a: [f32; 4], b: [f32; 4]) -> [f32; 4] {
    let [aw, ax, ay, az] = a;
    let [bw, bx, by, bz] = b;
    [
        aw * bw - ax * bx - ay * by - az * bz,
        aw * bx + ax * bw + ay * bz - az * by,
        aw * by - ax * bz + ay * bw + az * bx,
        aw * bz + ax * by - ay * bx + az * bw,
    ]
}

/// Rotate one host vector by a unit quaternion
pub fn rotate_host(q: [f32; 4], v: [f32; 3]) -> [f32; 3] {
    let [w, x, y, z] = q;
    let t = [
        2.0 * (y * v[2] - z * v[1]),
        2.0 * (z * v[0] - x * v[2]),
        2.0 * (x * v[1] - y * v[0]),
    ];
    [
        v[0] + w * t[0] + (y * t[2] - z * t[1]),
        v[1] + w * t[1] + (z * t[0] - x * t[2]),
        v[2] + w * t[2] + (x * t[1] - y * t[0]),
    ]
}

/// Rotation about +Y that carries the ground projection of `forward` onto +X.
///
/// `None` when `forward` is (nearly) vertical and has no heading.
pub fn yaw_to_x(forward: [f32; 3], eps: f32) -> Option<[f32; 4]> {
    let (x, z) = (forward[0], forward[2]);
    if (x * x + z * z).sqrt() < eps {
        return None;
    }
    // heading is the angle of the +Y rotation taking +X to (x, 0, z)
    let heading = (-z).atan2(x);
    let half = -0.5 * heading;
    Some([half.cos(), 0.0, half.sin(), 0.0])
}

/// Flip quaternions into the hemisphere of their predecessor in time.
///
/// `rotations` is `(frames, joints, 4)`; `q` and `-q` encode the same rotation,
/// so this changes no pose but removes sign jumps the network would otherwise
/// have to learn.
pub fn enforce_continuity(rotations: &mut Array3<f32>) {
    let frames = rotations.len_of(Axis(0));
    let joints = rotations.len_of(Axis(1));
    for t in 1..frames {
        for j in 0..joints {
            let dot: f32 = (0..4)
                .map(|k| rotations[[t, j, k]] * rotations[[t - 1, j, k]])
                .sum();
            if dot < 0.0 {
                for k in 0..4 {
                    rotations[[t, j, k]] = -rotations[[t, j, k]];
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use std::f32::consts::FRAC_PI_2;

    fn to_vec(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1().unwrap()
    }

    #[test]
    fn test_identity_product() {
        let device = Device::Cpu;
        let id = Tensor::new(&[[1.0f32, 0.0, 0.0, 0.0]], &device).unwrap();
        let q = Tensor::new(&[[0.5f32, 0.5, 0.5, 0.5]], &device).unwrap();
        assert_eq!(to_vec(&mul(&id, &q).unwrap()), to_vec(&q));
        assert_eq!(to_vec(&mul(&q, &id).unwrap()), to_vec(&q));
    }

    #[test]
    fn test_rotate_quarter_turn_about_z() {
        let device = Device::Cpu;
        let h = (FRAC_PI_2 / 2.0).cos();
        let s = (FRAC_PI_2 / 2.0).sin();
        let q = Tensor::new(&[[h, 0.0, 0.0, s]], &device).unwrap();
        let v = Tensor::new(&[[1.0f32, 0.0, 0.0]], &device).unwrap();

        let out = to_vec(&rotate(&q, &v).unwrap());
        assert!(out[0].abs() < 1e-6);
        assert!((out[1] - 1.0).abs() < 1e-6);
        assert!(out[2].abs() < 1e-6);
    }

    #[test]
    fn test_product_composes_rotations() {
        let device = Device::Cpu;
        let h = (FRAC_PI_2 / 2.0).cos();
        let s = (FRAC_PI_2 / 2.0).sin();
        let qz = Tensor::new(&[[h, 0.0, 0.0, s]], &device).unwrap();
        let qx = Tensor::new(&[[h, s, 0.0, 0.0]], &device).unwrap();
        let v = Tensor::new(&[[0.0f32, 1.0, 0.0]], &device).unwrap();

        let composed = rotate(&mul(&qz, &qx).unwrap(), &v).unwrap();
        let sequential = rotate(&qz, &rotate(&qx, &v).unwrap()).unwrap();
        for (a, b) in to_vec(&composed).iter().zip(to_vec(&sequential).iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_normalize_unit_and_zero() {
        let device = Device::Cpu;
        let q = Tensor::new(&[[2.0f32, 0.0, 0.0, 0.0], [0.0, 0.0, 0.0, 0.0]], &device).unwrap();
        let n = to_vec(&normalize(&q, 1e-8).unwrap());
        assert!((n[0] - 1.0).abs() < 1e-6);
        assert!(n.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_axis_angle_zero_is_identity() {
        let device = Device::Cpu;
        let v = Tensor::zeros((2, 3), candle_core::DType::F32, &device).unwrap();
        let q = to_vec(&from_axis_angle(&v, 1e-8).unwrap());
        assert_eq!(q, vec![1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_host_math_matches_tensor_math() {
        let device = Device::Cpu;
        let a = [0.9f32, 0.1, -0.3, 0.2];
        let b = [0.5f32, -0.5, 0.5, 0.5];
        let v = [0.3f32, -1.0, 2.0];
        let ta = Tensor::new(&[a], &device).unwrap();
        let tb = Tensor::new(&[b], &device).unwrap();
        let tv = Tensor::new(&[v], &device).unwrap();

        let product = to_vec(&mul(&ta, &tb).unwrap());
        for (h, t) in mul_host(a, b).iter().zip(product.iter()) {
            assert!((h - t).abs() < 1e-6);
        }
        let unit = to_vec(&normalize(&ta, 1e-8).unwrap());
        let unit = [unit[0], unit[1], unit[2], unit[3]];
        let rotated = to_vec(&rotate(&Tensor::new(&[unit], &device).unwrap(), &tv).unwrap());
        for (h, t) in rotate_host(unit, v).iter().zip(rotated.iter()) {
            assert!((h - t).abs() < 1e-5);
        }
    }

    #[test]
    fn test_yaw_to_x() {
        for forward in [[0.0f32, 0.3, 1.0], [-1.0, 0.0, 0.0], [0.6, -0.2, -0.8]] {
            let q = yaw_to_x(forward, 1e-6).unwrap();
            let out = rotate_host(q, forward);
            assert!(out[0] > 0.0);
            assert!(out[2].abs() < 1e-6);
            assert!((out[1] - forward[1]).abs() < 1e-6);
        }
        assert!(yaw_to_x([0.0, 1.0, 0.0], 1e-6).is_none());
    }

    #[test]
    fn test_enforce_continuity_flips_sign() {
        let mut rotations = Array3::<f32>::zeros((3, 1, 4));
        rotations[[0, 0, 0]] = 1.0;
        rotations[[1, 0, 0]] = -1.0;
        rotations[[2, 0, 0]] = 1.0;
        enforce_continuity(&mut rotations);
        assert_eq!(rotations[[1, 0, 0]], 1.0);
        assert_eq!(rotations[[2, 0, 0]], 1.0);
    }
}
