//! Right-trivialised tangent operations on unit quaternions.
//!
//! Attitude elements use the convention `q ⊞ v = exp(v) · q`, i.e. the tangent
//! perturbation acts in the fixed frame. With this convention the four manifold
//! Jacobians have closed forms in terms of the rotation matrix of `exp(v)` and the
//! SO(3) left Jacobian `Γ(v) = I + (1-cosθ)/θ² [v]ₓ + (θ-sinθ)/θ³ [v]ₓ²`.

use nalgebra::{Matrix3, UnitQuaternion, Vector3};

/// Angle below which the Taylor expansions of `Γ` and `Γ⁻¹` are used.
const SMALL_ANGLE: f64 = 1e-5;

/// Skew-symmetric (cross-product) matrix of `v`.
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y, //
        v.z, 0.0, -v.x, //
        -v.y, v.x, 0.0,
    )
}

/// Exponential map from a rotation vector to a unit quaternion.
pub fn exp_map(v: &Vector3<f64>) -> UnitQuaternion<f64> {
    UnitQuaternion::from_scaled_axis(*v)
}

/// Logarithmic map from a unit quaternion to a rotation vector.
pub fn log_map(q: &UnitQuaternion<f64>) -> Vector3<f64> {
    q.scaled_axis()
}

/// `q ⊞ v = exp(v) · q`.
pub fn boxplus(q: &UnitQuaternion<f64>, v: &Vector3<f64>) -> UnitQuaternion<f64> {
    exp_map(v) * q
}

/// `q ⊟ r = log(q · r⁻¹)`, so that `r ⊞ (q ⊟ r) = q`.
pub fn boxminus(q: &UnitQuaternion<f64>, r: &UnitQuaternion<f64>) -> Vector3<f64> {
    log_map(&(q * r.inverse()))
}

/// SO(3) left Jacobian `Γ(v)`.
pub fn gamma_matrix(v: &Vector3<f64>) -> Matrix3<f64> {
    let theta = v.norm();
    let vx = skew(v);
    if theta < SMALL_ANGLE {
        Matrix3::identity() + 0.5 * vx + (vx * vx) / 6.0
    } else {
        let theta2 = theta * theta;
        Matrix3::identity()
            + ((1.0 - theta.cos()) / theta2) * vx
            + ((theta - theta.sin()) / (theta2 * theta)) * (vx * vx)
    }
}

/// Inverse of the SO(3) left Jacobian, `Γ(v)⁻¹`.
pub fn gamma_inverse(v: &Vector3<f64>) -> Matrix3<f64> {
    let theta = v.norm();
    let vx = skew(v);
    if theta < SMALL_ANGLE {
        Matrix3::identity() - 0.5 * vx + (vx * vx) / 12.0
    } else {
        let theta2 = theta * theta;
        let coeff = 1.0 / theta2 - (1.0 + theta.cos()) / (2.0 * theta * theta.sin());
        Matrix3::identity() - 0.5 * vx + coeff * (vx * vx)
    }
}

/// Jacobian of `q ⊞ v` with respect to a tangent perturbation of `q`.
pub fn boxplus_jac_inp(_q: &UnitQuaternion<f64>, v: &Vector3<f64>) -> Matrix3<f64> {
    exp_map(v).to_rotation_matrix().into_inner()
}

/// Jacobian of `q ⊞ v` with respect to `v`.
pub fn boxplus_jac_vec(_q: &UnitQuaternion<f64>, v: &Vector3<f64>) -> Matrix3<f64> {
    gamma_matrix(v)
}

/// Jacobian of `q ⊟ r` with respect to a tangent perturbation of `q`.
pub fn boxminus_jac_inp(q: &UnitQuaternion<f64>, r: &UnitQuaternion<f64>) -> Matrix3<f64> {
    gamma_inverse(&boxminus(q, r))
}

/// Jacobian of `q ⊟ r` with respect to a tangent perturbation of `r`.
pub fn boxminus_jac_ref(q: &UnitQuaternion<f64>, r: &UnitQuaternion<f64>) -> Matrix3<f64> {
    let rel = q * r.inverse();
    -gamma_inverse(&boxminus(q, r)) * rel.to_rotation_matrix().into_inner()
}
