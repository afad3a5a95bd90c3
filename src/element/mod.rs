//! Manifold element traits and type-erased element storage.
//!
//! Every state variable lives on a manifold described by [`ElementTraits`]: a
//! tangent dimension, `⊞`/`⊟` charts, and their four Jacobians. The capability
//! record is expressed as associated functions on the value type, so built-in
//! implementations read as small tables of formulas.
//!
//! [`ElementBase`] erases the concrete type behind a trait object so that
//! heterogeneous collections ([`ElementVector`](crate::element::ElementVector))
//! can dispatch uniformly over their entries. The erased methods mirror the trait
//! one-to-one; cross-element calls downcast and report a `TypeMismatch` instead of
//! panicking.
//!
//! Provided implementations: `f64` (dim 1), `SVector<f64, N>` (dim N, identity
//! Jacobians), `UnitQuaternion<f64>` (dim 3, exponential-map Jacobians), `[T; N]`
//! (block-diagonal Jacobians), and the zero-dimensional [`Constant`] carrier for
//! values that are stored but not estimated.

mod vector;

pub use vector::{ElementSpec, ElementVector, ElementVectorDefinition};

use std::any::Any;
use std::fmt;

use nalgebra::{DMatrix, DVectorView, DVectorViewMut, Matrix3, Quaternion, SVector, UnitQuaternion};
use thiserror::Error;

use crate::error::programmer_error;
use crate::random::GaussianSampler;
use crate::rotation;

/// Errors raised by element and element-vector operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ElementError {
    /// Lookup of a name that is not part of the definition.
    #[error("unknown element name '{name}'")]
    NameMismatch { name: String },

    /// A typed access did not match the stored element type.
    #[error("element type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    /// Two elements with the same name were added to one definition.
    #[error("duplicate element name '{name}'")]
    DuplicateName { name: String },

    /// Merging definitions found the same name with two different types.
    #[error("conflicting types for element name '{name}'")]
    TypeCollision { name: String },

    /// A tangent vector or Jacobian had the wrong size.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// An operation across element vectors requires identical definitions.
    #[error("element vectors have different definitions")]
    DefinitionMismatch,
}

/// Manifold capability record for a concrete element type.
///
/// Implementations must guarantee `boxplus(x, 0) == x` and that the analytic
/// Jacobians agree with central finite differences; the test suite checks both
/// for every built-in.
pub trait ElementTraits: Clone + PartialEq + fmt::Debug + Send + Sync + 'static {
    /// Tangent-space dimension.
    const DIM: usize;
    /// Marks types where `⊞`/`⊟` reduce to `+`/`-` and all Jacobians are `±I`.
    const IS_VECTOR_SPACE: bool;

    fn identity() -> Self;

    fn set_identity(x: &mut Self) {
        *x = Self::identity();
    }

    fn set_random(x: &mut Self, sampler: &mut GaussianSampler);

    /// `out = x ⊞ vec`. `vec` must have `DIM` rows.
    fn boxplus(x: &Self, vec: DVectorView<'_, f64>, out: &mut Self);

    /// `vec = x ⊟ reference`. `vec` must have `DIM` rows.
    fn boxminus(x: &Self, reference: &Self, vec: &mut DVectorViewMut<'_, f64>);

    /// Jacobian of `x ⊞ vec` with respect to a tangent perturbation of `x`.
    fn boxplus_jac_inp(x: &Self, vec: DVectorView<'_, f64>) -> DMatrix<f64>;

    /// Jacobian of `x ⊞ vec` with respect to `vec`.
    fn boxplus_jac_vec(x: &Self, vec: DVectorView<'_, f64>) -> DMatrix<f64>;

    /// Jacobian of `x ⊟ reference` with respect to a tangent perturbation of `x`.
    fn boxminus_jac_inp(x: &Self, reference: &Self) -> DMatrix<f64>;

    /// Jacobian of `x ⊟ reference` with respect to a tangent perturbation of
    /// `reference`.
    fn boxminus_jac_ref(x: &Self, reference: &Self) -> DMatrix<f64>;

    fn print(x: &Self) -> String {
        format!("{:?}", x)
    }
}

/// Object-safe view of an element, dispatching into its [`ElementTraits`].
pub trait ElementBase: fmt::Debug + Send + Sync {
    fn dim(&self) -> usize;
    fn is_vector_space(&self) -> bool;
    fn type_name(&self) -> &'static str;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn clone_box(&self) -> Box<dyn ElementBase>;
    fn copy_from(&mut self, other: &dyn ElementBase) -> Result<(), ElementError>;
    fn set_identity(&mut self);
    fn set_random(&mut self, sampler: &mut GaussianSampler);
    fn boxplus(&self, vec: DVectorView<'_, f64>, out: &mut dyn ElementBase)
        -> Result<(), ElementError>;
    fn boxminus(
        &self,
        reference: &dyn ElementBase,
        vec: DVectorViewMut<'_, f64>,
    ) -> Result<(), ElementError>;
    fn boxplus_jac_inp(&self, vec: DVectorView<'_, f64>) -> DMatrix<f64>;
    fn boxplus_jac_vec(&self, vec: DVectorView<'_, f64>) -> DMatrix<f64>;
    fn boxminus_jac_inp(&self, reference: &dyn ElementBase) -> Result<DMatrix<f64>, ElementError>;
    fn boxminus_jac_ref(&self, reference: &dyn ElementBase) -> Result<DMatrix<f64>, ElementError>;
    fn print(&self) -> String;
}

fn downcast<T: ElementTraits>(other: &dyn ElementBase) -> Result<&T, ElementError> {
    match other.as_any().downcast_ref::<T>() {
        Some(value) => Ok(value),
        None => programmer_error!(ElementError::TypeMismatch {
            expected: std::any::type_name::<T>(),
            found: other.type_name(),
        }),
    }
}

fn downcast_mut<T: ElementTraits>(other: &mut dyn ElementBase) -> Result<&mut T, ElementError> {
    let found = other.type_name();
    match other.as_any_mut().downcast_mut::<T>() {
        Some(value) => Ok(value),
        None => programmer_error!(ElementError::TypeMismatch {
            expected: std::any::type_name::<T>(),
            found,
        }),
    }
}

impl<T: ElementTraits> ElementBase for T {
    fn dim(&self) -> usize {
        T::DIM
    }

    fn is_vector_space(&self) -> bool {
        T::IS_VECTOR_SPACE
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn clone_box(&self) -> Box<dyn ElementBase> {
        Box::new(self.clone())
    }

    fn copy_from(&mut self, other: &dyn ElementBase) -> Result<(), ElementError> {
        *self = downcast::<T>(other)?.clone();
        Ok(())
    }

    fn set_identity(&mut self) {
        <T as ElementTraits>::set_identity(self);
    }

    fn set_random(&mut self, sampler: &mut GaussianSampler) {
        <T as ElementTraits>::set_random(self, sampler);
    }

    fn boxplus(
        &self,
        vec: DVectorView<'_, f64>,
        out: &mut dyn ElementBase,
    ) -> Result<(), ElementError> {
        if vec.len() != T::DIM {
            programmer_error!(ElementError::DimensionMismatch {
                expected: T::DIM,
                actual: vec.len(),
            });
        }
        <T as ElementTraits>::boxplus(self, vec, downcast_mut::<T>(out)?);
        Ok(())
    }

    fn boxminus(
        &self,
        reference: &dyn ElementBase,
        mut vec: DVectorViewMut<'_, f64>,
    ) -> Result<(), ElementError> {
        if vec.len() != T::DIM {
            programmer_error!(ElementError::DimensionMismatch {
                expected: T::DIM,
                actual: vec.len(),
            });
        }
        <T as ElementTraits>::boxminus(self, downcast::<T>(reference)?, &mut vec);
        Ok(())
    }

    fn boxplus_jac_inp(&self, vec: DVectorView<'_, f64>) -> DMatrix<f64> {
        <T as ElementTraits>::boxplus_jac_inp(self, vec)
    }

    fn boxplus_jac_vec(&self, vec: DVectorView<'_, f64>) -> DMatrix<f64> {
        <T as ElementTraits>::boxplus_jac_vec(self, vec)
    }

    fn boxminus_jac_inp(&self, reference: &dyn ElementBase) -> Result<DMatrix<f64>, ElementError> {
        Ok(<T as ElementTraits>::boxminus_jac_inp(
            self,
            downcast::<T>(reference)?,
        ))
    }

    fn boxminus_jac_ref(&self, reference: &dyn ElementBase) -> Result<DMatrix<f64>, ElementError> {
        Ok(<T as ElementTraits>::boxminus_jac_ref(
            self,
            downcast::<T>(reference)?,
        ))
    }

    fn print(&self) -> String {
        <T as ElementTraits>::print(self)
    }
}

fn dynamic_from3(m: &Matrix3<f64>) -> DMatrix<f64> {
    DMatrix::from_fn(3, 3, |i, j| m[(i, j)])
}

// ==================== trait implementations ==================== //

/// Scalar element.
impl ElementTraits for f64 {
    const DIM: usize = 1;
    const IS_VECTOR_SPACE: bool = true;

    fn identity() -> Self {
        0.0
    }

    fn set_random(x: &mut Self, sampler: &mut GaussianSampler) {
        *x = sampler.sample();
    }

    fn boxplus(x: &Self, vec: DVectorView<'_, f64>, out: &mut Self) {
        *out = *x + vec[0];
    }

    fn boxminus(x: &Self, reference: &Self, vec: &mut DVectorViewMut<'_, f64>) {
        vec[0] = *x - *reference;
    }

    fn boxplus_jac_inp(_x: &Self, _vec: DVectorView<'_, f64>) -> DMatrix<f64> {
        DMatrix::identity(1, 1)
    }

    fn boxplus_jac_vec(_x: &Self, _vec: DVectorView<'_, f64>) -> DMatrix<f64> {
        DMatrix::identity(1, 1)
    }

    fn boxminus_jac_inp(_x: &Self, _reference: &Self) -> DMatrix<f64> {
        DMatrix::identity(1, 1)
    }

    fn boxminus_jac_ref(_x: &Self, _reference: &Self) -> DMatrix<f64> {
        -DMatrix::identity(1, 1)
    }

    fn print(x: &Self) -> String {
        format!("{x}")
    }
}

/// Fixed-length vector element.
impl<const N: usize> ElementTraits for SVector<f64, N> {
    const DIM: usize = N;
    const IS_VECTOR_SPACE: bool = true;

    fn identity() -> Self {
        SVector::zeros()
    }

    fn set_random(x: &mut Self, sampler: &mut GaussianSampler) {
        for i in 0..N {
            x[i] = sampler.sample();
        }
    }

    fn boxplus(x: &Self, vec: DVectorView<'_, f64>, out: &mut Self) {
        for i in 0..N {
            out[i] = x[i] + vec[i];
        }
    }

    fn boxminus(x: &Self, reference: &Self, vec: &mut DVectorViewMut<'_, f64>) {
        for i in 0..N {
            vec[i] = x[i] - reference[i];
        }
    }

    fn boxplus_jac_inp(_x: &Self, _vec: DVectorView<'_, f64>) -> DMatrix<f64> {
        DMatrix::identity(N, N)
    }

    fn boxplus_jac_vec(_x: &Self, _vec: DVectorView<'_, f64>) -> DMatrix<f64> {
        DMatrix::identity(N, N)
    }

    fn boxminus_jac_inp(_x: &Self, _reference: &Self) -> DMatrix<f64> {
        DMatrix::identity(N, N)
    }

    fn boxminus_jac_ref(_x: &Self, _reference: &Self) -> DMatrix<f64> {
        -DMatrix::identity(N, N)
    }

    fn print(x: &Self) -> String {
        format!("{}", x.transpose())
    }
}

/// Unit-quaternion element with right-trivialised tangent.
impl ElementTraits for UnitQuaternion<f64> {
    const DIM: usize = 3;
    const IS_VECTOR_SPACE: bool = false;

    fn identity() -> Self {
        UnitQuaternion::identity()
    }

    fn set_random(x: &mut Self, sampler: &mut GaussianSampler) {
        let q = Quaternion::new(
            sampler.sample(),
            sampler.sample(),
            sampler.sample(),
            sampler.sample(),
        );
        *x = UnitQuaternion::from_quaternion(q);
    }

    fn boxplus(x: &Self, vec: DVectorView<'_, f64>, out: &mut Self) {
        let v = nalgebra::Vector3::new(vec[0], vec[1], vec[2]);
        *out = rotation::boxplus(x, &v);
    }

    fn boxminus(x: &Self, reference: &Self, vec: &mut DVectorViewMut<'_, f64>) {
        let v = rotation::boxminus(x, reference);
        for i in 0..3 {
            vec[i] = v[i];
        }
    }

    fn boxplus_jac_inp(x: &Self, vec: DVectorView<'_, f64>) -> DMatrix<f64> {
        let v = nalgebra::Vector3::new(vec[0], vec[1], vec[2]);
        dynamic_from3(&rotation::boxplus_jac_inp(x, &v))
    }

    fn boxplus_jac_vec(x: &Self, vec: DVectorView<'_, f64>) -> DMatrix<f64> {
        let v = nalgebra::Vector3::new(vec[0], vec[1], vec[2]);
        dynamic_from3(&rotation::boxplus_jac_vec(x, &v))
    }

    fn boxminus_jac_inp(x: &Self, reference: &Self) -> DMatrix<f64> {
        dynamic_from3(&rotation::boxminus_jac_inp(x, reference))
    }

    fn boxminus_jac_ref(x: &Self, reference: &Self) -> DMatrix<f64> {
        dynamic_from3(&rotation::boxminus_jac_ref(x, reference))
    }
}

/// Homogeneous array element; dispatches block-wise into the item traits.
impl<T: ElementTraits, const N: usize> ElementTraits for [T; N] {
    const DIM: usize = N * T::DIM;
    const IS_VECTOR_SPACE: bool = T::IS_VECTOR_SPACE;

    fn identity() -> Self {
        std::array::from_fn(|_| T::identity())
    }

    fn set_random(x: &mut Self, sampler: &mut GaussianSampler) {
        for item in x.iter_mut() {
            T::set_random(item, sampler);
        }
    }

    fn boxplus(x: &Self, vec: DVectorView<'_, f64>, out: &mut Self) {
        for i in 0..N {
            T::boxplus(&x[i], vec.rows(i * T::DIM, T::DIM), &mut out[i]);
        }
    }

    fn boxminus(x: &Self, reference: &Self, vec: &mut DVectorViewMut<'_, f64>) {
        for i in 0..N {
            let mut sub = vec.rows_mut(i * T::DIM, T::DIM);
            T::boxminus(&x[i], &reference[i], &mut sub);
        }
    }

    fn boxplus_jac_inp(x: &Self, vec: DVectorView<'_, f64>) -> DMatrix<f64> {
        let mut jac = DMatrix::zeros(Self::DIM, Self::DIM);
        for i in 0..N {
            let block = T::boxplus_jac_inp(&x[i], vec.rows(i * T::DIM, T::DIM));
            jac.view_mut((i * T::DIM, i * T::DIM), (T::DIM, T::DIM))
                .copy_from(&block);
        }
        jac
    }

    fn boxplus_jac_vec(x: &Self, vec: DVectorView<'_, f64>) -> DMatrix<f64> {
        let mut jac = DMatrix::zeros(Self::DIM, Self::DIM);
        for i in 0..N {
            let block = T::boxplus_jac_vec(&x[i], vec.rows(i * T::DIM, T::DIM));
            jac.view_mut((i * T::DIM, i * T::DIM), (T::DIM, T::DIM))
                .copy_from(&block);
        }
        jac
    }

    fn boxminus_jac_inp(x: &Self, reference: &Self) -> DMatrix<f64> {
        let mut jac = DMatrix::zeros(Self::DIM, Self::DIM);
        for i in 0..N {
            let block = T::boxminus_jac_inp(&x[i], &reference[i]);
            jac.view_mut((i * T::DIM, i * T::DIM), (T::DIM, T::DIM))
                .copy_from(&block);
        }
        jac
    }

    fn boxminus_jac_ref(x: &Self, reference: &Self) -> DMatrix<f64> {
        let mut jac = DMatrix::zeros(Self::DIM, Self::DIM);
        for i in 0..N {
            let block = T::boxminus_jac_ref(&x[i], &reference[i]);
            jac.view_mut((i * T::DIM, i * T::DIM), (T::DIM, T::DIM))
                .copy_from(&block);
        }
        jac
    }

    fn print(x: &Self) -> String {
        x.iter().map(|item| T::print(item)).collect::<Vec<_>>().join(", ")
    }
}

/// Zero-dimensional carrier for data that is stored alongside the state but not
/// estimated. `⊞` copies, `⊟` writes nothing.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Constant<T>(pub T);

impl<T> ElementTraits for Constant<T>
where
    T: Clone + PartialEq + fmt::Debug + Default + Send + Sync + 'static,
{
    const DIM: usize = 0;
    const IS_VECTOR_SPACE: bool = true;

    fn identity() -> Self {
        Constant(T::default())
    }

    fn set_random(_x: &mut Self, _sampler: &mut GaussianSampler) {}

    fn boxplus(x: &Self, _vec: DVectorView<'_, f64>, out: &mut Self) {
        *out = x.clone();
    }

    fn boxminus(_x: &Self, _reference: &Self, _vec: &mut DVectorViewMut<'_, f64>) {}

    fn boxplus_jac_inp(_x: &Self, _vec: DVectorView<'_, f64>) -> DMatrix<f64> {
        DMatrix::zeros(0, 0)
    }

    fn boxplus_jac_vec(_x: &Self, _vec: DVectorView<'_, f64>) -> DMatrix<f64> {
        DMatrix::zeros(0, 0)
    }

    fn boxminus_jac_inp(_x: &Self, _reference: &Self) -> DMatrix<f64> {
        DMatrix::zeros(0, 0)
    }

    fn boxminus_jac_ref(_x: &Self, _reference: &Self) -> DMatrix<f64> {
        DMatrix::zeros(0, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{DVector, Vector3};

    fn boxplus_owned<T: ElementTraits>(x: &T, v: &DVector<f64>) -> T {
        let mut out = T::identity();
        T::boxplus(x, v.rows(0, T::DIM), &mut out);
        out
    }

    fn boxminus_owned<T: ElementTraits>(x: &T, reference: &T) -> DVector<f64> {
        let mut v = DVector::zeros(T::DIM);
        {
            let mut view = v.rows_mut(0, T::DIM);
            T::boxminus(x, reference, &mut view);
        }
        v
    }

    fn check_boxplus_zero<T: ElementTraits>(x: &T, tol: f64) {
        let zero = DVector::zeros(T::DIM);
        let out = boxplus_owned(x, &zero);
        let diff = boxminus_owned(&out, x);
        assert!(diff.norm() < tol, "boxplus with zero moved the element");
    }

    fn check_roundtrip<T: ElementTraits>(x: &T, y: &T, tol: f64) {
        let v = boxminus_owned(y, x);
        let recovered = boxplus_owned(x, &v);
        let diff = boxminus_owned(&recovered, y);
        assert!(diff.norm() < tol, "boxplus(x, boxminus(y, x)) != y");
    }

    #[test]
    fn scalar_and_vector_identities() {
        let mut sampler = GaussianSampler::from_seed(3);
        let mut s = 0.0f64;
        <f64 as ElementTraits>::set_random(&mut s, &mut sampler);
        check_boxplus_zero(&s, 1e-12);
        check_roundtrip(&s, &1.75, 1e-12);

        let mut v = Vector3::zeros();
        <Vector3<f64> as ElementTraits>::set_random(&mut v, &mut sampler);
        check_boxplus_zero(&v, 1e-12);
        check_roundtrip(&v, &Vector3::new(-2.0, 0.5, 4.0), 1e-12);
    }

    #[test]
    fn quaternion_identities() {
        let mut sampler = GaussianSampler::from_seed(5);
        let mut q = UnitQuaternion::identity();
        <UnitQuaternion<f64> as ElementTraits>::set_random(&mut q, &mut sampler);
        let r = UnitQuaternion::from_euler_angles(0.4, -0.3, 0.8);
        check_boxplus_zero(&q, 1e-9);
        check_roundtrip(&r, &q, 1e-6);
    }

    #[test]
    fn array_dispatches_blockwise() {
        let x: [Vector3<f64>; 4] = <[Vector3<f64>; 4]>::identity();
        assert_eq!(<[Vector3<f64>; 4] as ElementTraits>::DIM, 12);
        let v = DVector::from_fn(12, |i, _| i as f64);
        let out = boxplus_owned(&x, &v);
        assert_relative_eq!(out[2], Vector3::new(6.0, 7.0, 8.0));
        check_roundtrip(&x, &out, 1e-12);
    }

    #[test]
    fn constant_has_no_tangent() {
        let c = Constant(42u32);
        assert_eq!(c.dim(), 0);
        let out = boxplus_owned(&c, &DVector::zeros(0));
        assert_eq!(out, c);
    }

    #[test]
    fn quaternion_boxplus_jacobians_match_finite_difference() {
        let q = UnitQuaternion::from_euler_angles(0.3, 0.2, -0.5);
        let v = DVector::from_vec(vec![0.2, -0.1, 0.4]);
        let step = 1e-6;

        let j_inp = <UnitQuaternion<f64> as ElementTraits>::boxplus_jac_inp(&q, v.rows(0, 3));
        let j_vec = <UnitQuaternion<f64> as ElementTraits>::boxplus_jac_vec(&q, v.rows(0, 3));
        let base = boxplus_owned(&q, &v);
        for k in 0..3 {
            let mut dv = DVector::zeros(3);
            dv[k] = step;

            let q_plus = boxplus_owned(&q, &dv);
            let q_minus = boxplus_owned(&q, &(-dv.clone()));
            let fd_inp = (boxminus_owned(&boxplus_owned(&q_plus, &v), &base)
                - boxminus_owned(&boxplus_owned(&q_minus, &v), &base))
                / (2.0 * step);

            let fd_vec = (boxminus_owned(&boxplus_owned(&q, &(v.clone() + dv.clone())), &base)
                - boxminus_owned(&boxplus_owned(&q, &(v.clone() - dv)), &base))
                / (2.0 * step);

            for r in 0..3 {
                assert_relative_eq!(j_inp[(r, k)], fd_inp[r], epsilon = 1e-6);
                assert_relative_eq!(j_vec[(r, k)], fd_vec[r], epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn erased_copy_rejects_wrong_type() {
        let mut a: Box<dyn ElementBase> = Box::new(Vector3::<f64>::zeros());
        let b: Box<dyn ElementBase> = Box::new(0.0f64);
        assert!(a.copy_from(b.as_ref()).is_err());
    }
}
