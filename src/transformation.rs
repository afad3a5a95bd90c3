//! Typed maps between element-vector definitions.
//!
//! A [`Transformation`] carries an analytic Jacobian with respect to the input
//! tangent; covariance propagation and a finite-difference self-test come for
//! free from the two required methods.

use std::fmt;
use std::sync::Arc;

use nalgebra::{DMatrix, DMatrixViewMut, DVector};

use crate::element::{ElementVector, ElementVectorDefinition};
use crate::error::{FilterError, FilterResult};

/// Map `input -> output` between two element-vector definitions.
pub trait Transformation: fmt::Debug {
    fn input_definition(&self) -> &Arc<ElementVectorDefinition>;

    fn output_definition(&self) -> &Arc<ElementVectorDefinition>;

    /// Evaluate the map. `out` is bound to the output definition.
    fn transform(&self, out: &mut ElementVector, input: &ElementVector) -> FilterResult<()>;

    /// Analytic Jacobian; `jac` has `output.dim()` rows and `input.dim()` columns.
    fn jac_transform(&self, jac: &mut DMatrix<f64>, input: &ElementVector) -> FilterResult<()>;

    /// Allocate and fill the output.
    fn transform_state(&self, input: &ElementVector) -> FilterResult<ElementVector> {
        let mut out = ElementVector::new(self.output_definition().clone());
        self.transform(&mut out, input)?;
        Ok(out)
    }

    /// Propagate an input covariance through the map: `J · P · Jᵀ`.
    fn transform_cov(
        &self,
        input: &ElementVector,
        cov_in: &DMatrix<f64>,
    ) -> FilterResult<DMatrix<f64>> {
        let in_dim = self.input_definition().dim();
        if cov_in.nrows() != in_dim || cov_in.ncols() != in_dim {
            return Err(FilterError::InvalidInput(format!(
                "covariance must be {in_dim}x{in_dim}, got {}x{}",
                cov_in.nrows(),
                cov_in.ncols()
            )));
        }
        let mut jac = DMatrix::zeros(self.output_definition().dim(), in_dim);
        self.jac_transform(&mut jac, input)?;
        Ok(&jac * cov_in * jac.transpose())
    }

    /// Mutable Jacobian sub-block for output element `out_idx` with respect to
    /// input element `in_idx`.
    fn jac_block<'a>(
        &self,
        jac: &'a mut DMatrix<f64>,
        out_idx: usize,
        in_idx: usize,
    ) -> DMatrixViewMut<'a, f64> {
        let out_spec = self.output_definition().spec(out_idx);
        let in_spec = self.input_definition().spec(in_idx);
        jac.view_mut(
            (out_spec.offset(), in_spec.offset()),
            (out_spec.dim(), in_spec.dim()),
        )
    }

    /// Central-difference Jacobian, used by [`jac_test`](Self::jac_test).
    fn jac_finite_difference(
        &self,
        jac: &mut DMatrix<f64>,
        input: &ElementVector,
        step: f64,
    ) -> FilterResult<()> {
        let in_dim = self.input_definition().dim();
        for col in 0..in_dim {
            let mut delta = DVector::zeros(in_dim);
            delta[col] = step;
            let mut plus = input.clone();
            plus.box_plus_assign(&delta)?;
            delta[col] = -step;
            let mut minus = input.clone();
            minus.box_plus_assign(&delta)?;

            let out_plus = self.transform_state(&plus)?;
            let out_minus = self.transform_state(&minus)?;
            let diff = out_plus.box_minus_owned(&out_minus)?;
            jac.column_mut(col).copy_from(&(diff / (2.0 * step)));
        }
        Ok(())
    }

    /// Compare the analytic Jacobian against central differences.
    fn jac_test(&self, input: &ElementVector, step: f64, tolerance: f64) -> FilterResult<()> {
        let rows = self.output_definition().dim();
        let cols = self.input_definition().dim();
        let mut analytic = DMatrix::zeros(rows, cols);
        self.jac_transform(&mut analytic, input)?;
        let mut numeric = DMatrix::zeros(rows, cols);
        self.jac_finite_difference(&mut numeric, input, step)?;

        let max_deviation = (&analytic - &numeric).abs().max();
        if max_deviation > tolerance {
            return Err(FilterError::Numeric(format!(
                "transformation Jacobian deviates from finite differences by {max_deviation:.3e} \
                 (tolerance {tolerance:.3e})"
            )));
        }
        Ok(())
    }
}
