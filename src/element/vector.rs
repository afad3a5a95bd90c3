//! Named heterogeneous element tuples and their shared definitions.
//!
//! An [`ElementVectorDefinition`] is an ordered list of `(name, type, dim)`
//! entries with unique names; tangent offsets are the prefix sums of the entry
//! dimensions. An [`ElementVector`] binds one value per entry and exposes the
//! whole-tuple manifold operations over a flat tangent vector of length
//! [`dim`](ElementVector::dim).

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use nalgebra::DVector;

use crate::element::{ElementBase, ElementError, ElementTraits};
use crate::error::programmer_error;
use crate::random::GaussianSampler;

/// Layout entry of one named element inside a definition.
#[derive(Debug, Clone)]
pub struct ElementSpec {
    name: String,
    type_id: TypeId,
    type_name: &'static str,
    dim: usize,
    offset: usize,
    is_vector_space: bool,
    make: fn() -> Box<dyn ElementBase>,
}

impl ElementSpec {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Tangent offset of this element inside the flat tangent vector.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn is_vector_space(&self) -> bool {
        self.is_vector_space
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    fn instantiate(&self) -> Box<dyn ElementBase> {
        (self.make)()
    }
}

fn make_identity<T: ElementTraits>() -> Box<dyn ElementBase> {
    Box::new(T::identity())
}

/// Ordered, name-unique layout of an element vector.
#[derive(Debug, Clone, Default)]
pub struct ElementVectorDefinition {
    specs: Vec<ElementSpec>,
    index: HashMap<String, usize>,
    dim: usize,
}

impl ElementVectorDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Definition with no elements (used for empty measurements and empty
    /// `pre` blocks of unary residuals).
    pub fn empty() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Append an element of type `T` under `name`.
    pub fn add_element<T: ElementTraits>(&mut self, name: &str) -> Result<(), ElementError> {
        if self.index.contains_key(name) {
            programmer_error!(ElementError::DuplicateName {
                name: name.to_string(),
            });
        }
        self.index.insert(name.to_string(), self.specs.len());
        self.specs.push(ElementSpec {
            name: name.to_string(),
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            dim: T::DIM,
            offset: self.dim,
            is_vector_space: T::IS_VECTOR_SPACE,
            make: make_identity::<T>,
        });
        self.dim += T::DIM;
        Ok(())
    }

    /// Builder-style variant of [`add_element`](Self::add_element).
    pub fn with_element<T: ElementTraits>(mut self, name: &str) -> Result<Self, ElementError> {
        self.add_element::<T>(name)?;
        Ok(self)
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Total tangent dimension (sum of element dims).
    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn find(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn index_of(&self, name: &str) -> Result<usize, ElementError> {
        match self.find(name) {
            Some(index) => Ok(index),
            None => programmer_error!(ElementError::NameMismatch {
                name: name.to_string(),
            }),
        }
    }

    pub fn spec(&self, index: usize) -> &ElementSpec {
        &self.specs[index]
    }

    pub fn specs(&self) -> &[ElementSpec] {
        &self.specs
    }

    /// Tangent offset of element `index`.
    pub fn offset(&self, index: usize) -> usize {
        self.specs[index].offset
    }

    /// Structural equality: same names, same types, same order.
    pub fn matches(&self, other: &Self) -> bool {
        self.specs.len() == other.specs.len()
            && self
                .specs
                .iter()
                .zip(other.specs.iter())
                .all(|(a, b)| a.name == b.name && a.type_id == b.type_id)
    }

    /// Name-keyed union of two definitions. Elements of `other` whose names are
    /// new are appended in order; colliding names must agree on the type.
    pub fn union(&self, other: &Self) -> Result<Self, ElementError> {
        let mut merged = self.clone();
        for spec in &other.specs {
            match merged.index.get(&spec.name) {
                Some(&i) => {
                    if merged.specs[i].type_id != spec.type_id {
                        programmer_error!(ElementError::TypeCollision {
                            name: spec.name.clone(),
                        });
                    }
                }
                None => {
                    let mut spec = spec.clone();
                    spec.offset = merged.dim;
                    merged.index.insert(spec.name.clone(), merged.specs.len());
                    merged.dim += spec.dim;
                    merged.specs.push(spec);
                }
            }
        }
        Ok(merged)
    }
}

/// A bound instance of a definition: one value per element.
#[derive(Debug)]
pub struct ElementVector {
    definition: Arc<ElementVectorDefinition>,
    elements: Vec<Box<dyn ElementBase>>,
}

impl Clone for ElementVector {
    fn clone(&self) -> Self {
        ElementVector {
            definition: self.definition.clone(),
            elements: self.elements.iter().map(|e| e.clone_box()).collect(),
        }
    }
}

impl ElementVector {
    /// New vector with every element at its identity.
    pub fn new(definition: Arc<ElementVectorDefinition>) -> Self {
        let elements = definition.specs().iter().map(|s| s.instantiate()).collect();
        ElementVector {
            definition,
            elements,
        }
    }

    /// Vector over the empty definition; doubles as the empty measurement.
    pub fn empty() -> Self {
        Self::new(ElementVectorDefinition::empty())
    }

    pub fn definition(&self) -> &Arc<ElementVectorDefinition> {
        &self.definition
    }

    pub fn dim(&self) -> usize {
        self.definition.dim()
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    fn same_definition(&self, other: &ElementVector) -> bool {
        Arc::ptr_eq(&self.definition, &other.definition)
            || self.definition.matches(&other.definition)
    }

    /// Typed read access by name.
    pub fn get<T: ElementTraits>(&self, name: &str) -> Result<&T, ElementError> {
        let index = self.definition.index_of(name)?;
        self.get_by_index(index)
    }

    /// Typed write access by name.
    pub fn get_mut<T: ElementTraits>(&mut self, name: &str) -> Result<&mut T, ElementError> {
        let index = self.definition.index_of(name)?;
        self.get_by_index_mut(index)
    }

    pub fn get_by_index<T: ElementTraits>(&self, index: usize) -> Result<&T, ElementError> {
        match self.elements[index].as_any().downcast_ref::<T>() {
            Some(value) => Ok(value),
            None => programmer_error!(ElementError::TypeMismatch {
                expected: std::any::type_name::<T>(),
                found: self.definition.spec(index).type_name(),
            }),
        }
    }

    pub fn get_by_index_mut<T: ElementTraits>(
        &mut self,
        index: usize,
    ) -> Result<&mut T, ElementError> {
        let found = self.definition.spec(index).type_name();
        match self.elements[index].as_any_mut().downcast_mut::<T>() {
            Some(value) => Ok(value),
            None => programmer_error!(ElementError::TypeMismatch {
                expected: std::any::type_name::<T>(),
                found,
            }),
        }
    }

    /// Untyped element access (used by the whole-tuple operations).
    pub fn element(&self, index: usize) -> &dyn ElementBase {
        self.elements[index].as_ref()
    }

    pub fn set_identity(&mut self) {
        for element in &mut self.elements {
            element.set_identity();
        }
    }

    pub fn set_random(&mut self, sampler: &mut GaussianSampler) {
        for element in &mut self.elements {
            element.set_random(sampler);
        }
    }

    /// `out = self ⊞ vec`, dispatched per element over its tangent slice.
    pub fn box_plus(&self, vec: &DVector<f64>, out: &mut ElementVector) -> Result<(), ElementError> {
        if vec.len() != self.dim() {
            programmer_error!(ElementError::DimensionMismatch {
                expected: self.dim(),
                actual: vec.len(),
            });
        }
        if !self.same_definition(out) {
            programmer_error!(ElementError::DefinitionMismatch);
        }
        for (i, spec) in self.definition.specs().iter().enumerate() {
            self.elements[i].boxplus(
                vec.rows(spec.offset(), spec.dim()),
                out.elements[i].as_mut(),
            )?;
        }
        Ok(())
    }

    /// In-place `self = self ⊞ vec`.
    pub fn box_plus_assign(&mut self, vec: &DVector<f64>) -> Result<(), ElementError> {
        if vec.len() != self.dim() {
            programmer_error!(ElementError::DimensionMismatch {
                expected: self.dim(),
                actual: vec.len(),
            });
        }
        for (i, spec) in self.definition.specs().iter().enumerate() {
            let current = self.elements[i].clone_box();
            current.boxplus(
                vec.rows(spec.offset(), spec.dim()),
                self.elements[i].as_mut(),
            )?;
        }
        Ok(())
    }

    /// `out = self ⊟ reference`; both vectors must share a definition.
    pub fn box_minus(
        &self,
        reference: &ElementVector,
        out: &mut DVector<f64>,
    ) -> Result<(), ElementError> {
        if !self.same_definition(reference) {
            programmer_error!(ElementError::DefinitionMismatch);
        }
        if out.len() != self.dim() {
            programmer_error!(ElementError::DimensionMismatch {
                expected: self.dim(),
                actual: out.len(),
            });
        }
        for (i, spec) in self.definition.specs().iter().enumerate() {
            self.elements[i].boxminus(
                reference.elements[i].as_ref(),
                out.rows_mut(spec.offset(), spec.dim()),
            )?;
        }
        Ok(())
    }

    /// Convenience wrapper allocating the tangent for `self ⊟ reference`.
    pub fn box_minus_owned(&self, reference: &ElementVector) -> Result<DVector<f64>, ElementError> {
        let mut out = DVector::zeros(self.dim());
        self.box_minus(reference, &mut out)?;
        Ok(out)
    }

    /// Copy values for every name present in both vectors; other elements keep
    /// their current value. Shared names must agree on the element type.
    pub fn assign_subset(&mut self, source: &ElementVector) -> Result<(), ElementError> {
        for (i, spec) in self.definition.specs().iter().enumerate() {
            if let Some(j) = source.definition.find(spec.name()) {
                self.elements[i].copy_from(source.elements[j].as_ref())?;
            }
        }
        Ok(())
    }

    /// Full copy; requires identical definitions.
    pub fn copy_from(&mut self, other: &ElementVector) -> Result<(), ElementError> {
        if !self.same_definition(other) {
            programmer_error!(ElementError::DefinitionMismatch);
        }
        for (dst, src) in self.elements.iter_mut().zip(other.elements.iter()) {
            dst.copy_from(src.as_ref())?;
        }
        Ok(())
    }
}

impl fmt::Display for ElementVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, spec) in self.definition.specs().iter().enumerate() {
            writeln!(f, "{}: {}", spec.name(), self.elements[i].print())?;
        }
        Ok(())
    }
}
