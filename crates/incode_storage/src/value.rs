//! Attribute values exchanged with codes.
//!
//! Every attribute travels as a [`Quantity`]: a flat array of values, the
//! unit they are expressed in and the shape the array should be read as.
//! Unit arithmetic lives outside this crate; here the unit is a tag that is
//! carried along, with one exception: [`Unit::ObjectKey`] marks values that
//! identify other particles.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{StorageError, StorageResult};
use crate::key::EntityKey;

/// A code-local integer handle for an entity.
///
/// Only meaningful to the code that handed it out; codes may reuse indices
/// after deletion.
pub type CodeIndex = i64;

/// Extra keyword arguments passed unchanged to getters, setters and range
/// functions (e.g. the number of the grid inside a multi-grid code).
pub type Keywords = BTreeMap<String, Quantity>;

/// The unit tag of a [`Quantity`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Unit {
    /// Dimensionless.
    #[default]
    None,
    /// The values are entity keys of particles in the same storage.
    ObjectKey,
    /// A unit managed by the unit system, identified by name.
    Named(String),
}

/// The typed element storage of a [`Quantity`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Values {
    Float(Vec<f64>),
    Int(Vec<i64>),
    Key(Vec<EntityKey>),
}

impl Values {
    /// Returns the number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Values::Float(v) => v.len(),
            Values::Int(v) => v.len(),
            Values::Key(v) => v.len(),
        }
    }

    /// Returns `true` if there are no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An array of attribute values with a unit and a shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quantity {
    values: Values,
    unit: Unit,
    shape: Vec<usize>,
}

impl Quantity {
    /// Create a one-dimensional quantity from typed values.
    #[must_use]
    pub fn new(values: Values, unit: Unit) -> Self {
        let shape = vec![values.len()];
        Self {
            values,
            unit,
            shape,
        }
    }

    /// Create a dimensionless float array.
    #[must_use]
    pub fn floats(values: Vec<f64>) -> Self {
        Self::new(Values::Float(values), Unit::None)
    }

    /// Create a dimensionless integer array.
    #[must_use]
    pub fn ints(values: Vec<i64>) -> Self {
        Self::new(Values::Int(values), Unit::None)
    }

    /// Create an array of code indices.
    #[must_use]
    pub fn indices(values: Vec<CodeIndex>) -> Self {
        Self::ints(values)
    }

    /// Create an array of particle references tagged with [`Unit::ObjectKey`].
    #[must_use]
    pub fn object_keys(keys: Vec<EntityKey>) -> Self {
        Self::new(Values::Key(keys), Unit::ObjectKey)
    }

    /// Replace the unit tag.
    #[must_use]
    pub fn with_unit(mut self, unit: Unit) -> Self {
        self.unit = unit;
        self
    }

    /// Returns the unit tag.
    #[must_use]
    pub fn unit(&self) -> &Unit {
        &self.unit
    }

    /// Returns `true` if the values reference other particles by key.
    #[must_use]
    pub fn is_object_key(&self) -> bool {
        self.unit == Unit::ObjectKey
    }

    /// Returns the typed values in row-major order.
    #[must_use]
    pub fn values(&self) -> &Values {
        &self.values
    }

    /// Returns the shape. An empty shape is a single (0-d) value.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Returns the total number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns `true` if there are no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Returns the float values, if this is a float array.
    #[must_use]
    pub fn as_floats(&self) -> Option<&[f64]> {
        match &self.values {
            Values::Float(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the integer values, if this is an integer array.
    #[must_use]
    pub fn as_ints(&self) -> Option<&[i64]> {
        match &self.values {
            Values::Int(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the keys, if this is an array of particle references.
    #[must_use]
    pub fn as_keys(&self) -> Option<&[EntityKey]> {
        match &self.values {
            Values::Key(v) => Some(v),
            _ => None,
        }
    }

    /// Read the same values as an array of a different shape.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidSelection`] if the shape does not hold
    /// exactly [`Quantity::len`] elements.
    pub fn reshape(mut self, shape: Vec<usize>) -> StorageResult<Self> {
        let size: usize = shape.iter().product();
        if size != self.len() {
            return Err(StorageError::InvalidSelection(format!(
                "cannot reshape {} values into {:?}",
                self.len(),
                shape
            )));
        }
        self.shape = shape;
        Ok(self)
    }

    /// Returns the same values as a one-dimensional array.
    #[must_use]
    pub fn flattened(mut self) -> Self {
        self.shape = vec![self.len()];
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_quantity_is_one_dimensional() {
        let q = Quantity::floats(vec![1.0, 2.0, 3.0]);
        assert_eq!(q.shape(), &[3]);
        assert_eq!(q.len(), 3);
        assert_eq!(q.unit(), &Unit::None);
    }

    #[test]
    fn test_object_keys_are_tagged() {
        let q = Quantity::object_keys(vec![EntityKey(4), EntityKey::NONE]);
        assert!(q.is_object_key());
        assert_eq!(q.as_keys(), Some(&[EntityKey(4), EntityKey::NONE][..]));
        assert!(q.as_floats().is_none());
    }

    #[test]
    fn test_reshape() {
        let q = Quantity::ints((0..6).collect()).reshape(vec![2, 3]).unwrap();
        assert_eq!(q.shape(), &[2, 3]);
        assert_eq!(q.clone().flattened().shape(), &[6]);
        assert!(q.reshape(vec![4, 2]).is_err());
    }

    #[test]
    fn test_reshape_to_scalar() {
        let q = Quantity::floats(vec![7.5]).reshape(vec![]).unwrap();
        assert!(q.shape().is_empty());
        assert_eq!(q.len(), 1);
    }
}
