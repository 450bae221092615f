//! Attribute registry shared by particle and grid storages.
//!
//! The registry owns the getter and setter wrappers of one storage and
//! decides which of them to call for a requested set of attributes.
//!
//! Getters are selected in three passes:
//!
//! 1. A getter whose attributes are exactly the requested set.
//! 2. Largest-first, every getter whose attributes all still need fetching.
//! 3. Smallest-first, any getter that provides at least one attribute still
//!    missing. Its extra outputs are fetched and discarded.
//!
//! Setters are only ever selected when all of their attributes are being
//! written, since a setter cannot be called with part of its inputs.

use std::collections::{BTreeSet, HashSet};

use tracing::trace;

use crate::error::{StorageError, StorageResult};
use crate::key_map::KeyLookup;
use crate::method::{AttributeGetter, AttributeMap, AttributeSetter};
use crate::value::{CodeIndex, Keywords, Quantity};

/// Getters, setters and call routing for one storage.
pub struct AttributeRegistry {
    getters: Vec<Box<dyn AttributeGetter>>,
    setters: Vec<Box<dyn AttributeSetter>>,
    keywords: Keywords,
}

impl AttributeRegistry {
    /// Create a registry over the given wrappers.
    #[must_use]
    pub fn new(
        getters: Vec<Box<dyn AttributeGetter>>,
        setters: Vec<Box<dyn AttributeSetter>>,
        keywords: Keywords,
    ) -> Self {
        Self {
            getters,
            setters,
            keywords,
        }
    }

    /// Set the indexing parameter name on every wrapper.
    pub fn set_indexing_parameter(&mut self, name: &str) {
        for getter in &mut self.getters {
            getter.set_indexing_parameter(name);
        }
        for setter in &mut self.setters {
            setter.set_indexing_parameter(name);
        }
    }

    /// Append a getter.
    pub fn push_getter(&mut self, getter: Box<dyn AttributeGetter>) {
        self.getters.push(getter);
    }

    /// Extra keyword arguments passed to every call.
    #[must_use]
    pub fn keywords(&self) -> &Keywords {
        &self.keywords
    }

    /// All attributes any getter or setter knows about, sorted.
    #[must_use]
    pub fn defined_attribute_names(&self) -> Vec<String> {
        let getter_names = self.getters.iter().flat_map(|g| g.attribute_names());
        let setter_names = self.setters.iter().flat_map(|s| s.attribute_names());
        getter_names
            .chain(setter_names)
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// All attributes some setter can write, sorted.
    #[must_use]
    pub fn writable_attribute_names(&self) -> Vec<String> {
        self.setters
            .iter()
            .flat_map(|s| s.attribute_names())
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// All attributes some getter can read, sorted.
    #[must_use]
    pub fn readable_attribute_names(&self) -> Vec<String> {
        self.getters
            .iter()
            .flat_map(|g| g.attribute_names())
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Choose the getters to call for `attributes`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::UnknownAttribute`] listing every attribute no
    /// getter provides.
    pub fn select_getters_for(&self, attributes: &[&str]) -> StorageResult<Vec<&dyn AttributeGetter>> {
        let requested: HashSet<&str> = attributes.iter().copied().collect();
        if requested.is_empty() {
            return Ok(Vec::new());
        }

        if let Some(getter) = self.getters.iter().find(|g| names_set(g.attribute_names()) == requested) {
            trace!(attributes = ?attributes, "exact getter match");
            return Ok(vec![&**getter]);
        }

        let mut sorted: Vec<&dyn AttributeGetter> = self.getters.iter().map(|g| &**g).collect();
        sorted.sort_by_key(|g| std::cmp::Reverse(g.attribute_names().len()));

        let mut remaining: BTreeSet<&str> = requested.into_iter().collect();
        let mut result = Vec::new();

        for &getter in &sorted {
            let names = getter.attribute_names();
            if !names.is_empty() && names.iter().all(|n| remaining.contains(n.as_str())) {
                for name in names {
                    remaining.remove(name.as_str());
                }
                result.push(getter);
            }
        }

        if !remaining.is_empty() {
            trace!(remaining = ?remaining, "falling back to partial getter cover");
            for &getter in sorted.iter().rev() {
                let names = getter.attribute_names();
                if names.iter().any(|n| remaining.contains(n.as_str())) {
                    for name in names {
                        remaining.remove(name.as_str());
                    }
                    result.push(getter);
                }
            }
        }

        if !remaining.is_empty() {
            return Err(StorageError::UnknownAttribute(
                remaining.into_iter().map(str::to_string).collect(),
            ));
        }
        Ok(result)
    }

    /// Choose the setters to call for `attributes`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::UnknownWritableAttribute`] listing every
    /// attribute that cannot be written.
    pub fn select_setters_for(&self, attributes: &[&str]) -> StorageResult<Vec<&dyn AttributeSetter>> {
        let mut remaining: BTreeSet<&str> = attributes.iter().copied().collect();
        let mut result = Vec::new();
        for setter in &self.setters {
            let names = setter.attribute_names();
            if !names.is_empty() && names.iter().all(|n| remaining.contains(n.as_str())) {
                for name in names {
                    remaining.remove(name.as_str());
                }
                result.push(&**setter);
            }
        }

        if !remaining.is_empty() {
            return Err(StorageError::UnknownWritableAttribute(
                remaining.into_iter().map(str::to_string).collect(),
            ));
        }
        Ok(result)
    }

    /// Fetch `attributes` for the given index arrays, one call per selected
    /// getter, and return the values in the order they were requested.
    ///
    /// # Errors
    ///
    /// Returns a selection error or the first failing getter's error.
    pub fn get_values(
        &self,
        keys: &dyn KeyLookup,
        attributes: &[&str],
        indices: &[Vec<CodeIndex>],
    ) -> StorageResult<Vec<Quantity>> {
        let mut mapping = AttributeMap::new();
        for getter in self.select_getters_for(attributes)? {
            mapping.extend(getter.fetch(keys, attributes, indices, &self.keywords)?);
        }

        attributes
            .iter()
            .map(|&attribute| {
                mapping
                    .get(attribute)
                    .cloned()
                    .ok_or_else(|| StorageError::UnknownAttribute(vec![attribute.to_string()]))
            })
            .collect()
    }

    /// Write `values` (parallel to `attributes`) for the given index arrays,
    /// one call per selected setter.
    ///
    /// # Errors
    ///
    /// Returns a selection error or the first failing setter's error.
    pub fn set_values(
        &self,
        attributes: &[&str],
        values: &[Quantity],
        indices: &[Vec<CodeIndex>],
    ) -> StorageResult<()> {
        for setter in self.select_setters_for(attributes)? {
            setter.apply(attributes, values, indices, &self.keywords)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for AttributeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttributeRegistry")
            .field("getters", &self.getters.len())
            .field("setters", &self.setters.len())
            .field("keywords", &self.keywords)
            .finish()
    }
}

fn names_set(names: &[String]) -> HashSet<&str> {
    names.iter().map(String::as_str).collect()
}
