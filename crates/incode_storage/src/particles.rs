//! Particle sets stored inside a code.
//!
//! [`InCodeParticleStorage`] keeps every particle's attribute values in the
//! code and only remembers which code index belongs to which
//! [`EntityKey`]. Codes are free to hand out and reuse indices however they
//! like; callers only ever see keys.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::error::{StorageError, StorageResult};
use crate::key::{EntityKey, KeyAllocator};
use crate::key_map::{KeyIndexMap, KeyLookup};
use crate::method::{
    AttributeGetter, AttributeSetter, CountMethod, DEFAULT_INDEX_NAME, DeleteMethod,
    IndexInCodeMethod, NewParticleMethod,
};
use crate::registry::AttributeRegistry;
use crate::snapshot::ParticleSnapshot;
use crate::value::{CodeIndex, Keywords, Quantity};

/// Checks that every value array has one element per particle.
pub(crate) fn check_values(count: usize, attributes: &[&str], values: &[Quantity]) -> StorageResult<()> {
    if attributes.len() != values.len() {
        return Err(StorageError::ResultArity {
            method: "attribute values".to_string(),
            expected: attributes.len(),
            actual: values.len(),
        });
    }
    for (attribute, value) in attributes.iter().zip(values) {
        if value.len() != count {
            return Err(StorageError::LengthMismatch {
                attribute: (*attribute).to_string(),
                expected: count,
                actual: value.len(),
            });
        }
    }
    Ok(())
}

/// Builder for [`InCodeParticleStorage`].
pub struct ParticleStorageBuilder {
    new_particle_method: NewParticleMethod,
    delete_particle_method: DeleteMethod,
    number_of_particles_method: CountMethod,
    getters: Vec<Box<dyn AttributeGetter>>,
    setters: Vec<Box<dyn AttributeSetter>>,
    name_of_the_index: String,
    keywords: Keywords,
    allocator: Option<KeyAllocator>,
}

impl ParticleStorageBuilder {
    /// Add an attribute getter.
    #[must_use]
    pub fn getter(mut self, getter: impl AttributeGetter + 'static) -> Self {
        self.getters.push(Box::new(getter));
        self
    }

    /// Add an attribute setter.
    #[must_use]
    pub fn setter(mut self, setter: impl AttributeSetter + 'static) -> Self {
        self.setters.push(Box::new(setter));
        self
    }

    /// Name of the parameter that carries particle indices in the code's
    /// functions (defaults to `index_of_the_particle`).
    #[must_use]
    pub fn index_name(mut self, name: impl Into<String>) -> Self {
        self.name_of_the_index = name.into();
        self
    }

    /// Pass an extra keyword argument to every getter and setter call.
    #[must_use]
    pub fn keyword(mut self, name: impl Into<String>, value: Quantity) -> Self {
        self.keywords.insert(name.into(), value);
        self
    }

    /// Draw keys from `allocator` (shared with other storages) instead of a
    /// private one.
    #[must_use]
    pub fn allocator(mut self, allocator: KeyAllocator) -> Self {
        self.allocator = Some(allocator);
        self
    }

    /// Build the storage.
    #[must_use]
    pub fn build(self) -> InCodeParticleStorage {
        let mut registry = AttributeRegistry::new(self.getters, self.setters, self.keywords);
        registry.set_indexing_parameter(&self.name_of_the_index);
        registry.push_getter(Box::new(IndexInCodeMethod::new()));

        info!(
            index_name = self.name_of_the_index,
            attributes = registry.defined_attribute_names().len(),
            "particle storage ready"
        );

        InCodeParticleStorage {
            registry,
            key_map: KeyIndexMap::new(),
            new_particle_method: self.new_particle_method,
            delete_particle_method: self.delete_particle_method,
            number_of_particles_method: self.number_of_particles_method,
            allocator: self.allocator.unwrap_or_default(),
            name_of_the_index: self.name_of_the_index,
        }
    }
}

/// Manages a set of particles stored in a code.
///
/// Maps the indices returned by the code to keys. All attribute traffic is
/// batched: one code call per selected getter or setter, however many
/// particles are involved.
#[derive(Debug)]
pub struct InCodeParticleStorage {
    registry: AttributeRegistry,
    key_map: KeyIndexMap,
    new_particle_method: NewParticleMethod,
    delete_particle_method: DeleteMethod,
    number_of_particles_method: CountMethod,
    allocator: KeyAllocator,
    name_of_the_index: String,
}

impl InCodeParticleStorage {
    /// Start building a storage over a code's creation, deletion and count
    /// functions.
    #[must_use]
    pub fn builder(
        new_particle_method: NewParticleMethod,
        delete_particle_method: DeleteMethod,
        number_of_particles_method: CountMethod,
    ) -> ParticleStorageBuilder {
        ParticleStorageBuilder {
            new_particle_method,
            delete_particle_method,
            number_of_particles_method,
            getters: Vec::new(),
            setters: Vec::new(),
            name_of_the_index: DEFAULT_INDEX_NAME.to_string(),
            keywords: Keywords::new(),
            allocator: None,
        }
    }

    /// The number of particles the code reports.
    ///
    /// This asks the code; it can differ from [`Self::key_count`] when the
    /// code added or removed particles on its own.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Code`] if the code fails.
    pub fn count(&self) -> StorageResult<usize> {
        self.number_of_particles_method.call()
    }

    /// The number of particles this storage holds keys for.
    #[must_use]
    pub fn key_count(&self) -> usize {
        self.key_map.len()
    }

    /// Add particles under the given keys with initial attribute values.
    ///
    /// The code is asked once to create all particles. Nothing is recorded
    /// unless it succeeds and returns one index per key.
    ///
    /// # Errors
    ///
    /// - [`StorageError::DuplicateKey`] if a key is already stored or repeated.
    /// - [`StorageError::InvalidKey`] for [`EntityKey::NONE`].
    /// - [`StorageError::LengthMismatch`] if a value array does not match the key count.
    /// - [`StorageError::AllocationMismatch`] if the code returns the wrong number of indices.
    /// - Argument reconciliation or code errors from the creation function.
    pub fn add_particles(
        &mut self,
        keys: &[EntityKey],
        attributes: &[&str],
        values: &[Quantity],
    ) -> StorageResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        check_values(keys.len(), attributes, values)?;
        self.key_map.check_new_keys(keys)?;

        let indices = self
            .new_particle_method
            .allocate(keys.len(), attributes, values)?;
        if indices.len() != keys.len() {
            return Err(StorageError::AllocationMismatch {
                expected: keys.len(),
                actual: indices.len(),
            });
        }
        self.key_map.insert_all(keys, &indices)?;
        debug!(count = keys.len(), "added particles");
        Ok(())
    }

    /// Add `count` particles under freshly allocated keys.
    ///
    /// # Errors
    ///
    /// See [`Self::add_particles`].
    pub fn add_new(
        &mut self,
        count: usize,
        attributes: &[&str],
        values: &[Quantity],
    ) -> StorageResult<Vec<EntityKey>> {
        let keys = self.allocator.allocate_many(count);
        self.add_particles(&keys, attributes, values)?;
        Ok(keys)
    }

    /// Delete particles from the code and forget their keys.
    ///
    /// # Errors
    ///
    /// - [`StorageError::UnknownKey`] if a key is not stored (nothing is deleted).
    /// - [`StorageError::Code`] if the code fails (nothing is forgotten).
    pub fn remove_particles(&mut self, keys: &[EntityKey]) -> StorageResult<()> {
        let indices = self.key_map.indices_of(keys)?;
        if indices.is_empty() {
            return Ok(());
        }
        self.delete_particle_method.call(&indices)?;
        self.key_map.remove_keys(keys)?;
        debug!(count = keys.len(), "removed particles");
        Ok(())
    }

    /// Fetch `attributes` for the particles with `keys`, one array per
    /// attribute in the requested order.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::UnknownKey`], a selection error or a getter error.
    pub fn get_values(&self, keys: &[EntityKey], attributes: &[&str]) -> StorageResult<Vec<Quantity>> {
        let indices = self.key_map.indices_of(keys)?;
        if indices.is_empty() {
            return Ok(attributes.iter().map(|_| Quantity::floats(Vec::new())).collect());
        }
        self.registry.get_values(&self.key_map, attributes, &[indices])
    }

    /// Fetch `attributes` for every stored particle, in key order.
    ///
    /// # Errors
    ///
    /// See [`Self::get_values`].
    pub fn get_all_values(&self, attributes: &[&str]) -> StorageResult<Vec<Quantity>> {
        self.get_values(self.key_map.keys(), attributes)
    }

    /// Write `values` (parallel to `attributes`) for the particles with `keys`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::UnknownKey`], [`StorageError::LengthMismatch`],
    /// a selection error or a setter error.
    pub fn set_values(
        &mut self,
        keys: &[EntityKey],
        attributes: &[&str],
        values: &[Quantity],
    ) -> StorageResult<()> {
        let indices = self.key_map.indices_of(keys)?;
        if indices.is_empty() {
            return Ok(());
        }
        check_values(indices.len(), attributes, values)?;
        self.registry.set_values(attributes, values, &[indices])
    }

    /// Resolve keys to code indices.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::UnknownKey`] for the first unknown key.
    pub fn indices_of(&self, keys: &[EntityKey]) -> StorageResult<Vec<CodeIndex>> {
        self.key_map.indices_of(keys)
    }

    /// Resolve one key to its code index.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::UnknownKey`] if the key is not stored.
    pub fn index_of(&self, key: EntityKey) -> StorageResult<CodeIndex> {
        self.key_map.index_of(key).ok_or(StorageError::UnknownKey(key))
    }

    /// Code indices of all stored particles, in key order.
    #[must_use]
    pub fn indices_of_all(&self) -> Vec<CodeIndex> {
        self.key_map.indices()
    }

    /// Keys of all stored particles, in insertion order.
    #[must_use]
    pub fn all_keys(&self) -> &[EntityKey] {
        self.key_map.keys()
    }

    /// Returns `true` if the key is stored here.
    #[must_use]
    pub fn has_key(&self, key: EntityKey) -> bool {
        self.key_map.contains_key(key)
    }

    /// Start managing particles the code created on its own, under fresh keys.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::DuplicateIndex`] (and adopts nothing) if an
    /// index is already managed or repeated.
    pub fn adopt_indices(&mut self, indices: &[CodeIndex]) -> StorageResult<Vec<EntityKey>> {
        self.key_map.check_new_indices(indices)?;
        let keys = self.allocator.allocate_many(indices.len());
        self.key_map.insert_all(&keys, indices)?;
        debug!(count = keys.len(), "adopted code indices");
        Ok(keys)
    }

    /// Forget particles the code deleted on its own. Unmanaged indices are
    /// ignored; returns the keys that were dropped.
    pub fn disown_indices(&mut self, indices: &[CodeIndex]) -> Vec<EntityKey> {
        let keys = self.key_map.remove_indices(indices);
        debug!(count = keys.len(), "disowned code indices");
        keys
    }

    /// All attributes this storage can get or set, sorted.
    #[must_use]
    pub fn defined_attribute_names(&self) -> Vec<String> {
        self.registry.defined_attribute_names()
    }

    /// All attributes this storage can set, sorted.
    #[must_use]
    pub fn writable_attribute_names(&self) -> Vec<String> {
        self.registry.writable_attribute_names()
    }

    /// Name of the indexing parameter of the code's functions.
    #[must_use]
    pub fn index_name(&self) -> &str {
        &self.name_of_the_index
    }

    /// The key allocator new particles draw from.
    #[must_use]
    pub fn allocator(&self) -> &KeyAllocator {
        &self.allocator
    }

    /// Copy every readable attribute of every particle out of the code.
    ///
    /// # Errors
    ///
    /// Returns any getter error.
    pub fn snapshot(&self) -> StorageResult<ParticleSnapshot> {
        let names: Vec<String> = self
            .registry
            .readable_attribute_names()
            .into_iter()
            .filter(|n| n != IndexInCodeMethod::ATTRIBUTE_NAME)
            .collect();
        let attributes: Vec<&str> = names.iter().map(String::as_str).collect();
        let values = self.get_all_values(&attributes)?;
        Ok(ParticleSnapshot {
            keys: self.key_map.keys().to_vec(),
            attributes: names.into_iter().zip(values).collect::<BTreeMap<_, _>>(),
        })
    }
}

impl KeyLookup for InCodeParticleStorage {
    fn key_of(&self, index: CodeIndex) -> EntityKey {
        self.key_map.key_of(index)
    }
}
