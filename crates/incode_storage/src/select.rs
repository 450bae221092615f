//! Adapters that turn index-returning code functions into key selections.
//!
//! Codes answer queries such as "which particle escaped" or "what are the
//! children of this node" with code indices. These adapters translate the
//! particles going in to indices and the indices coming out back to keys,
//! dropping any index the storage does not manage.

use tracing::debug;

use crate::error::{CodeResult, StorageError, StorageResult};
use crate::key::EntityKey;
use crate::key_map::KeyLookup;
use crate::method::{MethodSpecification, code_failure};
use crate::particles::InCodeParticleStorage;
use crate::value::{CodeIndex, Quantity};

/// `indices = query(arguments...)`.
pub type QueryFunction = dyn Fn(&[Quantity]) -> CodeResult<Vec<CodeIndex>>;

/// `(out_1, out_2, ...) = links(indices)`, one array per output.
pub type LinkFunction = dyn Fn(&[CodeIndex]) -> CodeResult<Vec<Vec<CodeIndex>>>;

/// `counts = number_of_links(indices)`.
pub type LinkCountFunction = dyn Fn(&[CodeIndex]) -> CodeResult<Vec<usize>>;

/// `targets = link(indices, ranks)`, one target per `(index, rank)` pair.
pub type LinkLookupFunction = dyn Fn(&[CodeIndex], &[usize]) -> CodeResult<Vec<CodeIndex>>;

/// `query_ids = set_query(arguments...)`, staging a query inside the code.
pub type SetQueryFunction = dyn Fn(&[Quantity]) -> CodeResult<Vec<i64>>;

/// `count = get_number_of_results(query_ids...)` for the staged query.
pub type ResultCountFunction = dyn Fn(&[i64]) -> CodeResult<usize>;

/// `indices = get_result(query_ids, ranks)` for the staged query.
pub type ResultLookupFunction = dyn Fn(&[i64], &[usize]) -> CodeResult<Vec<CodeIndex>>;

/// `results = compute(indices, arguments...)`.
pub type ComputeFunction = dyn Fn(&[CodeIndex], &[Quantity]) -> CodeResult<Vec<Quantity>>;

fn known_keys(storage: &InCodeParticleStorage, indices: &[CodeIndex]) -> Vec<EntityKey> {
    storage
        .keys_of(indices)
        .into_iter()
        .filter(|key| key.is_valid())
        .collect()
}

/// A code query returning particle indices, e.g. `get_escaper()`.
pub struct QueryMethod {
    name: String,
    function: Box<QueryFunction>,
}

impl QueryMethod {
    pub fn new<F>(name: impl Into<String>, function: F) -> Self
    where
        F: Fn(&[Quantity]) -> CodeResult<Vec<CodeIndex>> + 'static,
    {
        Self {
            name: name.into(),
            function: Box::new(function),
        }
    }

    /// Run the query and return the keys of the particles it selected.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Code`] if the code fails.
    pub fn apply(&self, storage: &InCodeParticleStorage, arguments: &[Quantity]) -> StorageResult<Vec<EntityKey>> {
        debug!(method = self.name, "calling query");
        let indices = (self.function)(arguments).map_err(|e| code_failure(&self.name, e))?;
        Ok(known_keys(storage, &indices))
    }
}

/// A per-particle function returning a fixed number of linked particles,
/// e.g. `child1, child2 = get_children(index)`.
pub struct SpecificSelectMethod {
    spec: MethodSpecification,
    function: Box<LinkFunction>,
}

impl SpecificSelectMethod {
    /// Wrap `function`; the number of links is the number of declared
    /// outputs.
    pub fn new<F>(spec: MethodSpecification, function: F) -> Self
    where
        F: Fn(&[CodeIndex]) -> CodeResult<Vec<Vec<CodeIndex>>> + 'static,
    {
        Self {
            spec,
            function: Box::new(function),
        }
    }

    fn call(&self, indices: &[CodeIndex]) -> StorageResult<Vec<Vec<CodeIndex>>> {
        debug!(method = self.spec.name, count = indices.len(), "calling link function");
        let outputs = (self.function)(indices).map_err(|e| code_failure(&self.spec.name, e))?;
        if outputs.len() != self.spec.output_names.len() {
            return Err(StorageError::ResultArity {
                method: self.spec.name.clone(),
                expected: self.spec.output_names.len(),
                actual: outputs.len(),
            });
        }
        for (name, output) in self.spec.output_names.iter().zip(&outputs) {
            if output.len() != indices.len() {
                return Err(StorageError::LengthMismatch {
                    attribute: name.clone(),
                    expected: indices.len(),
                    actual: output.len(),
                });
            }
        }
        Ok(outputs)
    }

    /// Keys of the particles linked to `key`. Unset links are left out.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::UnknownKey`] or the code's error.
    pub fn apply_on_one(&self, storage: &InCodeParticleStorage, key: EntityKey) -> StorageResult<Vec<EntityKey>> {
        let index = storage.index_of(key)?;
        let outputs = self.call(&[index])?;
        let linked: Vec<CodeIndex> = outputs.iter().map(|output| output[0]).collect();
        Ok(known_keys(storage, &linked))
    }

    /// Linked keys for every particle in the storage, in key order.
    ///
    /// Calls the code once when it accepts arrays, once per particle
    /// otherwise.
    ///
    /// # Errors
    ///
    /// Returns the code's error.
    pub fn apply_on_all(&self, storage: &InCodeParticleStorage) -> StorageResult<Vec<Vec<EntityKey>>> {
        let indices = storage.indices_of_all();
        if indices.is_empty() {
            return Ok(Vec::new());
        }
        if !self.spec.handles_arrays() {
            return storage
                .all_keys()
                .iter()
                .map(|&key| self.apply_on_one(storage, key))
                .collect();
        }

        let outputs = self.call(&indices)?;
        Ok((0..indices.len())
            .map(|member| {
                let linked: Vec<CodeIndex> = outputs.iter().map(|output| output[member]).collect();
                known_keys(storage, &linked)
            })
            .collect())
    }
}

/// A per-particle function returning a variable number of linked particles,
/// asked for by rank, e.g. `get_neighbour(index, rank)` paired with
/// `get_number_of_neighbours(index)`.
pub struct SpecificSelectSubsetMethod {
    name: String,
    function: Box<LinkLookupFunction>,
    count: Option<Box<LinkCountFunction>>,
}

impl SpecificSelectSubsetMethod {
    /// Wrap a lookup function. Without a count function every particle is
    /// assumed to have exactly one link, at rank 0.
    pub fn new<F>(name: impl Into<String>, function: F) -> Self
    where
        F: Fn(&[CodeIndex], &[usize]) -> CodeResult<Vec<CodeIndex>> + 'static,
    {
        Self {
            name: name.into(),
            function: Box::new(function),
            count: None,
        }
    }

    /// Ask `count` how many links each particle has.
    #[must_use]
    pub fn with_count<F>(mut self, count: F) -> Self
    where
        F: Fn(&[CodeIndex]) -> CodeResult<Vec<usize>> + 'static,
    {
        self.count = Some(Box::new(count));
        self
    }

    /// Keys of the particles linked to `key`, in rank order.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::UnknownKey`] or the code's error.
    pub fn apply_on_one(&self, storage: &InCodeParticleStorage, key: EntityKey) -> StorageResult<Vec<EntityKey>> {
        let index = storage.index_of(key)?;
        let count = match &self.count {
            Some(count) => {
                let counts = count(&[index]).map_err(|e| code_failure(&self.name, e))?;
                counts.first().copied().unwrap_or(0)
            }
            None => 1,
        };
        if count == 0 {
            return Ok(Vec::new());
        }

        let ranks: Vec<usize> = (0..count).collect();
        let indices = vec![index; count];
        debug!(method = self.name, count, "calling link lookup");
        let linked = (self.function)(&indices, &ranks).map_err(|e| code_failure(&self.name, e))?;
        Ok(known_keys(storage, &linked))
    }

    /// Linked keys for every particle in the storage, in key order.
    ///
    /// # Errors
    ///
    /// Returns the code's error.
    pub fn apply_on_all(&self, storage: &InCodeParticleStorage) -> StorageResult<Vec<Vec<EntityKey>>> {
        storage
            .all_keys()
            .iter()
            .map(|&key| self.apply_on_one(storage, key))
            .collect()
    }
}

/// A staged query over the whole set: set the query, count the results,
/// then fetch them by rank.
///
/// The identifiers `set_query` returns (if anything) are handed to the
/// count and lookup stages, so a code can keep several queries open.
pub struct SubsetSelectMethod {
    name: String,
    function: Box<ResultLookupFunction>,
    set_query: Option<Box<SetQueryFunction>>,
    count: Option<Box<ResultCountFunction>>,
}

impl SubsetSelectMethod {
    /// Wrap the result lookup. Without a count function the query has
    /// exactly one result, at rank 0.
    pub fn new<F>(name: impl Into<String>, function: F) -> Self
    where
        F: Fn(&[i64], &[usize]) -> CodeResult<Vec<CodeIndex>> + 'static,
    {
        Self {
            name: name.into(),
            function: Box::new(function),
            set_query: None,
            count: None,
        }
    }

    /// Pass the caller's arguments to `set_query` before counting.
    #[must_use]
    pub fn with_query<F>(mut self, set_query: F) -> Self
    where
        F: Fn(&[Quantity]) -> CodeResult<Vec<i64>> + 'static,
    {
        self.set_query = Some(Box::new(set_query));
        self
    }

    #[must_use]
    pub fn with_count<F>(mut self, count: F) -> Self
    where
        F: Fn(&[i64]) -> CodeResult<usize> + 'static,
    {
        self.count = Some(Box::new(count));
        self
    }

    /// Run the staged query and return the selected keys.
    ///
    /// # Errors
    ///
    /// Returns the first failing stage's error.
    pub fn apply_on_all(
        &self,
        storage: &InCodeParticleStorage,
        arguments: &[Quantity],
    ) -> StorageResult<Vec<EntityKey>> {
        let query_ids = match &self.set_query {
            Some(set_query) => set_query(arguments).map_err(|e| code_failure(&self.name, e))?,
            None => Vec::new(),
        };
        let count = match &self.count {
            Some(count) => count(&query_ids).map_err(|e| code_failure(&self.name, e))?,
            None => 1,
        };
        if count == 0 {
            return Ok(Vec::new());
        }

        let ranks: Vec<usize> = (0..count).collect();
        debug!(method = self.name, count, "fetching query results");
        let indices = (self.function)(&query_ids, &ranks).map_err(|e| code_failure(&self.name, e))?;
        Ok(known_keys(storage, &indices))
    }
}

/// A computation over particles, e.g.
/// `potential = get_potential_at(index, eps)`.
pub struct ComputeMethod {
    name: String,
    function: Box<ComputeFunction>,
}

impl ComputeMethod {
    pub fn new<F>(name: impl Into<String>, function: F) -> Self
    where
        F: Fn(&[CodeIndex], &[Quantity]) -> CodeResult<Vec<Quantity>> + 'static,
    {
        Self {
            name: name.into(),
            function: Box::new(function),
        }
    }

    /// Compute for one particle.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::UnknownKey`] or the code's error.
    pub fn apply_on_one(
        &self,
        storage: &InCodeParticleStorage,
        key: EntityKey,
        arguments: &[Quantity],
    ) -> StorageResult<Vec<Quantity>> {
        let index = storage.index_of(key)?;
        self.call(&[index], arguments)
    }

    /// Compute for every particle in one call.
    ///
    /// # Errors
    ///
    /// Returns the code's error.
    pub fn apply_on_all(
        &self,
        storage: &InCodeParticleStorage,
        arguments: &[Quantity],
    ) -> StorageResult<Vec<Quantity>> {
        self.call(&storage.indices_of_all(), arguments)
    }

    fn call(&self, indices: &[CodeIndex], arguments: &[Quantity]) -> StorageResult<Vec<Quantity>> {
        debug!(method = self.name, count = indices.len(), "calling compute function");
        (self.function)(indices, arguments).map_err(|e| code_failure(&self.name, e))
    }
}

macro_rules! named_debug {
    ($($ty:ident => $name:ident),* $(,)?) => {
        $(
            impl std::fmt::Debug for $ty {
                fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                    f.debug_struct(stringify!($ty))
                        .field("method", &self.$name)
                        .finish_non_exhaustive()
                }
            }
        )*
    };
}

named_debug! {
    QueryMethod => name,
    SpecificSelectMethod => spec,
    SpecificSelectSubsetMethod => name,
    SubsetSelectMethod => name,
    ComputeMethod => name,
}
