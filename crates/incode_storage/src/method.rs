//! Wrappers that map attribute names onto code functions.
//!
//! A code exposes plain array-in/array-out functions such as
//!
//! ```text
//! x, y, z = get_position(index)
//! set_position(index, x, y, z)
//! index = new_particle(mass, x, y, z, radius = 0)
//! ```
//!
//! The wrappers in this module attach attribute names to the positional
//! inputs and outputs of those functions so the storages can route
//! `get`/`set`/`add` requests by attribute name:
//!
//! - [`GetAttributesMethod`]: indices in, one array per attribute out.
//! - [`SetAttributesMethod`]: indices and one array per attribute in.
//! - [`NewParticleMethod`]: one array per attribute in, new indices out.
//! - [`IndexInCodeMethod`]: the built-in `index_in_code` attribute.
//!
//! Attribute names come from an explicit list or, when none is given, from
//! the parameter names declared in the function's [`MethodSpecification`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::error::{CodeError, CodeResult, StorageError, StorageResult};
use crate::key_map::KeyLookup;
use crate::value::{CodeIndex, Keywords, Quantity};

/// Name of the parameter carrying particle indices unless a storage says otherwise.
pub const DEFAULT_INDEX_NAME: &str = "index_of_the_particle";

/// Attribute values keyed by attribute name.
pub type AttributeMap = HashMap<String, Quantity>;

/// `(index arrays, keywords) -> one array per output`.
pub type GetFunction = dyn Fn(&[Vec<CodeIndex>], &Keywords) -> CodeResult<Vec<Quantity>>;

/// `(index arrays, one array per supplied input, keywords)`.
pub type SetFunction = dyn Fn(&[Vec<CodeIndex>], &[Quantity], &Keywords) -> CodeResult<()>;

/// `(number of particles, one array per supplied input) -> new indices`.
pub type NewFunction = dyn Fn(usize, &[Quantity]) -> CodeResult<Vec<CodeIndex>>;

/// `(indices)`, deletes the particles.
pub type DeleteFunction = dyn Fn(&[CodeIndex]) -> CodeResult<()>;

/// `() -> number of live particles`.
pub type CountFunction = dyn Fn() -> CodeResult<usize>;

/// `(keywords) -> flat (min, max) pair per dimension`.
pub type RangeFunction = dyn Fn(&Keywords) -> CodeResult<Vec<CodeIndex>>;

/// Declared signature of a code function.
///
/// This is the capability descriptor a wrapper reads its default attribute
/// names and batching support from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MethodSpecification {
    /// Function name, used in errors and logs.
    pub name: String,
    /// Names of the positional input parameters, in order.
    pub input_names: Vec<String>,
    /// Names of the outputs, in order.
    pub output_names: Vec<String>,
    /// Inputs the code supplies a default for.
    pub optional_input_names: Vec<String>,
    /// The function accepts arrays of indices.
    pub can_handle_array: bool,
    /// The function only accepts arrays of indices.
    pub must_handle_array: bool,
}

impl MethodSpecification {
    /// A function that handles arrays, with no declared parameters yet.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            input_names: Vec::new(),
            output_names: Vec::new(),
            optional_input_names: Vec::new(),
            can_handle_array: true,
            must_handle_array: false,
        }
    }

    /// Declare the input parameter names.
    #[must_use]
    pub fn inputs<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.input_names = names.into_iter().map(Into::into).collect();
        self
    }

    /// Declare the output names.
    #[must_use]
    pub fn outputs<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_names = names.into_iter().map(Into::into).collect();
        self
    }

    /// Declare which inputs have a default in the code.
    #[must_use]
    pub fn optional<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.optional_input_names = names.into_iter().map(Into::into).collect();
        self
    }

    /// Declare that the function takes one index per call.
    #[must_use]
    pub fn scalar_only(mut self) -> Self {
        self.can_handle_array = false;
        self.must_handle_array = false;
        self
    }

    /// Returns `true` if more than one index may be passed per call.
    #[must_use]
    pub fn handles_arrays(&self) -> bool {
        self.can_handle_array || self.must_handle_array
    }
}

impl Default for MethodSpecification {
    fn default() -> Self {
        Self::new("")
    }
}

/// Read side of the capability contract: fetch attribute values by index.
pub trait AttributeGetter: std::fmt::Debug {
    /// Attributes this getter produces, in output order.
    fn attribute_names(&self) -> &[String];

    /// Tell the getter which parameter carries the indices.
    fn set_indexing_parameter(&mut self, _name: &str) {}

    /// Fetch the values of `attributes` for the given indices.
    ///
    /// The returned map holds only the requested attributes this getter
    /// produces.
    fn fetch(
        &self,
        keys: &dyn KeyLookup,
        attributes: &[&str],
        indices: &[Vec<CodeIndex>],
        keywords: &Keywords,
    ) -> StorageResult<AttributeMap>;
}

/// Write side of the capability contract: apply attribute values by index.
pub trait AttributeSetter: std::fmt::Debug {
    /// Attributes this setter consumes, in input order.
    fn attribute_names(&self) -> &[String];

    /// Tell the setter which parameter carries the indices.
    fn set_indexing_parameter(&mut self, _name: &str) {}

    /// Write the values of `attributes` (parallel to `values`) for the
    /// given indices.
    fn apply(
        &self,
        attributes: &[&str],
        values: &[Quantity],
        indices: &[Vec<CodeIndex>],
        keywords: &Keywords,
    ) -> StorageResult<()>;
}

fn resolve_names(
    explicit: Option<&[String]>,
    declared: &[String],
    indexing_parameter: &str,
) -> Vec<String> {
    match explicit {
        Some(names) => names.to_vec(),
        None => declared
            .iter()
            .filter(|name| name.as_str() != indexing_parameter)
            .cloned()
            .collect(),
    }
}

fn collect_names<I, S>(names: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    names.into_iter().map(Into::into).collect()
}

pub(crate) fn code_failure(method: &str, source: CodeError) -> StorageError {
    error!(method, %source, "code function failed");
    StorageError::code(method, source)
}

/// Wraps a getter function such as `x, y, z = get_position(index)`.
pub struct GetAttributesMethod {
    spec: MethodSpecification,
    function: Box<GetFunction>,
    explicit_names: Option<Vec<String>>,
    indexing_parameter: String,
    attribute_names: Vec<String>,
    index_outputs: Vec<bool>,
}

impl GetAttributesMethod {
    /// Wrap `function`, naming attributes after its declared outputs.
    pub fn new<F>(spec: MethodSpecification, function: F) -> Self
    where
        F: Fn(&[Vec<CodeIndex>], &Keywords) -> CodeResult<Vec<Quantity>> + 'static,
    {
        let attribute_names = resolve_names(None, &spec.output_names, DEFAULT_INDEX_NAME);
        Self {
            spec,
            function: Box::new(function),
            explicit_names: None,
            indexing_parameter: DEFAULT_INDEX_NAME.to_string(),
            attribute_names,
            index_outputs: Vec::new(),
        }
    }

    /// Name the outputs explicitly instead of using the declared names.
    #[must_use]
    pub fn with_attribute_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names = collect_names(names);
        self.attribute_names = names.clone();
        self.explicit_names = Some(names);
        self
    }

    /// Flag, per output, whether it returns the code index of another
    /// particle. Flagged outputs are converted to [`Quantity::object_keys`].
    #[must_use]
    pub fn with_index_outputs(mut self, flags: Vec<bool>) -> Self {
        self.index_outputs = flags;
        self
    }

    /// Returns the wrapped function's specification.
    #[must_use]
    pub fn specification(&self) -> &MethodSpecification {
        &self.spec
    }

    fn check_arguments(&self, indices: &[Vec<CodeIndex>]) -> StorageResult<()> {
        let count = indices.first().map_or(0, Vec::len);
        if count > 1 && !self.spec.handles_arrays() {
            return Err(StorageError::UnsupportedBatchOperation {
                method: self.spec.name.clone(),
                count,
            });
        }
        Ok(())
    }

    fn convert_return_value(
        &self,
        return_value: Vec<Quantity>,
        keys: &dyn KeyLookup,
        attributes: &[&str],
    ) -> StorageResult<AttributeMap> {
        if return_value.len() != self.attribute_names.len() {
            return Err(StorageError::ResultArity {
                method: self.spec.name.clone(),
                expected: self.attribute_names.len(),
                actual: return_value.len(),
            });
        }

        let mut result = AttributeMap::new();
        for (position, (value, attribute)) in
            return_value.into_iter().zip(&self.attribute_names).enumerate()
        {
            if !attributes.contains(&attribute.as_str()) {
                continue;
            }
            let is_index = self.index_outputs.get(position).copied().unwrap_or(false);
            let value = if is_index {
                let indices = value.as_ints().ok_or_else(|| {
                    StorageError::code(
                        &self.spec.name,
                        CodeError::new(-1, format!("index output '{attribute}' is not an integer array")),
                    )
                })?;
                Quantity::object_keys(keys.keys_of(indices))
            } else {
                value
            };
            result.insert(attribute.clone(), value);
        }
        Ok(result)
    }
}

impl AttributeGetter for GetAttributesMethod {
    fn attribute_names(&self) -> &[String] {
        &self.attribute_names
    }

    fn set_indexing_parameter(&mut self, name: &str) {
        self.indexing_parameter = name.to_string();
        self.attribute_names = resolve_names(
            self.explicit_names.as_deref(),
            &self.spec.output_names,
            &self.indexing_parameter,
        );
    }

    fn fetch(
        &self,
        keys: &dyn KeyLookup,
        attributes: &[&str],
        indices: &[Vec<CodeIndex>],
        keywords: &Keywords,
    ) -> StorageResult<AttributeMap> {
        self.check_arguments(indices)?;
        debug!(
            method = self.spec.name,
            count = indices.first().map_or(0, Vec::len),
            "calling getter"
        );
        let return_value =
            (self.function)(indices, keywords).map_err(|e| code_failure(&self.spec.name, e))?;
        self.convert_return_value(return_value, keys, attributes)
    }
}

impl std::fmt::Debug for GetAttributesMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GetAttributesMethod")
            .field("method", &self.spec.name)
            .field("attribute_names", &self.attribute_names)
            .finish_non_exhaustive()
    }
}

/// Exposes the code index of each particle as the `index_in_code` attribute.
///
/// Answers from the indices it is given; never calls the code.
#[derive(Debug, Clone)]
pub struct IndexInCodeMethod {
    attribute_names: Vec<String>,
}

impl IndexInCodeMethod {
    /// The attribute name this getter provides.
    pub const ATTRIBUTE_NAME: &'static str = "index_in_code";

    #[must_use]
    pub fn new() -> Self {
        Self {
            attribute_names: vec![Self::ATTRIBUTE_NAME.to_string()],
        }
    }
}

impl Default for IndexInCodeMethod {
    fn default() -> Self {
        Self::new()
    }
}

impl AttributeGetter for IndexInCodeMethod {
    fn attribute_names(&self) -> &[String] {
        &self.attribute_names
    }

    fn fetch(
        &self,
        _keys: &dyn KeyLookup,
        attributes: &[&str],
        indices: &[Vec<CodeIndex>],
        _keywords: &Keywords,
    ) -> StorageResult<AttributeMap> {
        let mut result = AttributeMap::new();
        if attributes.contains(&Self::ATTRIBUTE_NAME) {
            let indices = indices.first().cloned().unwrap_or_default();
            result.insert(Self::ATTRIBUTE_NAME.to_string(), Quantity::indices(indices));
        }
        Ok(result)
    }
}

/// Build the positional argument list of a setter or creator.
///
/// Each declared input gets the caller's value when one was supplied. Inputs
/// left out must be optional and must all come after the supplied ones, since
/// positional arguments can only be dropped from the end.
fn reconcile_arguments(
    method: &str,
    attribute_names: &[String],
    optional_names: &[String],
    attributes: &[&str],
    values: &[Quantity],
) -> StorageResult<Vec<Quantity>> {
    let mut arguments: Vec<Option<&Quantity>> = vec![None; attribute_names.len()];
    for (attribute, value) in attributes.iter().zip(values) {
        if let Some(position) = attribute_names.iter().position(|n| n == attribute) {
            arguments[position] = Some(value);
        }
    }

    let mut default_argument_found = false;
    for (name, argument) in attribute_names.iter().zip(&arguments) {
        match argument {
            None => {
                default_argument_found = true;
                if !optional_names.contains(name) {
                    return Err(StorageError::MissingRequiredAttribute {
                        method: method.to_string(),
                        attribute: name.clone(),
                    });
                }
            }
            Some(_) if default_argument_found => {
                return Err(StorageError::InvalidDefaultOrdering {
                    method: method.to_string(),
                    attribute: name.clone(),
                });
            }
            Some(_) => {}
        }
    }

    Ok(arguments.into_iter().flatten().cloned().collect())
}

/// Wraps a setter function such as `set_position(index, x, y, z)`.
///
/// The index arguments always come first.
pub struct SetAttributesMethod {
    spec: MethodSpecification,
    function: Box<SetFunction>,
    explicit_names: Option<Vec<String>>,
    attribute_names: Vec<String>,
}

impl SetAttributesMethod {
    /// Wrap `function`, naming attributes after its declared inputs.
    pub fn new<F>(spec: MethodSpecification, function: F) -> Self
    where
        F: Fn(&[Vec<CodeIndex>], &[Quantity], &Keywords) -> CodeResult<()> + 'static,
    {
        let attribute_names = resolve_names(None, &spec.input_names, DEFAULT_INDEX_NAME);
        Self {
            spec,
            function: Box::new(function),
            explicit_names: None,
            attribute_names,
        }
    }

    /// Name the inputs explicitly instead of using the declared names.
    #[must_use]
    pub fn with_attribute_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names = collect_names(names);
        self.attribute_names = names.clone();
        self.explicit_names = Some(names);
        self
    }

    /// Returns the wrapped function's specification.
    #[must_use]
    pub fn specification(&self) -> &MethodSpecification {
        &self.spec
    }
}

impl AttributeSetter for SetAttributesMethod {
    fn attribute_names(&self) -> &[String] {
        &self.attribute_names
    }

    fn set_indexing_parameter(&mut self, name: &str) {
        self.attribute_names =
            resolve_names(self.explicit_names.as_deref(), &self.spec.input_names, name);
    }

    fn apply(
        &self,
        attributes: &[&str],
        values: &[Quantity],
        indices: &[Vec<CodeIndex>],
        keywords: &Keywords,
    ) -> StorageResult<()> {
        let arguments = reconcile_arguments(
            &self.spec.name,
            &self.attribute_names,
            &self.spec.optional_input_names,
            attributes,
            values,
        )?;
        debug!(
            method = self.spec.name,
            count = indices.first().map_or(0, Vec::len),
            "calling setter"
        );
        (self.function)(indices, &arguments, keywords).map_err(|e| code_failure(&self.spec.name, e))
    }
}

impl std::fmt::Debug for SetAttributesMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SetAttributesMethod")
            .field("method", &self.spec.name)
            .field("attribute_names", &self.attribute_names)
            .finish_non_exhaustive()
    }
}

/// Wraps a particle creation function such as
/// `index = new_particle(mass, x, y, z, radius = 0)`.
///
/// Arguments are reconciled exactly like [`SetAttributesMethod`]; the code
/// returns one new index per particle, in input order.
pub struct NewParticleMethod {
    spec: MethodSpecification,
    function: Box<NewFunction>,
    attribute_names: Vec<String>,
}

impl NewParticleMethod {
    /// Wrap `function`, naming attributes after its declared inputs.
    pub fn new<F>(spec: MethodSpecification, function: F) -> Self
    where
        F: Fn(usize, &[Quantity]) -> CodeResult<Vec<CodeIndex>> + 'static,
    {
        let attribute_names = resolve_names(None, &spec.input_names, DEFAULT_INDEX_NAME);
        Self {
            spec,
            function: Box::new(function),
            attribute_names,
        }
    }

    /// Name the inputs explicitly instead of using the declared names.
    #[must_use]
    pub fn with_attribute_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attribute_names = collect_names(names);
        self
    }

    /// Attributes the creation function accepts, in input order.
    #[must_use]
    pub fn attribute_names(&self) -> &[String] {
        &self.attribute_names
    }

    /// Ask the code to allocate `count` particles with the given initial
    /// values and return their indices.
    ///
    /// # Errors
    ///
    /// Returns an argument reconciliation error, or [`StorageError::Code`]
    /// if the code fails.
    pub fn allocate(
        &self,
        count: usize,
        attributes: &[&str],
        values: &[Quantity],
    ) -> StorageResult<Vec<CodeIndex>> {
        let arguments = reconcile_arguments(
            &self.spec.name,
            &self.attribute_names,
            &self.spec.optional_input_names,
            attributes,
            values,
        )?;
        debug!(method = self.spec.name, count, "calling creator");
        (self.function)(count, &arguments).map_err(|e| code_failure(&self.spec.name, e))
    }
}

impl std::fmt::Debug for NewParticleMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewParticleMethod")
            .field("method", &self.spec.name)
            .field("attribute_names", &self.attribute_names)
            .finish_non_exhaustive()
    }
}

/// A named code function without attribute mapping (delete, count, range).
pub struct CodeFunction<F: ?Sized> {
    name: String,
    function: Box<F>,
}

impl<F: ?Sized> CodeFunction<F> {
    /// Returns the function name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<F: ?Sized> std::fmt::Debug for CodeFunction<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeFunction")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Deletes particles by index.
pub type DeleteMethod = CodeFunction<DeleteFunction>;

/// Reports the number of live particles.
pub type CountMethod = CodeFunction<CountFunction>;

/// Reports the index range of a grid.
pub type RangeMethod = CodeFunction<RangeFunction>;

impl CodeFunction<DeleteFunction> {
    pub fn new<F>(name: impl Into<String>, function: F) -> Self
    where
        F: Fn(&[CodeIndex]) -> CodeResult<()> + 'static,
    {
        Self {
            name: name.into(),
            function: Box::new(function),
        }
    }

    /// Delete the particles at `indices`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Code`] if the code fails.
    pub fn call(&self, indices: &[CodeIndex]) -> StorageResult<()> {
        debug!(method = self.name, count = indices.len(), "calling delete");
        (self.function)(indices).map_err(|e| code_failure(&self.name, e))
    }
}

impl CodeFunction<CountFunction> {
    pub fn new<F>(name: impl Into<String>, function: F) -> Self
    where
        F: Fn() -> CodeResult<usize> + 'static,
    {
        Self {
            name: name.into(),
            function: Box::new(function),
        }
    }

    /// Ask the code how many particles it holds.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Code`] if the code fails.
    pub fn call(&self) -> StorageResult<usize> {
        (self.function)().map_err(|e| code_failure(&self.name, e))
    }
}

impl CodeFunction<RangeFunction> {
    pub fn new<F>(name: impl Into<String>, function: F) -> Self
    where
        F: Fn(&Keywords) -> CodeResult<Vec<CodeIndex>> + 'static,
    {
        Self {
            name: name.into(),
            function: Box::new(function),
        }
    }

    /// Ask the code for its `(min, max)` index pair per dimension.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Code`] if the code fails, or
    /// [`StorageError::ResultArity`] if it returns an odd number of values.
    pub fn call(&self, keywords: &Keywords) -> StorageResult<Vec<(CodeIndex, CodeIndex)>> {
        let flat = (self.function)(keywords).map_err(|e| code_failure(&self.name, e))?;
        if flat.len() % 2 != 0 {
            return Err(StorageError::ResultArity {
                method: self.name.clone(),
                expected: flat.len() + 1,
                actual: flat.len(),
            });
        }
        Ok(flat.chunks_exact(2).map(|pair| (pair[0], pair[1])).collect())
    }
}
