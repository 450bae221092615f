//! # incode_storage
//!
//! Attribute storage for particle sets and grids whose data lives inside an
//! external code.
//!
//! The code owns the values; this crate only knows how to reach them. Each
//! storage is configured with wrappers around the code's array functions
//! (`get_mass(index)`, `set_position(index, x, y, z)`, `new_particle(...)`)
//! and routes attribute reads and writes through the fewest calls that
//! cover the request.
//!
//! This crate provides:
//!
//! - [`method`]: wrappers mapping attribute names onto code functions.
//! - [`registry`]: getter and setter selection.
//! - [`particles`]: keyed particle storage with a key/index bijection.
//! - [`grid`]: index-addressed grid storage.
//! - [`select`]: adapters turning index-returning queries into key selections.
//! - [`snapshot`] and [`codec`]: detached, MessagePack-encodable copies.
//! - [`error`]: storage and code error types.

pub mod codec;
pub mod error;
pub mod grid;
pub mod key;
pub mod key_map;
pub mod method;
pub mod particles;
pub mod registry;
pub mod select;
pub mod snapshot;
pub mod value;

#[cfg(test)]
mod testing;

pub use error::{CodeError, CodeResult, StorageError, StorageResult};
pub use grid::{DimSelection, GridSelection, GridStorageBuilder, InCodeGridStorage};
pub use key::{EntityKey, KeyAllocator};
pub use key_map::{KeyIndexMap, KeyLookup, NoKeys};
pub use method::{
    AttributeGetter, AttributeSetter, CountMethod, DeleteMethod, GetAttributesMethod,
    IndexInCodeMethod, MethodSpecification, NewParticleMethod, RangeMethod, SetAttributesMethod,
};
pub use particles::{InCodeParticleStorage, ParticleStorageBuilder};
pub use registry::AttributeRegistry;
pub use select::{ComputeMethod, QueryMethod, SpecificSelectMethod, SpecificSelectSubsetMethod, SubsetSelectMethod};
pub use snapshot::{GridSnapshot, ParticleSnapshot};
pub use value::{CodeIndex, Keywords, Quantity, Unit, Values};
