//! Demo codes driven through `incode_storage`.
//!
//! [`GravityCode`] is a small N-body code with particle attributes, tree
//! links and selections. [`HydroCode`] keeps conserved quantities on a
//! regular grid. [`Scenario`] runs both through their storages.

pub mod config;
pub mod error;
pub mod gravity;
pub mod hydro;
pub mod scenario;

pub use config::DemoConfig;
pub use error::{DemoError, DemoResult};
pub use gravity::{GravityCode, GravityParameters};
pub use hydro::HydroCode;
pub use scenario::{Scenario, ScenarioReport};
