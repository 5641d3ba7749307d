//! Certificate registry.
//!
//! Aggregates certificates from several sources (the platform certificate
//! store, enterprise policy, extensions) into one catalog with a single
//! mutation API. Sources are ranked; when a certificate appears in more than
//! one, the highest ranked copy is the one shown and the one mutated.

// Core modules
pub mod types;
pub mod interfaces;
pub mod error;
pub mod config;
pub mod source;
pub mod registry;
pub mod service;
pub mod bootstrap;

// Re-exports
pub use types::*;
pub use interfaces::*;
pub use error::*;
pub use config::*;
pub use source::*;
pub use registry::*;
pub use service::*;
pub use bootstrap::*;
