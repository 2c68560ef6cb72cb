//! Model identity and the registry of where models come from
//!
//! Provides:
//! - Model keys (identifier + variant) and their filesystem stems
//! - SHA-256 checksums and candidate source URIs
//! - The configured registry resolving keys to descriptors

pub mod descriptor;
pub mod registry;

pub use descriptor::{
    BackendKind, Checksum, DEFAULT_VARIANT, ModelDescriptor, ModelKey, SourceUri,
};
pub use registry::ModelRegistry;
