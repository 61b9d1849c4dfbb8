//! Parametric CAD Document Core
//!
//! This crate contains the document model and the shape cache:
//! - Document: named operator objects and their parameters
//! - Expand: dependency expansion of operator references into trees
//! - Hash: content keys for expanded trees
//! - Cache: memoized shape building keyed by content
//! - Builders: kernel-backed builders for each operator kind

pub mod builders;
pub mod cache;
pub mod config;
pub mod document;
pub mod expand;
pub mod hash;

pub use builders::*;
pub use cache::*;
pub use config::*;
pub use document::*;
pub use expand::*;
pub use hash::*;
