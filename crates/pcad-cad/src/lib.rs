//! CAD Kernel Abstraction
//!
//! This crate provides the geometry backend used by the operator builders:
//! - Abstract CAD kernel trait for primitive, boolean and extrusion operations
//! - A null kernel for environments without a geometry backend
//! - An optional Truck (pure Rust B-Rep) backend behind the `truck` feature

pub mod kernel;

// Re-exports for convenience
#[cfg(feature = "truck")]
pub use kernel::TruckKernel;
pub use kernel::{
    BooleanType, CadError, CadKernel, CadResult, NullKernel, Solid, Wire2D, default_kernel,
};
