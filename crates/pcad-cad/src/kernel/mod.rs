//! CAD kernel abstraction and backends

mod traits;
#[cfg(feature = "truck")]
mod truck;

pub use traits::*;
#[cfg(feature = "truck")]
pub use truck::TruckKernel;
