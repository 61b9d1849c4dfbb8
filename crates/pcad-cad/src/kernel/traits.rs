//! CAD Kernel trait definitions
//!
//! These traits define the interface that every geometry backend must implement
//! for the operator builders to turn expanded operator trees into solids.

use glam::{Vec2, Vec3};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Error type for CAD kernel operations
#[derive(Debug, Clone, Error)]
pub enum CadError {
    #[error("Invalid profile: {0}")]
    InvalidProfile(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Boolean operation failed: {0}")]
    BooleanFailed(String),

    #[error("Kernel not available: {0}")]
    KernelNotAvailable(String),

    #[error("Operation failed: {0}")]
    OperationFailed(String),
}

/// Result type for CAD operations
pub type CadResult<T> = Result<T, CadError>;

/// A 2D wire (closed loop of edges) for extrusion profiles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wire2D {
    /// Points defining the wire (in order)
    pub points: Vec<Vec2>,
    /// Whether the wire is closed
    pub closed: bool,
}

impl Wire2D {
    /// Create a new wire from points
    pub fn new(points: Vec<Vec2>, closed: bool) -> Self {
        Self { points, closed }
    }
}

/// A 3D solid body
///
/// Only the handle lives here; the boundary representation itself is owned
/// by the kernel that produced it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Solid {
    /// Unique identifier
    pub id: Uuid,
}

impl Solid {
    /// Create a new solid with the given ID
    pub fn new(id: Uuid) -> Self {
        Self { id }
    }
}

/// Boolean operation type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BooleanType {
    /// Union (fuse)
    Union,
    /// Subtraction (cut)
    Subtract,
    /// Intersection (common)
    Intersect,
}

/// The main CAD kernel trait
///
/// Implementations of this trait provide the actual geometry operations
/// using different backends (Truck, or a test double).
pub trait CadKernel: Send + Sync {
    /// Get the name of this kernel
    fn name(&self) -> &str;

    /// Extrude a 2D profile along a direction
    ///
    /// # Arguments
    /// * `profile` - The 2D wire profile to extrude
    /// * `plane_origin` - The origin of the sketch plane in 3D
    /// * `plane_normal` - The normal of the sketch plane
    /// * `direction` - The extrusion direction
    /// * `distance` - The extrusion distance
    fn extrude(
        &self,
        profile: &Wire2D,
        plane_origin: Vec3,
        plane_normal: Vec3,
        direction: Vec3,
        distance: f32,
    ) -> CadResult<Solid>;

    /// Perform a boolean operation on two solids
    fn boolean(&self, a: &Solid, b: &Solid, op: BooleanType) -> CadResult<Solid>;

    /// Create a box primitive
    fn create_box(&self, center: Vec3, size: Vec3) -> CadResult<Solid>;

    /// Create a cylinder primitive
    fn create_cylinder(
        &self,
        center: Vec3,
        radius: f32,
        height: f32,
        axis: Vec3,
    ) -> CadResult<Solid>;

    /// Create a sphere primitive
    fn create_sphere(&self, center: Vec3, radius: f32) -> CadResult<Solid>;

    /// Create a (possibly truncated) cone primitive
    ///
    /// `radius1` is the radius at the base, `radius2` at the top.
    fn create_cone(
        &self,
        center: Vec3,
        radius1: f32,
        radius2: f32,
        height: f32,
        axis: Vec3,
    ) -> CadResult<Solid>;

    /// Create a torus primitive
    ///
    /// `major_radius` is measured from `center` to the tube center,
    /// `minor_radius` is the tube radius.
    fn create_torus(
        &self,
        center: Vec3,
        major_radius: f32,
        minor_radius: f32,
        axis: Vec3,
    ) -> CadResult<Solid>;
}

/// A null kernel that always returns errors (used when no kernel is available)
#[derive(Debug, Default)]
pub struct NullKernel;

impl NullKernel {
    fn unavailable<T>() -> CadResult<T> {
        Err(CadError::KernelNotAvailable(
            "No CAD kernel available".into(),
        ))
    }
}

impl CadKernel for NullKernel {
    fn name(&self) -> &str {
        "null"
    }

    fn extrude(
        &self,
        _profile: &Wire2D,
        _plane_origin: Vec3,
        _plane_normal: Vec3,
        _direction: Vec3,
        _distance: f32,
    ) -> CadResult<Solid> {
        Self::unavailable()
    }

    fn boolean(&self, _a: &Solid, _b: &Solid, _op: BooleanType) -> CadResult<Solid> {
        Self::unavailable()
    }

    fn create_box(&self, _center: Vec3, _size: Vec3) -> CadResult<Solid> {
        Self::unavailable()
    }

    fn create_cylinder(
        &self,
        _center: Vec3,
        _radius: f32,
        _height: f32,
        _axis: Vec3,
    ) -> CadResult<Solid> {
        Self::unavailable()
    }

    fn create_sphere(&self, _center: Vec3, _radius: f32) -> CadResult<Solid> {
        Self::unavailable()
    }

    fn create_cone(
        &self,
        _center: Vec3,
        _radius1: f32,
        _radius2: f32,
        _height: f32,
        _axis: Vec3,
    ) -> CadResult<Solid> {
        Self::unavailable()
    }

    fn create_torus(
        &self,
        _center: Vec3,
        _major_radius: f32,
        _minor_radius: f32,
        _axis: Vec3,
    ) -> CadResult<Solid> {
        Self::unavailable()
    }
}

/// Get the default CAD kernel based on available features
pub fn default_kernel() -> Box<dyn CadKernel> {
    #[cfg(feature = "truck")]
    let kernel: Box<dyn CadKernel> = Box::new(super::TruckKernel::new());

    #[cfg(not(feature = "truck"))]
    let kernel: Box<dyn CadKernel> = Box::new(NullKernel);

    tracing::debug!("Using CAD kernel: {}", kernel.name());
    kernel
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_kernel_is_unavailable() {
        let kernel = NullKernel;
        assert_eq!(kernel.name(), "null");
        assert!(matches!(
            kernel.create_box(Vec3::ZERO, Vec3::ONE),
            Err(CadError::KernelNotAvailable(_))
        ));
        assert!(
            kernel
                .create_torus(Vec3::ZERO, 2.0, 0.5, Vec3::Z)
                .is_err()
        );
    }

    #[test]
    fn test_null_kernel_rejects_extrusion() {
        let profile = Wire2D::new(
            vec![Vec2::ZERO, Vec2::new(1.0, 0.0), Vec2::new(0.0, 1.0)],
            true,
        );
        assert!(matches!(
            NullKernel.extrude(&profile, Vec3::ZERO, Vec3::Z, Vec3::Z, 1.0),
            Err(CadError::KernelNotAvailable(_))
        ));
    }
}
