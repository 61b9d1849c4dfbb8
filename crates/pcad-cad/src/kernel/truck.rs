//! Truck CAD Kernel Backend
//!
//! Pure Rust B-Rep kernel using the Truck library.
//!
//! Note: Boolean operations are not available through `truck-modeling` and
//! report an error; cut/fuse/common builders therefore decline on this kernel.

use glam::{Vec2, Vec3};
use parking_lot::Mutex;
use std::collections::HashMap;
use uuid::Uuid;

use truck_modeling::{
    InnerSpace, Point3, Rad, Solid as TruckSolid, Vector3, Vertex, Wire, builder,
};

use super::{BooleanType, CadError, CadKernel, CadResult, Solid, Wire2D};

/// Truck-based CAD kernel
pub struct TruckKernel {
    /// Storage for solid data (keyed by UUID)
    solids: Mutex<HashMap<Uuid, TruckSolid>>,
}

fn to_point(v: Vec3) -> Point3 {
    Point3::new(v.x as f64, v.y as f64, v.z as f64)
}

fn to_vector(v: Vec3) -> Vector3 {
    Vector3::new(v.x as f64, v.y as f64, v.z as f64)
}

/// Any unit vector perpendicular to `axis`
fn perpendicular(axis: Vec3) -> Vec3 {
    let up = if axis.z.abs() < 0.9 { Vec3::Z } else { Vec3::X };
    axis.cross(up).normalize()
}

impl TruckKernel {
    /// Create a new Truck kernel
    pub fn new() -> Self {
        Self {
            solids: Mutex::new(HashMap::new()),
        }
    }

    /// Store a solid and return a Solid reference
    fn store_solid(&self, solid: TruckSolid) -> Solid {
        let id = Uuid::new_v4();
        self.solids.lock().insert(id, solid);
        Solid::new(id)
    }

    /// Number of solids owned by this kernel
    pub fn solid_count(&self) -> usize {
        self.solids.lock().len()
    }

    /// Convert 2D points to 3D points on a plane
    fn points_to_3d(&self, points: &[Vec2], plane_origin: Vec3, plane_normal: Vec3) -> Vec<Point3> {
        let normal = to_vector(plane_normal);
        let origin = to_point(plane_origin);

        // Create basis vectors for the plane
        let up = if normal.z.abs() < 0.9 {
            Vector3::new(0.0, 0.0, 1.0)
        } else {
            Vector3::new(1.0, 0.0, 0.0)
        };
        let u = normal.cross(up).normalize();
        let v = normal.cross(u);

        points
            .iter()
            .map(|p| origin + u * p.x as f64 + v * p.y as f64)
            .collect()
    }

    /// Create a closed polyline wire through 3D points
    fn polyline(points: &[Point3]) -> Wire {
        let vertices: Vec<Vertex> = points.iter().map(|p| builder::vertex(*p)).collect();

        let n = vertices.len();
        let edges: Vec<_> = (0..n)
            .map(|i| builder::line(&vertices[i], &vertices[(i + 1) % n]))
            .collect();

        edges.into()
    }

    /// Revolve a closed polyline (already in 3D) around an axis
    fn revolve_polyline(
        &self,
        points: &[Point3],
        origin: Vec3,
        axis: Vec3,
        angle: f32,
    ) -> CadResult<Solid> {
        let face = builder::try_attach_plane(&[Self::polyline(points)])
            .map_err(|e| CadError::OperationFailed(format!("Failed to create face: {:?}", e)))?;

        let solid = builder::rsweep(
            &face,
            to_point(origin),
            to_vector(axis.normalize()),
            Rad(angle as f64),
        );

        Ok(self.store_solid(solid))
    }
}

impl Default for TruckKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl CadKernel for TruckKernel {
    fn name(&self) -> &str {
        "truck"
    }

    fn extrude(
        &self,
        profile: &Wire2D,
        plane_origin: Vec3,
        plane_normal: Vec3,
        direction: Vec3,
        distance: f32,
    ) -> CadResult<Solid> {
        if profile.points.len() < 3 {
            return Err(CadError::InvalidProfile(
                "Profile must have at least 3 points".into(),
            ));
        }

        let points = self.points_to_3d(&profile.points, plane_origin, plane_normal);
        let face = builder::try_attach_plane(&[Self::polyline(&points)])
            .map_err(|e| CadError::OperationFailed(format!("Failed to create face: {:?}", e)))?;

        let solid = builder::tsweep(&face, to_vector(direction * distance));

        Ok(self.store_solid(solid))
    }

    fn boolean(&self, _a: &Solid, _b: &Solid, op: BooleanType) -> CadResult<Solid> {
        Err(CadError::BooleanFailed(format!(
            "{:?} is not implemented for the Truck kernel",
            op
        )))
    }

    fn create_box(&self, center: Vec3, size: Vec3) -> CadResult<Solid> {
        if size.min_element() <= 0.0 {
            return Err(CadError::InvalidParameter(format!(
                "Box size must be positive, got {}",
                size
            )));
        }
        let min = center - size * 0.5;

        let vertex = builder::vertex(to_point(min));
        let edge = builder::tsweep(&vertex, Vector3::new(size.x as f64, 0.0, 0.0));
        let face = builder::tsweep(&edge, Vector3::new(0.0, size.y as f64, 0.0));
        let solid = builder::tsweep(&face, Vector3::new(0.0, 0.0, size.z as f64));

        Ok(self.store_solid(solid))
    }

    fn create_cylinder(
        &self,
        center: Vec3,
        radius: f32,
        height: f32,
        axis: Vec3,
    ) -> CadResult<Solid> {
        let axis = axis.normalize();
        let base_center = center - axis * (height / 2.0);

        let segments = 32;
        let wire = Wire2D::new(
            (0..segments)
                .map(|i| {
                    let angle = (i as f32 / segments as f32) * std::f32::consts::TAU;
                    Vec2::new(angle.cos() * radius, angle.sin() * radius)
                })
                .collect(),
            true,
        );

        self.extrude(&wire, base_center, axis, axis, height)
    }

    fn create_sphere(&self, center: Vec3, radius: f32) -> CadResult<Solid> {
        // Half disc in the plane containing the Z axis, revolved a full turn
        let segments = 16;
        let side = perpendicular(Vec3::Z);
        let points: Vec<Point3> = (0..=segments)
            .map(|i| {
                let angle = (i as f32 / segments as f32) * std::f32::consts::PI;
                to_point(center + Vec3::Z * (angle.cos() * radius) + side * (angle.sin() * radius))
            })
            .collect();

        self.revolve_polyline(&points, center, Vec3::Z, std::f32::consts::TAU)
    }

    fn create_cone(
        &self,
        center: Vec3,
        radius1: f32,
        radius2: f32,
        height: f32,
        axis: Vec3,
    ) -> CadResult<Solid> {
        if radius1 <= 0.0 && radius2 <= 0.0 {
            return Err(CadError::InvalidParameter(
                "Cone needs at least one positive radius".into(),
            ));
        }
        let axis = axis.normalize();
        let side = perpendicular(axis);
        let base = center - axis * (height / 2.0);
        let top = base + axis * height;

        let mut points = vec![to_point(base), to_point(base + side * radius1)];
        points.push(to_point(top + side * radius2));
        points.push(to_point(top));

        self.revolve_polyline(&points, base, axis, std::f32::consts::TAU)
    }

    fn create_torus(
        &self,
        center: Vec3,
        major_radius: f32,
        minor_radius: f32,
        axis: Vec3,
    ) -> CadResult<Solid> {
        if minor_radius >= major_radius {
            return Err(CadError::InvalidParameter(format!(
                "Torus tube radius {} must be smaller than ring radius {}",
                minor_radius, major_radius
            )));
        }
        let axis = axis.normalize();
        let side = perpendicular(axis);
        let tube_center = center + side * major_radius;

        let segments = 24;
        let points: Vec<Point3> = (0..segments)
            .map(|i| {
                let angle = (i as f32 / segments as f32) * std::f32::consts::TAU;
                to_point(
                    tube_center
                        + side * (angle.cos() * minor_radius)
                        + axis * (angle.sin() * minor_radius),
                )
            })
            .collect();

        self.revolve_polyline(&points, center, axis, std::f32::consts::TAU)
    }
}
