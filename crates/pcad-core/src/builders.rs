//! Kernel-backed shape builders
//!
//! Maps each operator kind onto [`CadKernel`] calls. Boolean and extrusion
//! operands are themselves built through the shape cache, so a change to
//! one operand only rebuilds the operators that depend on it.

use glam::{Vec2, Vec3};
use pcad_cad::{BooleanType, CadKernel, CadResult, Solid, Wire2D};

use crate::cache::{ShapeBuilder, ShapeCache};
use crate::document::{DocumentSnapshot, OperatorArgs, OperatorKind, ParamValue};

/// Why a builder declined an operator
#[derive(Debug, Clone, thiserror::Error)]
enum BuildError {
    #[error("missing or invalid parameter '{0}'")]
    Parameter(&'static str),
    #[error("operand '{0}' could not be built")]
    Operand(String),
    #[error("{0} is not buildable by the kernel")]
    Unsupported(String),
    #[error(transparent)]
    Kernel(#[from] pcad_cad::CadError),
}

/// Builds solids with a CAD kernel, memoizing operands in `cache`
pub struct KernelBuilder<'a> {
    kernel: &'a dyn CadKernel,
    cache: &'a ShapeCache<Solid>,
}

fn number(args: &OperatorArgs, name: &'static str) -> Result<f32, BuildError> {
    args.get(name)
        .and_then(ParamValue::as_f64)
        .map(|v| v as f32)
        .ok_or(BuildError::Parameter(name))
}

fn vector_or(args: &OperatorArgs, name: &'static str, default: Vec3) -> Result<Vec3, BuildError> {
    match args.get(name) {
        None => Ok(default),
        Some(value) => value
            .as_vector::<3>()
            .map(|[x, y, z]| Vec3::new(x as f32, y as f32, z as f32))
            .ok_or(BuildError::Parameter(name)),
    }
}

/// `Placement.Position` of an operator, or the origin
fn position(args: &OperatorArgs) -> Result<Vec3, BuildError> {
    match args.get("Placement") {
        None => Ok(Vec3::ZERO),
        Some(placement) => {
            let placement = placement
                .as_map()
                .ok_or(BuildError::Parameter("Placement"))?;
            vector_or(placement, "Position", Vec3::ZERO)
        }
    }
}

/// Closed polygon of a sketch object from its `Points` list
fn sketch_profile(args: &OperatorArgs) -> Result<Wire2D, BuildError> {
    let points = args
        .get("Points")
        .and_then(ParamValue::as_list)
        .ok_or(BuildError::Parameter("Points"))?
        .iter()
        .map(|p| {
            p.as_vector::<2>()
                .map(|[x, y]| Vec2::new(x as f32, y as f32))
                .ok_or(BuildError::Parameter("Points"))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Wire2D::new(points, true))
}

impl<'a> KernelBuilder<'a> {
    pub fn new(kernel: &'a dyn CadKernel, cache: &'a ShapeCache<Solid>) -> Self {
        Self { kernel, cache }
    }

    /// Build an operand referenced by name through the cache
    fn operand(&self, name: &str, doc: &DocumentSnapshot) -> Result<Solid, BuildError> {
        match self.cache.get_or_build_object(name, doc, self) {
            Ok(Some(solid)) => Ok(solid),
            Ok(None) => Err(BuildError::Operand(name.to_string())),
            Err(e) => {
                tracing::warn!("Operand {} failed: {}", name, e);
                Err(BuildError::Operand(name.to_string()))
            }
        }
    }

    fn reference<'v>(args: &'v OperatorArgs, field: &'static str) -> Result<&'v str, BuildError> {
        args.get(field)
            .and_then(ParamValue::as_str)
            .ok_or(BuildError::Parameter(field))
    }

    fn fold_boolean(
        &self,
        args: &OperatorArgs,
        doc: &DocumentSnapshot,
        op: BooleanType,
    ) -> Result<Solid, BuildError> {
        let shapes = args
            .get("Shapes")
            .and_then(ParamValue::as_list)
            .ok_or(BuildError::Parameter("Shapes"))?;

        let mut names = shapes.iter().map(|s| s.as_str().ok_or(BuildError::Parameter("Shapes")));
        let first = names.next().ok_or(BuildError::Parameter("Shapes"))??;
        let mut result = self.operand(first, doc)?;
        for name in names {
            let next = self.operand(name?, doc)?;
            result = self.kernel.boolean(&result, &next, op)?;
        }
        Ok(result)
    }

    fn extrusion(&self, args: &OperatorArgs, doc: &DocumentSnapshot) -> Result<Solid, BuildError> {
        let base_name = Self::reference(args, "Base")?;
        let base = doc
            .get(base_name)
            .ok_or_else(|| BuildError::Operand(base_name.to_string()))?;
        if base.kind != OperatorKind::Sketch {
            return Err(BuildError::Unsupported(format!(
                "Extrusion of {}",
                base.kind
            )));
        }

        let profile = sketch_profile(&base.parameters)?;
        let origin = position(&base.parameters)?;
        let normal = vector_or(&base.parameters, "Normal", Vec3::Z)?;
        let direction = vector_or(args, "Dir", normal)?;
        let length = number(args, "LengthFwd")?;

        Ok(self
            .kernel
            .extrude(&profile, origin, normal, direction.normalize(), length)?)
    }

    fn try_build(
        &self,
        kind: &OperatorKind,
        args: &OperatorArgs,
        doc: &DocumentSnapshot,
    ) -> Result<Solid, BuildError> {
        let k = self.kernel;
        let solid: CadResult<Solid> = match kind {
            OperatorKind::Box => {
                let size = Vec3::new(
                    number(args, "Length")?,
                    number(args, "Width")?,
                    number(args, "Height")?,
                );
                // Placement is the min corner, the kernel wants the center
                k.create_box(position(args)? + size * 0.5, size)
            }
            OperatorKind::Cylinder => k.create_cylinder(
                position(args)?,
                number(args, "Radius")?,
                number(args, "Height")?,
                vector_or(args, "Axis", Vec3::Z)?,
            ),
            OperatorKind::Sphere => k.create_sphere(position(args)?, number(args, "Radius")?),
            OperatorKind::Cone => k.create_cone(
                position(args)?,
                number(args, "Radius1")?,
                number(args, "Radius2")?,
                number(args, "Height")?,
                vector_or(args, "Axis", Vec3::Z)?,
            ),
            OperatorKind::Torus => k.create_torus(
                position(args)?,
                number(args, "Radius1")?,
                number(args, "Radius2")?,
                vector_or(args, "Axis", Vec3::Z)?,
            ),
            OperatorKind::Cut => {
                let base = self.operand(Self::reference(args, "Base")?, doc)?;
                let tool = self.operand(Self::reference(args, "Tool")?, doc)?;
                k.boolean(&base, &tool, BooleanType::Subtract)
            }
            OperatorKind::Fuse => return self.fold_boolean(args, doc, BooleanType::Union),
            OperatorKind::Intersection => {
                return self.fold_boolean(args, doc, BooleanType::Intersect);
            }
            OperatorKind::Extrusion => return self.extrusion(args, doc),
            OperatorKind::Sketch | OperatorKind::RawImport | OperatorKind::Passthrough(_) => {
                return Err(BuildError::Unsupported(kind.to_string()));
            }
        };
        Ok(solid?)
    }
}

impl ShapeBuilder<Solid> for KernelBuilder<'_> {
    fn build(
        &self,
        kind: &OperatorKind,
        args: &OperatorArgs,
        doc: &DocumentSnapshot,
    ) -> Option<Solid> {
        match self.try_build(kind, args, doc) {
            Ok(solid) => Some(solid),
            Err(e) => {
                tracing::warn!("{} build failed on {} kernel: {}", kind, self.kernel.name(), e);
                None
            }
        }
    }
}
