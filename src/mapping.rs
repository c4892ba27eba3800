/// Discontinuity heuristics over projected target nodes
pub mod jumps;
/// Projection onto the nearest structural triangle with rotational correction
pub mod projection;
/// Global radial basis function interpolation
pub mod rbf;
/// Relaxation and diffusion smoothing of flagged regions
pub mod smoothing;

pub use projection::ProjectionMapper;
pub use rbf::RbfMapper;

use crate::error::{check_size, MapError, MapResult};
use crate::linalg::MappingMatrix;
use crate::mesh::{Field, FieldMeta, Mesh};
use crate::node_sets::{plane_projector, Classification, FieldSelection, ModalInfo, NodeSet};
use crate::progress::Progress;

use nalgebra::{Matrix3, Point3, Unit, Vector3};
use std::collections::BTreeMap;

/// A strategy that maps structural displacement fields onto a target surface
///
/// `build` prepares a reusable linear operator for one target mesh; `map_field` then costs
/// one operator application per field. `hmap` exposes that operator with every
/// post-processing step folded in, so `hmap()?.apply(u)` reproduces `map_field` on the
/// mapped nodes.
pub trait DisplacementMapper {
    fn name(&self) -> &'static str;

    /// Classification, field selection and bookkeeping shared by all strategies
    fn base(&self) -> &MapperBase<'_>;

    /// Build the mapping operator for `target`
    fn build(&mut self, target: &Mesh, progress: &dyn Progress) -> MapResult<()>;

    /// Displacement of every target node (zero where unmapped) for one structural field
    fn map_field(&self, field: &Field) -> MapResult<Vec<Vector3<f64>>>;

    /// The complete linear operator, one row per mapped node
    fn hmap(&self) -> MapResult<MappingMatrix>;

    /// Displacements of several fields; strategies that can share work across fields override this
    fn map_fields(&self, fields: &[&Field]) -> MapResult<Vec<Vec<Vector3<f64>>>> {
        fields.iter().map(|f| self.map_field(f)).collect()
    }

    /// Map every selected field and append the results to `target`
    ///
    /// All fields are computed before the first one is appended, so a failure leaves
    /// `target` unchanged. Returns the indices of the new fields.
    fn map(&self, target: &mut Mesh, progress: &dyn Progress) -> MapResult<Vec<usize>> {
        let base = self.base();
        if !base.is_built() {
            return Err(MapError::NotBuilt);
        }
        check_size("target nodes", base.target_node_count(), target.nodes.len())?;

        let sources: Vec<&Field> = base
            .selection
            .iter()
            .map(|(index, _)| &base.structure.fields[index])
            .collect();
        progress.begin("map fields", sources.len());
        let values = self.map_fields(&sources)?;
        progress.advance(sources.len());
        progress.end();

        let mapped: Vec<Field> = base
            .selection
            .iter()
            .zip(sources.iter().zip(values.iter()))
            .map(|((_, modal), (source, v))| base.output_field(source, modal, v))
            .collect();

        tracing::info!(strategy = self.name(), fields = mapped.len(), "fields mapped");
        mapped
            .into_iter()
            .map(|f| target.append_field(f))
            .collect()
    }
}

/// State shared by the mapping strategies
#[derive(Debug, Clone)]
pub struct MapperBase<'s> {
    pub structure: &'s Mesh,
    pub classification: Classification,
    pub selection: FieldSelection,
    /// Applied to every output field
    pub scale: f64,
    mapped: NodeSet,
    target_nodes: Option<usize>,
    /// Mapped rows of sliding nodes with the projector onto all of their planes
    sliding_rows: Vec<(usize, Matrix3<f64>)>,
}

impl<'s> MapperBase<'s> {
    pub fn new(structure: &'s Mesh, classification: Classification, selection: FieldSelection) -> Self {
        Self {
            structure,
            classification,
            selection,
            scale: 1.0,
            mapped: NodeSet::new(),
            target_nodes: None,
            sliding_rows: Vec::new(),
        }
    }

    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    /// Target nodes with a row in the mapping operator
    pub fn mapped(&self) -> &NodeSet {
        &self.mapped
    }

    pub fn is_built(&self) -> bool {
        self.target_nodes.is_some()
    }

    pub fn target_node_count(&self) -> usize {
        self.target_nodes.unwrap_or(0)
    }

    /// Validate the inputs against `target` and fix the mapped rows
    ///
    /// Invalidates any earlier build; [`MapperBase::commit`] marks the new one usable once every
    /// later step has succeeded.
    pub(crate) fn prepare(&mut self, target: &Mesh) -> MapResult<()> {
        self.target_nodes = None;
        if self.structure.nodes.is_empty() {
            return Err(MapError::EmptyMesh("structural nodes"));
        }
        if target.nodes.is_empty() {
            return Err(MapError::EmptyMesh("target nodes"));
        }
        let all = self.classification.all();
        if let Some(last) = all.as_slice().last() {
            if *last as usize >= target.nodes.len() {
                return Err(MapError::InvalidIndex {
                    kind: "classified node",
                    index: *last as usize,
                    count: target.nodes.len(),
                });
            }
        }
        let mapped = self.classification.mapped();
        if mapped.is_empty() {
            return Err(MapError::EmptyMesh("mapped nodes"));
        }
        let field_count = self.structure.fields.len();
        if let Some(&index) = self.selection.fields.iter().find(|&&i| i >= field_count) {
            return Err(MapError::InvalidIndex {
                kind: "field",
                index,
                count: field_count,
            });
        }

        let mut normals: BTreeMap<usize, Vec<Unit<Vector3<f64>>>> = BTreeMap::new();
        for set in self.classification.sliding.iter() {
            for node in set.nodes.iter() {
                if let Some(row) = mapped.position(node) {
                    normals.entry(row).or_default().push(set.normal);
                }
            }
        }

        self.mapped = mapped;
        self.sliding_rows = normals
            .into_iter()
            .map(|(row, n)| (row, plane_projector(&n)))
            .collect();
        Ok(())
    }

    /// Mark the operator prepared for `target` as ready
    pub(crate) fn commit(&mut self, target: &Mesh) {
        self.target_nodes = Some(target.nodes.len());
    }

    /// Positions of the mapped target nodes, in row order
    pub(crate) fn mapped_points(&self, target: &Mesh) -> Vec<Point3<f64>> {
        self.mapped
            .iter()
            .map(|n| target.nodes[n as usize])
            .collect()
    }

    /// Translations of a structural field, one per structural node
    pub fn source_translations(&self, field: &Field) -> MapResult<Vec<Vector3<f64>>> {
        field.check_node_count(self.structure.nodes.len())?;
        field.translations()
    }

    /// Remove the out-of-plane part of every sliding row
    pub(crate) fn constrain_sliding(&self, rows: &mut [Vector3<f64>]) {
        for (row, p) in self.sliding_rows.iter() {
            rows[*row] = p * rows[*row];
        }
    }

    /// Fold the sliding constraint into the operator rows
    pub(crate) fn constrain_sliding_rows(&self, matrix: &mut MappingMatrix) {
        for (row, p) in self.sliding_rows.iter() {
            matrix.premultiply_row(*row, p);
        }
    }

    /// Spread per-row values over all target nodes
    pub(crate) fn scatter(&self, rows: &[Vector3<f64>]) -> Vec<Vector3<f64>> {
        let mut out = vec![Vector3::zeros(); self.target_node_count()];
        for (node, v) in self.mapped.iter().zip(rows.iter()) {
            out[node as usize] = *v;
        }
        out
    }

    /// Result field carrying the source's class, modal data and the classification names
    pub(crate) fn output_field(
        &self,
        source: &Field,
        modal: Option<&ModalInfo>,
        values: &[Vector3<f64>],
    ) -> Field {
        let scaled: Vec<Vector3<f64>> = values.iter().map(|v| v * self.scale).collect();
        let meta = FieldMeta {
            frequency: modal.map(|m| m.frequency).or(source.meta.frequency),
            modal_mass: modal.and_then(|m| m.modal_mass).or(source.meta.modal_mass),
            modal_stiffness: modal
                .and_then(|m| m.modal_stiffness)
                .or(source.meta.modal_stiffness),
            scale: self.scale,
            moving: self.classification.moving_names.clone(),
            sliding: self.classification.sliding_names.clone(),
            fixed: self.classification.fixed_names.clone(),
        };
        Field::from_vectors(source.name.clone(), source.class, &scaled).with_meta(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MapperConfig, SmoothingConfig};
    use crate::mapping::rbf::RbfKernel;
    use crate::mesh::{ElementKind, ValueClass};
    use crate::node_sets::{NodeSetClassifier, SlidingNodeSet};
    use crate::progress::{NoProgress, TracingProgress};
    use approx::assert_relative_eq;

    fn meshes() -> (Mesh, Mesh) {
        (
            Mesh::from_file("./test_input/plate_structure.json").unwrap(),
            Mesh::from_file("./test_input/plate_target.json").unwrap(),
        )
    }

    fn classify_all(target: &Mesh) -> Classification {
        NodeSetClassifier::new(target)
            .classify_sections(&["skin"], &[], &[])
            .unwrap()
            .clone()
    }

    #[test]
    fn map_appends_fields_with_metadata() {
        let (structure, mut target) = meshes();
        let class = NodeSetClassifier::new(&target)
            .collect_wall_nodes()
            .unwrap()
            .clone();
        let sel = FieldSelection::collect_disp_fields(&structure);

        let config = MapperConfig::default().with_scale(2.0);
        let mut mapper = config.build_mapper(&structure, class, sel).unwrap();
        assert!(matches!(
            mapper.map(&mut target, &NoProgress),
            Err(MapError::NotBuilt)
        ));

        mapper.build(&target, &TracingProgress::new()).unwrap();
        let added = mapper.map(&mut target, &TracingProgress::new()).unwrap();
        assert_eq!(added.len(), 2);

        let mode = &target.fields[target.find_field("mode 1").unwrap()];
        assert_eq!(mode.class, ValueClass::Eigenmode);
        assert_eq!(mode.meta.frequency, Some(3.5));
        assert_eq!(mode.meta.modal_mass, Some(1.0));
        assert_eq!(mode.meta.scale, 2.0);
        assert_eq!(mode.meta.moving, vec![String::from("wall")]);
        assert_eq!(mode.meta.fixed, vec![String::from("far")]);

        // static field is a uniform unit-Z displacement; wall nodes move by 2, the rest stay
        let st = &target.fields[target.find_field("static").unwrap()];
        let t = st.translations().unwrap();
        for n in 0..6 {
            assert_relative_eq!(t[n], Vector3::new(0.0, 0.0, 2.0), epsilon = 1e-9);
        }
        for n in 6..9 {
            assert_eq!(t[n], Vector3::zeros());
        }
    }

    #[test]
    fn map_rejects_a_different_target() {
        let (structure, target) = meshes();
        let class = classify_all(&target);
        let sel = FieldSelection::collect_disp_fields(&structure);
        let mut mapper = MapperConfig::default()
            .build_mapper(&structure, class, sel)
            .unwrap();
        mapper.build(&target, &NoProgress).unwrap();

        let mut other = Mesh::from_triangles(
            vec![Point3::origin(), Point3::new(1.0, 0.0, 0.0), Point3::new(0.0, 1.0, 0.0)],
            &[[0, 1, 2]],
        );
        assert!(mapper.map(&mut other, &NoProgress).is_err());
        assert!(other.fields.is_empty());
    }

    #[test]
    fn sliding_nodes_stay_in_plane() {
        let (structure, target) = meshes();
        let normal = Vector3::new(0.0, 1.0, 1.0);
        let mut class = classify_all(&target);
        class.moving = NodeSet::from_unsorted(vec![0, 1, 2, 3, 4, 5]);
        class.sliding.push(SlidingNodeSet::new(
            "slide",
            NodeSet::from_unsorted(vec![3, 4, 5, 6, 7, 8]),
            normal,
        ));
        class.sliding_names.push(String::from("slide"));

        let sel = FieldSelection::collect_disp_fields(&structure);
        for smoothing in [
            SmoothingConfig::default(),
            SmoothingConfig::iterative(5, 0.5),
        ] {
            let config = MapperConfig::default().with_smoothing(smoothing);
            let mut mapper = config
                .build_mapper(&structure, class.clone(), sel.clone())
                .unwrap();
            mapper.build(&target, &NoProgress).unwrap();

            let n = normal.normalize();
            for (index, _) in sel.iter() {
                let out = mapper.map_field(&structure.fields[index]).unwrap();
                for node in 3..9 {
                    assert_relative_eq!(out[node].dot(&n), 0.0, epsilon = 1e-12);
                }
                // the operator folds the same constraint
                let u = structure.fields[index].translations().unwrap();
                let rows = mapper.hmap().unwrap().apply(&u).unwrap();
                for (row, node) in mapper.base().mapped().iter().enumerate() {
                    assert_relative_eq!(rows[row], out[node as usize], epsilon = 1e-12);
                }
            }
        }
    }

    #[test]
    fn node_in_two_sliding_sets_stays_in_both_planes() {
        let (structure, target) = meshes();
        let a = Vector3::new(0.0, 1.0, 1.0);
        let b = Vector3::new(0.0, 0.0, 1.0);
        let mut class = classify_all(&target);
        class.sliding.push(SlidingNodeSet::new("sym a", NodeSet::from_unsorted(vec![1, 4, 7]), a));
        class.sliding.push(SlidingNodeSet::new("sym b", NodeSet::from_unsorted(vec![3, 4, 5]), b));
        class.sliding_names.push(String::from("sym a"));
        class.sliding_names.push(String::from("sym b"));
        let (a, b) = (a.normalize(), b.normalize());

        let sel = FieldSelection::collect_disp_fields(&structure);
        for config in [MapperConfig::default(), MapperConfig::rbf(RbfKernel::Cubic)] {
            let mut mapper = config
                .build_mapper(&structure, class.clone(), sel.clone())
                .unwrap();
            mapper.build(&target, &NoProgress).unwrap();

            for (index, _) in sel.iter() {
                let out = mapper.map_field(&structure.fields[index]).unwrap();
                assert_relative_eq!(out[4].dot(&a), 0.0, epsilon = 1e-12);
                assert_relative_eq!(out[4].dot(&b), 0.0, epsilon = 1e-12);
                for node in [1, 7] {
                    assert_relative_eq!(out[node].dot(&a), 0.0, epsilon = 1e-12);
                }
                for node in [3, 5] {
                    assert_relative_eq!(out[node].dot(&b), 0.0, epsilon = 1e-12);
                }

                let u = structure.fields[index].translations().unwrap();
                let rows = mapper.hmap().unwrap().apply(&u).unwrap();
                for (row, node) in mapper.base().mapped().iter().enumerate() {
                    assert_relative_eq!(rows[row], out[node as usize], epsilon = 1e-12);
                }
            }
        }
    }

    #[test]
    fn failed_build_leaves_no_operator() {
        let (structure, target) = meshes();
        let mut beams = structure.clone();
        for e in beams.elements.iter_mut() {
            e.kind = ElementKind::Rbe;
        }
        let sel = FieldSelection::collect_disp_fields(&structure);
        let index = sel.fields[0];
        let small = Mesh::from_triangles(
            vec![Point3::origin(), Point3::new(1.0, 0.0, 0.0), Point3::new(0.0, 1.0, 0.0)],
            &[[0, 1, 2]],
        );

        for config in [MapperConfig::default(), MapperConfig::rbf(RbfKernel::Cubic)] {
            // a good operator is dropped by a rebuild that fails
            let mut mapper = config
                .build_mapper(&structure, classify_all(&target), sel.clone())
                .unwrap();
            mapper.build(&target, &NoProgress).unwrap();
            assert!(matches!(
                mapper.build(&small, &NoProgress),
                Err(MapError::InvalidIndex { .. })
            ));
            assert!(!mapper.base().is_built());
            assert!(matches!(
                mapper.map_field(&structure.fields[index]),
                Err(MapError::NotBuilt)
            ));
            assert!(matches!(mapper.hmap(), Err(MapError::NotBuilt)));
            let mut out = target.clone();
            assert!(matches!(
                mapper.map(&mut out, &NoProgress),
                Err(MapError::NotBuilt)
            ));
            assert_eq!(out.fields.len(), target.fields.len());

            // nothing to map from
            let mut mapper = config
                .build_mapper(&beams, classify_all(&target), sel.clone())
                .unwrap();
            assert!(matches!(
                mapper.build(&target, &NoProgress),
                Err(MapError::EmptyMesh(_))
            ));
            assert!(matches!(
                mapper.map_field(&beams.fields[index]),
                Err(MapError::NotBuilt)
            ));
            assert!(matches!(mapper.hmap(), Err(MapError::NotBuilt)));
        }
    }

    #[test]
    fn misclassified_nodes_are_rejected() {
        let (structure, target) = meshes();
        let mut class = classify_all(&target);
        class.moving = NodeSet::from_unsorted(vec![0, 42]);
        let mut mapper = MapperConfig::default()
            .build_mapper(&structure, class, FieldSelection::default())
            .unwrap();
        assert!(matches!(
            mapper.build(&target, &NoProgress),
            Err(MapError::InvalidIndex { index: 42, .. })
        ));
    }
}
