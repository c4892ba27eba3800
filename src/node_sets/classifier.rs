use super::{NodeSet, SlidingNodeSet};
use crate::error::{MapError, MapResult};
use crate::mesh::{Mesh, ValueClass};

use nalgebra::Vector3;
use std::collections::BTreeSet;

/// Partition of the target surface nodes
///
/// `moving` and the sliding sets may share nodes; together they form the mapped set.
/// `fixed` and `rubber` are disjoint from the mapped set and from each other.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Classification {
    pub moving: NodeSet,
    pub sliding: Vec<SlidingNodeSet>,
    pub fixed: NodeSet,
    pub rubber: NodeSet,
    pub moving_names: Vec<String>,
    pub sliding_names: Vec<String>,
    pub fixed_names: Vec<String>,
}

impl Classification {
    /// Union of the sliding sets
    pub fn sliding_nodes(&self) -> NodeSet {
        self.sliding
            .iter()
            .fold(NodeSet::new(), |acc, s| acc.union(&s.nodes))
    }

    /// Nodes that receive a mapped displacement (moving ∪ sliding)
    pub fn mapped(&self) -> NodeSet {
        self.moving.union(&self.sliding_nodes())
    }

    /// Every classified node
    pub fn all(&self) -> NodeSet {
        self.mapped().union(&self.fixed).union(&self.rubber)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupKind {
    Boco,
    Section,
}

impl GroupKind {
    fn count(self, mesh: &Mesh) -> usize {
        match self {
            Self::Boco => mesh.bocos.len(),
            Self::Section => mesh.sections.len(),
        }
    }

    fn name(self, mesh: &Mesh, id: usize) -> &str {
        match self {
            Self::Boco => &mesh.bocos[id].name,
            Self::Section => &mesh.sections[id].name,
        }
    }

    fn find(self, mesh: &Mesh, name: &str) -> MapResult<usize> {
        match self {
            Self::Boco => mesh.find_boco(name),
            Self::Section => mesh.find_section(name),
        }
        .ok_or_else(|| MapError::UnknownGroup(name.to_owned()))
    }

    fn nodes(self, mesh: &Mesh, id: usize) -> NodeSet {
        match self {
            Self::Boco => mesh.boco_nodes(id),
            Self::Section => mesh.section_nodes(id),
        }
    }

    fn is_surface(self, mesh: &Mesh, id: usize) -> bool {
        match self {
            Self::Boco => mesh.boco_is_surface(id),
            Self::Section => mesh.section_is_surface(id),
        }
    }
}

/// Sorts the nodes of a target surface into moving, sliding, fixed and rubber sets
pub struct NodeSetClassifier<'m> {
    mesh: &'m Mesh,
    classification: Classification,
}

impl<'m> NodeSetClassifier<'m> {
    pub fn new(mesh: &'m Mesh) -> Self {
        Self {
            mesh,
            classification: Classification::default(),
        }
    }

    pub fn classification(&self) -> &Classification {
        &self.classification
    }

    pub fn into_classification(self) -> Classification {
        self.classification
    }

    /// Default heuristic: every wall-type boundary group moves, other surface groups stay fixed
    ///
    /// A mesh without boundary groups has all of its surface nodes moving.
    pub fn collect_wall_nodes(&mut self) -> MapResult<&Classification> {
        let mesh = self.mesh;
        if mesh.surface_nodes().is_empty() {
            return Err(MapError::EmptyMesh("surface elements"));
        }

        let mut class = Classification::default();
        if mesh.bocos.is_empty() {
            class.moving = mesh.surface_nodes();
            class.moving_names.push(String::from("surface"));
        } else {
            for (id, boco) in mesh.bocos.iter().enumerate() {
                if boco.kind.is_wall() {
                    class.moving = class.moving.union(&mesh.boco_nodes(id));
                    class.moving_names.push(boco.name.clone());
                }
            }
            let mut fixed = NodeSet::new();
            for (id, boco) in mesh.bocos.iter().enumerate() {
                if !boco.kind.is_wall() && mesh.boco_is_surface(id) {
                    fixed = fixed.union(&mesh.boco_nodes(id));
                    class.fixed_names.push(boco.name.clone());
                }
            }
            class.fixed = fixed.difference(&class.moving);
        }

        tracing::info!(
            moving = class.moving.len(),
            fixed = class.fixed.len(),
            groups = ?class.moving_names,
            "wall nodes collected"
        );
        self.classification = class;
        Ok(&self.classification)
    }

    /// Explicit classification by boundary group name
    pub fn classify_bocos(
        &mut self,
        moving: &[&str],
        sliding: &[(&str, Vector3<f64>)],
        rubber: &[&str],
    ) -> MapResult<&Classification> {
        self.classify_groups(GroupKind::Boco, moving, sliding, rubber)
    }

    /// Explicit classification by element section name
    pub fn classify_sections(
        &mut self,
        moving: &[&str],
        sliding: &[(&str, Vector3<f64>)],
        rubber: &[&str],
    ) -> MapResult<&Classification> {
        self.classify_groups(GroupKind::Section, moving, sliding, rubber)
    }

    /// Classification by element property id; every surface element must carry one
    pub fn classify_pids(&mut self, moving: &[u32], rubber: &[u32]) -> MapResult<&Classification> {
        let mesh = self.mesh;
        let mut moving_nodes = Vec::new();
        let mut rubber_nodes = Vec::new();
        let mut other_nodes = Vec::new();
        let mut other_pids = BTreeSet::new();

        for (id, e) in mesh.elements.iter().enumerate() {
            if !e.kind.is_surface() {
                continue;
            }
            let pid = e.pid.ok_or_else(|| {
                MapError::MissingMetadata(format!("element {} has no property id", id))
            })?;
            let bucket = if moving.contains(&pid) {
                &mut moving_nodes
            } else if rubber.contains(&pid) {
                &mut rubber_nodes
            } else {
                other_pids.insert(pid);
                &mut other_nodes
            };
            bucket.extend(e.nodes.iter().copied());
        }

        if moving_nodes.is_empty() && !moving.is_empty() {
            tracing::warn!(pids = ?moving, "no surface element carries a moving property id");
        }

        let moving_set = NodeSet::from_unsorted(moving_nodes);
        let rubber_set = NodeSet::from_unsorted(rubber_nodes).difference(&moving_set);
        let fixed = NodeSet::from_unsorted(other_nodes)
            .difference(&moving_set)
            .difference(&rubber_set);

        self.classification = Classification {
            moving: moving_set,
            sliding: Vec::new(),
            fixed,
            rubber: rubber_set,
            moving_names: moving.iter().map(|p| format!("pid {}", p)).collect(),
            sliding_names: Vec::new(),
            fixed_names: other_pids.iter().map(|p| format!("pid {}", p)).collect(),
        };
        Ok(&self.classification)
    }

    fn classify_groups(
        &mut self,
        kind: GroupKind,
        moving: &[&str],
        sliding: &[(&str, Vector3<f64>)],
        rubber: &[&str],
    ) -> MapResult<&Classification> {
        let mesh = self.mesh;

        // resolve every name before touching any state
        let moving_ids = moving
            .iter()
            .map(|n| kind.find(mesh, n))
            .collect::<MapResult<Vec<_>>>()?;
        let sliding_ids = sliding
            .iter()
            .map(|(n, normal)| Ok((kind.find(mesh, n)?, *normal)))
            .collect::<MapResult<Vec<_>>>()?;
        let rubber_ids = rubber
            .iter()
            .map(|n| kind.find(mesh, n))
            .collect::<MapResult<Vec<_>>>()?;

        for (id, normal) in sliding_ids.iter() {
            if normal.norm_squared() == 0.0 {
                return Err(MapError::MissingMetadata(format!(
                    "sliding group '{}' has a zero plane normal",
                    kind.name(mesh, *id)
                )));
            }
        }

        let mut class = Classification::default();
        for &id in moving_ids.iter() {
            class.moving = class.moving.union(&kind.nodes(mesh, id));
            class.moving_names.push(kind.name(mesh, id).to_owned());
        }
        for &(id, normal) in sliding_ids.iter() {
            let name = kind.name(mesh, id);
            class
                .sliding
                .push(SlidingNodeSet::new(name, kind.nodes(mesh, id), normal));
            class.sliding_names.push(name.to_owned());
        }
        let mapped = class.mapped();

        class.rubber = rubber_ids
            .iter()
            .fold(NodeSet::new(), |acc, &id| acc.union(&kind.nodes(mesh, id)))
            .difference(&mapped);

        let named: BTreeSet<usize> = moving_ids
            .iter()
            .chain(sliding_ids.iter().map(|(id, _)| id))
            .chain(rubber_ids.iter())
            .copied()
            .collect();
        let mut fixed = NodeSet::new();
        for id in 0..kind.count(mesh) {
            if !named.contains(&id) && kind.is_surface(mesh, id) {
                fixed = fixed.union(&kind.nodes(mesh, id));
                class.fixed_names.push(kind.name(mesh, id).to_owned());
            }
        }
        class.fixed = fixed.difference(&mapped).difference(&class.rubber);

        tracing::info!(
            moving = class.moving.len(),
            sliding = class.sliding.len(),
            fixed = class.fixed.len(),
            rubber = class.rubber.len(),
            "surface nodes classified"
        );
        self.classification = class;
        Ok(&self.classification)
    }
}

// ----------------------------------------------------------------------------------------------------
// Displacement field selection
// ----------------------------------------------------------------------------------------------------

/// Modal data carried from a source eigenmode to its mapped counterpart
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModalInfo {
    pub frequency: f64,
    pub modal_mass: Option<f64>,
    pub modal_stiffness: Option<f64>,
}

/// The structural fields chosen for mapping
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldSelection {
    /// Indices into the structural mesh's field list
    pub fields: Vec<usize>,
    /// Modal data per selected field (eigenmodes only)
    pub modal: Vec<Option<ModalInfo>>,
}

impl FieldSelection {
    /// Displacements and eigenmodes; without any, every 3- or 6-component field except "velocity"
    pub fn collect_disp_fields(mesh: &Mesh) -> Self {
        let mut fields: Vec<usize> = mesh
            .fields
            .iter()
            .enumerate()
            .filter(|(_, f)| f.class.is_displacement_like())
            .map(|(i, _)| i)
            .collect();

        if fields.is_empty() {
            fields = mesh
                .fields
                .iter()
                .enumerate()
                .filter(|(_, f)| {
                    (f.components == 3 || f.components == 6)
                        && !f.name.eq_ignore_ascii_case("velocity")
                })
                .map(|(i, _)| i)
                .collect();
            if !fields.is_empty() {
                tracing::debug!(count = fields.len(), "no tagged displacements; using vector fields");
            }
        }

        let modal = fields
            .iter()
            .map(|&i| {
                let f = &mesh.fields[i];
                match (f.class, f.meta.frequency) {
                    (ValueClass::Eigenmode, Some(frequency)) => Some(ModalInfo {
                        frequency,
                        modal_mass: f.meta.modal_mass,
                        modal_stiffness: f.meta.modal_stiffness,
                    }),
                    _ => None,
                }
            })
            .collect();

        Self { fields, modal }
    }

    /// The `max_count` lowest-frequency eigenmodes with `min_freq <= f <= max_freq`
    ///
    /// Every eigenmode must be annotated with its frequency.
    pub fn use_eigenmodes(
        mesh: &Mesh,
        max_count: usize,
        min_freq: f64,
        max_freq: f64,
    ) -> MapResult<Self> {
        let mut modes = Vec::new();
        for (i, f) in mesh.fields.iter().enumerate() {
            if f.class != ValueClass::Eigenmode {
                continue;
            }
            let frequency = f.meta.frequency.ok_or_else(|| {
                MapError::MissingMetadata(format!("eigenmode '{}' has no frequency", f.name))
            })?;
            if frequency >= min_freq && frequency <= max_freq {
                modes.push((
                    i,
                    ModalInfo {
                        frequency,
                        modal_mass: f.meta.modal_mass,
                        modal_stiffness: f.meta.modal_stiffness,
                    },
                ));
            }
        }
        modes.sort_by(|a, b| a.1.frequency.total_cmp(&b.1.frequency));
        modes.truncate(max_count);

        tracing::info!(selected = modes.len(), min_freq, max_freq, "eigenmodes selected");
        Ok(Self {
            fields: modes.iter().map(|(i, _)| *i).collect(),
            modal: modes.into_iter().map(|(_, m)| Some(m)).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, Option<&ModalInfo>)> + '_ {
        self.fields
            .iter()
            .copied()
            .zip(self.modal.iter().map(|m| m.as_ref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::{BocoKind, Field};

    fn target() -> Mesh {
        Mesh::from_file("./test_input/plate_target.json").unwrap()
    }

    #[test]
    fn wall_heuristic() {
        let mesh = target();
        let mut classifier = NodeSetClassifier::new(&mesh);
        let class = classifier.collect_wall_nodes().unwrap();
        assert_eq!(class.moving.len(), 6);
        assert_eq!(class.moving_names, vec![String::from("wall")]);
        // the farfield shares the middle row with the wall
        assert_eq!(class.fixed.len(), 3);
        assert!(class.moving.is_disjoint(&class.fixed));
        assert_eq!(class.all().len(), mesh.nodes.len());
    }

    #[test]
    fn categories_partition_the_surface() {
        let mut mesh = target();
        mesh.push_boco("sym", BocoKind::Symmetry, vec![1]);
        let mut classifier = NodeSetClassifier::new(&mesh);
        let class = classifier
            .classify_bocos(&["wall"], &[("sym", Vector3::new(0.0, 1.0, 0.0))], &[])
            .unwrap()
            .clone();

        let mapped = class.mapped();
        assert_eq!(mapped, class.moving.union(&class.sliding_nodes()));
        assert!(mapped.is_disjoint(&class.fixed));
        assert!(mapped.is_disjoint(&class.rubber));
        assert!(class.fixed.is_disjoint(&class.rubber));
        let total = mapped.len() + class.fixed.len() + class.rubber.len();
        assert_eq!(total, class.all().len());
        assert_eq!(class.all(), mesh.surface_nodes());
        assert_eq!(class.sliding_names, vec![String::from("sym")]);
    }

    #[test]
    fn rubber_is_removed_from_fixed() {
        let mesh = target();
        let mut classifier = NodeSetClassifier::new(&mesh);
        let class = classifier.classify_bocos(&["wall"], &[], &["far"]).unwrap();
        assert!(class.fixed.is_empty());
        assert_eq!(class.rubber.len(), 3);
    }

    #[test]
    fn unknown_group_leaves_state_untouched() {
        let mesh = target();
        let mut classifier = NodeSetClassifier::new(&mesh);
        classifier.collect_wall_nodes().unwrap();
        let before = classifier.classification().clone();
        let err = classifier.classify_bocos(&["wing"], &[], &[]).unwrap_err();
        assert!(matches!(err, MapError::UnknownGroup(ref n) if n == "wing"));
        assert_eq!(classifier.classification(), &before);
    }

    #[test]
    fn sections_classify_whole_mesh() {
        let mesh = target();
        let mut classifier = NodeSetClassifier::new(&mesh);
        let class = classifier.classify_sections(&["skin"], &[], &[]).unwrap();
        assert_eq!(class.moving.len(), 9);
        assert!(class.fixed.is_empty());
    }

    #[test]
    fn pid_filter_requires_pids() {
        let mesh = target();
        let mut classifier = NodeSetClassifier::new(&mesh);
        assert!(matches!(
            classifier.classify_pids(&[1], &[]),
            Err(MapError::MissingMetadata(_))
        ));

        let structure = Mesh::from_file("./test_input/plate_structure.json").unwrap();
        let mut classifier = NodeSetClassifier::new(&structure);
        let class = classifier.classify_pids(&[1], &[]).unwrap();
        assert!(!class.moving.is_empty());
        assert!(class.moving.is_disjoint(&class.fixed));
    }

    #[test]
    fn displacement_fields_are_selected() {
        let mesh = Mesh::from_file("./test_input/plate_structure.json").unwrap();
        let sel = FieldSelection::collect_disp_fields(&mesh);
        assert_eq!(sel.len(), 2);
        let names: Vec<&str> = sel.iter().map(|(i, _)| mesh.fields[i].name.as_str()).collect();
        assert!(names.contains(&"mode 1"));
        assert!(names.contains(&"static"));
        let (_, modal) = sel
            .iter()
            .find(|(i, _)| mesh.fields[*i].name == "mode 1")
            .unwrap();
        assert_eq!(modal.unwrap().frequency, 3.5);
    }

    #[test]
    fn vector_fallback_skips_velocity() {
        let mut mesh = Mesh::from_triangles(
            vec![
                nalgebra::Point3::new(0.0, 0.0, 0.0),
                nalgebra::Point3::new(1.0, 0.0, 0.0),
                nalgebra::Point3::new(0.0, 1.0, 0.0),
            ],
            &[[0, 1, 2]],
        );
        let v = vec![0.0; 9];
        mesh.append_field(Field::new("velocity", ValueClass::Field, 3, v.clone()).unwrap())
            .unwrap();
        mesh.append_field(Field::new("deflection", ValueClass::Field, 3, v).unwrap())
            .unwrap();
        mesh.append_field(Field::new("p", ValueClass::Field, 1, vec![0.0; 3]).unwrap())
            .unwrap();
        let sel = FieldSelection::collect_disp_fields(&mesh);
        assert_eq!(sel.fields, vec![1]);
    }

    #[test]
    fn eigenmode_window() {
        let mut mesh = Mesh::from_file("./test_input/plate_structure.json").unwrap();
        for (k, freq) in [(2, 9.0), (3, 1.0), (4, 20.0)] {
            let mut f = Field::new(
                format!("mode {}", k),
                ValueClass::Eigenmode,
                3,
                vec![0.0; 3 * mesh.nodes.len()],
            )
            .unwrap();
            f.meta.frequency = Some(freq);
            f.meta.modal_mass = Some(k as f64);
            mesh.append_field(f).unwrap();
        }

        let sel = FieldSelection::use_eigenmodes(&mesh, 2, 2.0, 15.0).unwrap();
        let freqs: Vec<f64> = sel.modal.iter().map(|m| m.unwrap().frequency).collect();
        assert_eq!(freqs, vec![3.5, 9.0]);
        assert_eq!(sel.modal[1].unwrap().modal_mass, Some(2.0));

        let mut unannotated = mesh.clone();
        unannotated.fields[0].meta.frequency = None;
        assert!(FieldSelection::use_eigenmodes(&unannotated, 5, 0.0, 100.0).is_err());
    }
}
