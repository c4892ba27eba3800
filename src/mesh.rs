/// Named per-node fields and their metadata
pub mod field;
/// Node adjacency and element connectivity components
pub mod topology;

pub use field::{Field, FieldMeta, ValueClass};
pub use topology::Adjacency;

use crate::error::{MapError, MapResult};
use crate::node_sets::NodeSet;

#[cfg(feature = "json_export")]
use json::object;
use json::JsonValue;
use nalgebra::Point3;
use smallvec::SmallVec;
use std::fmt;
use std::fs::read_to_string;
#[cfg(feature = "json_export")]
use std::{fs::File, io::BufWriter};

/// Element shapes known to the mapping engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ElementKind {
    Line2,
    Tri3,
    Quad4,
    Beam2,
    /// Rigid body element / connector between otherwise separate parts
    Rbe,
}

impl ElementKind {
    pub fn node_count(self) -> Option<usize> {
        match self {
            Self::Line2 | Self::Beam2 => Some(2),
            Self::Tri3 => Some(3),
            Self::Quad4 => Some(4),
            Self::Rbe => None,
        }
    }

    /// Triangles and quadrilaterals carry the surface
    pub fn is_surface(self) -> bool {
        matches!(self, Self::Tri3 | Self::Quad4)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Line2 => "line2",
            Self::Tri3 => "tri3",
            Self::Quad4 => "quad4",
            Self::Beam2 => "beam2",
            Self::Rbe => "rbe",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        match tag.to_ascii_lowercase().as_str() {
            "line2" => Some(Self::Line2),
            "tri3" => Some(Self::Tri3),
            "quad4" => Some(Self::Quad4),
            "beam2" => Some(Self::Beam2),
            "rbe" => Some(Self::Rbe),
            _ => None,
        }
    }
}

/// Boundary condition tag of a boundary group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BocoKind {
    WallAdiabatic,
    WallSlip,
    WallNoSlip,
    Farfield,
    Symmetry,
    Inflow,
    Outflow,
    Other,
}

impl BocoKind {
    pub fn is_wall(self) -> bool {
        matches!(self, Self::WallAdiabatic | Self::WallSlip | Self::WallNoSlip)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::WallAdiabatic => "wall_adiabatic",
            Self::WallSlip => "wall_slip",
            Self::WallNoSlip => "wall_noslip",
            Self::Farfield => "farfield",
            Self::Symmetry => "symmetry",
            Self::Inflow => "inflow",
            Self::Outflow => "outflow",
            Self::Other => "other",
        }
    }

    pub fn parse(tag: &str) -> Self {
        match tag.to_ascii_lowercase().as_str() {
            "wall_adiabatic" | "adiabatic" => Self::WallAdiabatic,
            "wall_slip" | "slip" => Self::WallSlip,
            "wall_noslip" | "noslip" | "wall" => Self::WallNoSlip,
            "farfield" => Self::Farfield,
            "symmetry" => Self::Symmetry,
            "inflow" => Self::Inflow,
            "outflow" => Self::Outflow,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub kind: ElementKind,
    pub nodes: SmallVec<[u32; 4]>,
    /// Index of the owning [`Section`]
    pub section: usize,
    /// Property id (structural meshes)
    pub pid: Option<u32>,
}

impl Element {
    pub fn new(kind: ElementKind, nodes: &[u32], section: usize) -> Self {
        Self {
            kind,
            nodes: SmallVec::from_slice(nodes),
            section,
            pid: None,
        }
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }
}

/// A named group of elements sharing one element type
#[derive(Debug, Clone, PartialEq)]
pub struct Section {
    pub name: String,
}

/// A boundary condition group: a named element list with a type tag
#[derive(Debug, Clone, PartialEq)]
pub struct Boco {
    pub name: String,
    pub kind: BocoKind,
    pub elements: Vec<u32>,
}

/// One triangle of the surface; quadrilaterals contribute two
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceTriangle {
    pub nodes: [u32; 3],
    /// Element the triangle was cut from
    pub element: u32,
}

/// Minimal in-memory mesh: nodes, elements, named groups and per-node fields
///
/// Both the structural mesh (source of the displacement fields) and the target surface mesh
/// use this type. It is read-mostly; mapping only ever appends fields.
#[derive(Debug, Clone, Default)]
pub struct Mesh {
    pub nodes: Vec<Point3<f64>>,
    pub elements: Vec<Element>,
    pub sections: Vec<Section>,
    pub bocos: Vec<Boco>,
    pub fields: Vec<Field>,
}

impl Mesh {
    pub fn new(nodes: Vec<Point3<f64>>) -> Self {
        Self {
            nodes,
            ..Default::default()
        }
    }

    /// A mesh with one section holding the given triangles
    pub fn from_triangles(nodes: Vec<Point3<f64>>, triangles: &[[u32; 3]]) -> Self {
        let mut mesh = Self::new(nodes);
        let section = mesh.push_section("surface");
        for t in triangles {
            mesh.elements.push(Element::new(ElementKind::Tri3, t, section));
        }
        mesh
    }

    /// Construct a Mesh from a JSON file with the following format
    ///
    /// ```JSON
    /// {
    ///     "Nodes": [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
    ///     "Sections": [{ "name": "skin" }],
    ///     "Elements": [
    ///         { "kind": "tri3", "nodes": [0, 1, 2], "section": 0, "pid": 7 }
    ///     ],
    ///     "Bocos": [{ "name": "wing", "kind": "wall_noslip", "elements": [0] }],
    ///     "Fields": [
    ///         { "name": "mode 1", "class": "eigenmode", "components": 3,
    ///           "values": [0, 0, 1, 0, 0, 1, 0, 0, 1], "frequency": 4.2 }
    ///     ]
    /// }
    /// ```
    ///
    /// "Sections", "Bocos" and "Fields" are optional. Without sections, all elements land in
    /// a single section called "default".
    pub fn from_file(path: impl AsRef<str>) -> MapResult<Self> {
        let contents = read_to_string(path.as_ref())?;
        Self::from_json(&contents)
    }

    /// Parse a mesh from a JSON string (see [`Mesh::from_file`])
    pub fn from_json(contents: &str) -> MapResult<Self> {
        let mesh_json = json::parse(contents).map_err(|e| MapError::Parse(e.to_string()))?;

        let nodes = parse_node_information(&mesh_json)?;
        let sections = parse_section_information(&mesh_json);
        let elements = parse_element_information(&mesh_json, nodes.len(), sections.len())?;
        let bocos = parse_boco_information(&mesh_json, elements.len())?;

        let mut mesh = Self {
            nodes,
            elements,
            sections,
            bocos,
            fields: Vec::new(),
        };

        for field_json in mesh_json["Fields"].members() {
            let field = Field::from_json(field_json)?;
            mesh.append_field(field)?;
        }

        Ok(mesh)
    }

    /// Print the mesh to a JSON file specified by path.
    #[cfg(feature = "json_export")]
    pub fn export_to_json(&self, path: impl AsRef<str>) -> std::io::Result<()> {
        let f = File::create(path.as_ref())?;
        let mut w = BufWriter::new(&f);

        let mesh_object = object! {
            "Nodes": JsonValue::from(self.nodes.iter().map(|p| JsonValue::from(vec![p.x, p.y, p.z])).collect::<Vec<_>>()),
            "Sections": JsonValue::from(self.sections.iter().map(|s| object! { "name": s.name.clone() }).collect::<Vec<_>>()),
            "Elements": JsonValue::from(self.elements.iter().map(element_to_json).collect::<Vec<_>>()),
            "Bocos": JsonValue::from(self.bocos.iter().map(|b| object! {
                "name": b.name.clone(),
                "kind": b.kind.as_str(),
                "elements": b.elements.clone(),
            }).collect::<Vec<_>>()),
            "Fields": JsonValue::from(self.fields.iter().map(|f| f.to_json()).collect::<Vec<_>>()),
        };

        mesh_object.write_pretty(&mut w, 4)?;

        Ok(())
    }

    // ----------------------------------------------------------------------------------------------------
    // Construction helpers
    // ----------------------------------------------------------------------------------------------------

    /// Add an empty section, returning its index
    pub fn push_section(&mut self, name: impl Into<String>) -> usize {
        self.sections.push(Section { name: name.into() });
        self.sections.len() - 1
    }

    /// Add a boundary group, returning its index
    pub fn push_boco(&mut self, name: impl Into<String>, kind: BocoKind, elements: Vec<u32>) -> usize {
        self.bocos.push(Boco {
            name: name.into(),
            kind,
            elements,
        });
        self.bocos.len() - 1
    }

    /// Append a field; its node count must match the mesh
    pub fn append_field(&mut self, field: Field) -> MapResult<usize> {
        field.check_node_count(self.nodes.len())?;
        self.fields.push(field);
        Ok(self.fields.len() - 1)
    }

    // ----------------------------------------------------------------------------------------------------
    // General Data Retrieval
    // ----------------------------------------------------------------------------------------------------

    pub fn find_field(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn find_boco(&self, name: &str) -> Option<usize> {
        self.bocos.iter().position(|b| b.name == name)
    }

    pub fn find_section(&self, name: &str) -> Option<usize> {
        self.sections.iter().position(|s| s.name == name)
    }

    /// Nodes referenced by the elements of a boundary group
    pub fn boco_nodes(&self, boco: usize) -> NodeSet {
        NodeSet::from_unsorted(
            self.bocos[boco]
                .elements
                .iter()
                .flat_map(|&e| self.elements[e as usize].nodes.iter().copied())
                .collect(),
        )
    }

    /// Nodes referenced by the elements of a section
    pub fn section_nodes(&self, section: usize) -> NodeSet {
        NodeSet::from_unsorted(
            self.elements
                .iter()
                .filter(|e| e.section == section)
                .flat_map(|e| e.nodes.iter().copied())
                .collect(),
        )
    }

    /// Does the boundary group contain surface elements?
    pub fn boco_is_surface(&self, boco: usize) -> bool {
        self.bocos[boco]
            .elements
            .iter()
            .any(|&e| self.elements[e as usize].kind.is_surface())
    }

    /// Does the section contain surface elements?
    pub fn section_is_surface(&self, section: usize) -> bool {
        self.elements
            .iter()
            .any(|e| e.section == section && e.kind.is_surface())
    }

    /// Nodes referenced by any surface element
    pub fn surface_nodes(&self) -> NodeSet {
        NodeSet::from_unsorted(
            self.elements
                .iter()
                .filter(|e| e.kind.is_surface())
                .flat_map(|e| e.nodes.iter().copied())
                .collect(),
        )
    }

    /// All surface elements as triangles; quadrilaterals are split along their 0-2 diagonal
    pub fn surface_triangles(&self) -> Vec<SurfaceTriangle> {
        let mut tris = Vec::with_capacity(self.elements.len() * 2);
        for (id, e) in self.elements.iter().enumerate() {
            let element = id as u32;
            match e.kind {
                ElementKind::Tri3 => tris.push(SurfaceTriangle {
                    nodes: [e.nodes[0], e.nodes[1], e.nodes[2]],
                    element,
                }),
                ElementKind::Quad4 => {
                    tris.push(SurfaceTriangle {
                        nodes: [e.nodes[0], e.nodes[1], e.nodes[2]],
                        element,
                    });
                    tris.push(SurfaceTriangle {
                        nodes: [e.nodes[0], e.nodes[2], e.nodes[3]],
                        element,
                    });
                }
                _ => (),
            }
        }
        tris
    }

    /// Corner points of a surface triangle
    pub fn triangle_points(&self, t: &SurfaceTriangle) -> [Point3<f64>; 3] {
        t.nodes.map(|n| self.nodes[n as usize])
    }
}

impl fmt::Display for Mesh {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Mesh ({} nodes, {} elements, {} sections, {} bocos, {} fields)",
            self.nodes.len(),
            self.elements.len(),
            self.sections.len(),
            self.bocos.len(),
            self.fields.len()
        )
    }
}

#[cfg(feature = "json_export")]
fn element_to_json(e: &Element) -> JsonValue {
    let mut jv = object! {
        "kind": e.kind.as_str(),
        "nodes": e.nodes.to_vec(),
        "section": e.section,
    };
    if let Some(pid) = e.pid {
        jv["pid"] = pid.into();
    }
    jv
}

fn parse_node_information(mesh_json: &JsonValue) -> MapResult<Vec<Point3<f64>>> {
    if !mesh_json["Nodes"].is_array() {
        return Err(MapError::Parse("Nodes must be an Array!".into()));
    }

    mesh_json["Nodes"]
        .members()
        .map(|json_node| {
            if !json_node.is_array() || json_node.members().count() != 3 {
                return Err(MapError::Parse("nodes must be arrays of length 3!".into()));
            }
            let mut xyz = [0.0; 3];
            for (k, c) in xyz.iter_mut().enumerate() {
                *c = json_node[k]
                    .as_f64()
                    .ok_or_else(|| MapError::Parse("nodes must be composed of numerical values!".into()))?;
            }
            Ok(Point3::new(xyz[0], xyz[1], xyz[2]))
        })
        .collect()
}

fn parse_section_information(mesh_json: &JsonValue) -> Vec<Section> {
    let sections: Vec<Section> = mesh_json["Sections"]
        .members()
        .enumerate()
        .map(|(i, s)| Section {
            name: s["name"]
                .as_str()
                .map(String::from)
                .unwrap_or_else(|| format!("section {}", i)),
        })
        .collect();

    if sections.is_empty() {
        vec![Section {
            name: String::from("default"),
        }]
    } else {
        sections
    }
}

fn parse_element_information(
    mesh_json: &JsonValue,
    num_nodes: usize,
    num_sections: usize,
) -> MapResult<Vec<Element>> {
    mesh_json["Elements"]
        .members()
        .enumerate()
        .map(|(element_id, json_element)| {
            let tag = json_element["kind"].as_str().unwrap_or("tri3");
            let kind = ElementKind::parse(tag)
                .ok_or_else(|| MapError::Parse(format!("unknown element kind '{}'", tag)))?;

            let nodes = json_element["nodes"]
                .members()
                .map(|n| match n.as_usize() {
                    Some(id) if id < num_nodes => Ok(id as u32),
                    Some(id) => Err(MapError::InvalidIndex {
                        kind: "node",
                        index: id,
                        count: num_nodes,
                    }),
                    None => Err(MapError::Parse("node ids must be positive integers!".into())),
                })
                .collect::<MapResult<SmallVec<[u32; 4]>>>()?;

            if let Some(expected) = kind.node_count() {
                if nodes.len() != expected {
                    return Err(MapError::Parse(format!(
                        "element {} ({}) needs {} nodes, found {}",
                        element_id,
                        tag,
                        expected,
                        nodes.len()
                    )));
                }
            }

            let section = json_element["section"].as_usize().unwrap_or(0);
            if section >= num_sections {
                return Err(MapError::InvalidIndex {
                    kind: "section",
                    index: section,
                    count: num_sections,
                });
            }

            Ok(Element {
                kind,
                nodes,
                section,
                pid: json_element["pid"].as_u32(),
            })
        })
        .collect()
}

fn parse_boco_information(mesh_json: &JsonValue, num_elements: usize) -> MapResult<Vec<Boco>> {
    mesh_json["Bocos"]
        .members()
        .enumerate()
        .map(|(i, b)| {
            let elements = b["elements"]
                .members()
                .map(|e| match e.as_usize() {
                    Some(id) if id < num_elements => Ok(id as u32),
                    Some(id) => Err(MapError::InvalidIndex {
                        kind: "element",
                        index: id,
                        count: num_elements,
                    }),
                    None => Err(MapError::Parse("boco element ids must be positive integers!".into())),
                })
                .collect::<MapResult<Vec<u32>>>()?;

            Ok(Boco {
                name: b["name"]
                    .as_str()
                    .map(String::from)
                    .unwrap_or_else(|| format!("boco {}", i)),
                kind: BocoKind::parse(b["kind"].as_str().unwrap_or("other")),
                elements,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mesh_from_file() {
        let mesh = Mesh::from_file("./test_input/plate_target.json").unwrap();
        assert_eq!(mesh.nodes.len(), 9);
        assert_eq!(mesh.elements.len(), 4);
        assert_eq!(mesh.bocos.len(), 2);
        assert_eq!(mesh.bocos[0].kind, BocoKind::WallNoSlip);
        assert_eq!(mesh.bocos[1].kind, BocoKind::Farfield);
        // quads are split in two
        assert_eq!(mesh.surface_triangles().len(), 8);
        assert_eq!(mesh.boco_nodes(0).len(), 6);
    }

    #[test]
    fn structural_mesh_with_fields() {
        let mesh = Mesh::from_file("./test_input/plate_structure.json").unwrap();
        assert_eq!(mesh.fields.len(), 3);
        let mode = &mesh.fields[mesh.find_field("mode 1").unwrap()];
        assert_eq!(mode.class, ValueClass::Eigenmode);
        assert_eq!(mode.meta.frequency, Some(3.5));
        assert_eq!(mesh.elements[0].pid, Some(1));
    }

    #[test]
    fn bad_node_reference() {
        let json = r#"{ "Nodes": [[0,0,0],[1,0,0]], "Elements": [{ "kind": "tri3", "nodes": [0, 1, 5] }] }"#;
        assert!(matches!(
            Mesh::from_json(json),
            Err(MapError::InvalidIndex { kind: "node", index: 5, .. })
        ));
    }

    #[test]
    fn wrong_node_count_is_a_parse_error() {
        let json = r#"{ "Nodes": [[0,0,0],[1,0,0],[0,1,0]], "Elements": [{ "kind": "quad4", "nodes": [0, 1, 2] }] }"#;
        assert!(matches!(Mesh::from_json(json), Err(MapError::Parse(_))));
    }

    #[test]
    fn append_field_checks_size() {
        let mut mesh = Mesh::from_triangles(
            vec![
                Point3::new(0.0, 0.0, 0.0),
                Point3::new(1.0, 0.0, 0.0),
                Point3::new(0.0, 1.0, 0.0),
            ],
            &[[0, 1, 2]],
        );
        let short = Field::new("f", ValueClass::Field, 1, vec![1.0, 2.0]).unwrap();
        assert!(mesh.append_field(short).is_err());
        assert!(mesh.fields.is_empty());
        let ok = Field::new("f", ValueClass::Field, 1, vec![1.0, 2.0, 3.0]).unwrap();
        assert_eq!(mesh.append_field(ok).unwrap(), 0);
    }

    #[cfg(feature = "json_export")]
    #[test]
    fn export_and_reload() {
        let mesh = Mesh::from_file("./test_input/plate_structure.json").unwrap();
        std::fs::create_dir_all("./test_output").unwrap();
        mesh.export_to_json("./test_output/plate_structure_copy.json")
            .unwrap();
        let back = Mesh::from_file("./test_output/plate_structure_copy.json").unwrap();
        assert_eq!(back.nodes, mesh.nodes);
        assert_eq!(back.elements, mesh.elements);
        assert_eq!(back.fields.len(), mesh.fields.len());
    }
}
