use crate::error::{check_size, MapError, MapResult};
use json::{object, JsonValue};
use nalgebra::Vector3;
use std::fmt;

/// What a nodal field represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueClass {
    /// Any other nodal quantity (pressure, temperature, ...)
    Field,
    /// Static or transient displacement
    Displacement,
    /// Mode shape from an eigenvalue analysis
    Eigenmode,
}

impl ValueClass {
    pub fn is_displacement_like(self) -> bool {
        match self {
            Self::Displacement | Self::Eigenmode => true,
            Self::Field => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Field => "field",
            Self::Displacement => "displacement",
            Self::Eigenmode => "eigenmode",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        match tag.to_ascii_lowercase().as_str() {
            "field" => Some(Self::Field),
            "displacement" => Some(Self::Displacement),
            "eigenmode" => Some(Self::Eigenmode),
            _ => None,
        }
    }
}

impl fmt::Display for ValueClass {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Annotations carried along with a field
///
/// Mapped fields copy the modal data of their source and record the scale factor and the
/// node groups used for classification, so the result can be reproduced downstream.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldMeta {
    /// Natural frequency in Hz (eigenmodes)
    pub frequency: Option<f64>,
    pub modal_mass: Option<f64>,
    pub modal_stiffness: Option<f64>,
    /// Global scale factor applied when the field was produced
    pub scale: f64,
    pub moving: Vec<String>,
    pub sliding: Vec<String>,
    pub fixed: Vec<String>,
}

impl Default for FieldMeta {
    fn default() -> Self {
        Self {
            frequency: None,
            modal_mass: None,
            modal_stiffness: None,
            scale: 1.0,
            moving: Vec::new(),
            sliding: Vec::new(),
            fixed: Vec::new(),
        }
    }
}

/// A named per-node quantity stored row-major (`components` values per node)
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub class: ValueClass,
    pub components: usize,
    pub values: Vec<f64>,
    pub meta: FieldMeta,
}

impl Field {
    pub fn new(
        name: impl Into<String>,
        class: ValueClass,
        components: usize,
        values: Vec<f64>,
    ) -> MapResult<Self> {
        if components == 0 || values.len() % components != 0 {
            return Err(MapError::SizeMismatch {
                context: "field values per component",
                expected: components,
                found: values.len(),
            });
        }
        Ok(Self {
            name: name.into(),
            class,
            components,
            values,
            meta: FieldMeta::default(),
        })
    }

    /// Three-component field built from one vector per node
    pub fn from_vectors(name: impl Into<String>, class: ValueClass, vectors: &[Vector3<f64>]) -> Self {
        Self {
            name: name.into(),
            class,
            components: 3,
            values: vectors.iter().flat_map(|v| [v.x, v.y, v.z]).collect(),
            meta: FieldMeta::default(),
        }
    }

    pub fn with_meta(mut self, meta: FieldMeta) -> Self {
        self.meta = meta;
        self
    }

    pub fn node_count(&self) -> usize {
        self.values.len() / self.components
    }

    /// Translational part of the field, one vector per node
    ///
    /// Fields with 6 components (translations followed by rotations) yield their first three.
    pub fn translations(&self) -> MapResult<Vec<Vector3<f64>>> {
        if self.components < 3 {
            return Err(MapError::MissingMetadata(format!(
                "field '{}' has {} component(s); need at least 3 for a displacement",
                self.name, self.components
            )));
        }
        Ok(self
            .values
            .chunks_exact(self.components)
            .map(|c| Vector3::new(c[0], c[1], c[2]))
            .collect())
    }

    pub(crate) fn check_node_count(&self, num_nodes: usize) -> MapResult<()> {
        check_size("field node count", num_nodes, self.node_count())
    }

    pub(crate) fn to_json(&self) -> JsonValue {
        let mut jv = object! {
            "name": self.name.clone(),
            "class": self.class.as_str(),
            "components": self.components,
            "values": self.values.clone(),
            "scale": self.meta.scale,
            "moving": self.meta.moving.clone(),
            "sliding": self.meta.sliding.clone(),
            "fixed": self.meta.fixed.clone(),
        };
        if let Some(f) = self.meta.frequency {
            jv["frequency"] = f.into();
        }
        if let Some(m) = self.meta.modal_mass {
            jv["modal_mass"] = m.into();
        }
        if let Some(k) = self.meta.modal_stiffness {
            jv["modal_stiffness"] = k.into();
        }
        jv
    }

    pub(crate) fn from_json(jv: &JsonValue) -> MapResult<Self> {
        let name = jv["name"]
            .as_str()
            .ok_or_else(|| MapError::Parse("field without a name".into()))?;
        let class = match jv["class"].as_str() {
            Some(tag) => ValueClass::parse(tag)
                .ok_or_else(|| MapError::Parse(format!("unknown value class '{}'", tag)))?,
            None => ValueClass::Field,
        };
        let components = jv["components"].as_usize().unwrap_or(3);
        let values = jv["values"]
            .members()
            .map(|v| {
                v.as_f64()
                    .ok_or_else(|| MapError::Parse(format!("non-numeric value in field '{}'", name)))
            })
            .collect::<MapResult<Vec<f64>>>()?;

        let mut field = Self::new(name, class, components, values)?;
        field.meta.frequency = jv["frequency"].as_f64();
        field.meta.modal_mass = jv["modal_mass"].as_f64();
        field.meta.modal_stiffness = jv["modal_stiffness"].as_f64();
        field.meta.scale = jv["scale"].as_f64().unwrap_or(1.0);
        let names = |key: &str| -> Vec<String> {
            jv[key]
                .members()
                .filter_map(|n| n.as_str().map(String::from))
                .collect()
        };
        field.meta.moving = names("moving");
        field.meta.sliding = names("sliding");
        field.meta.fixed = names("fixed");
        Ok(field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn six_component_translations() {
        let f = Field::new(
            "disp",
            ValueClass::Displacement,
            6,
            vec![1.0, 2.0, 3.0, 0.1, 0.2, 0.3, 4.0, 5.0, 6.0, 0.4, 0.5, 0.6],
        )
        .unwrap();
        let t = f.translations().unwrap();
        assert_eq!(f.node_count(), 2);
        assert_eq!(t[1], Vector3::new(4.0, 5.0, 6.0));
    }

    #[test]
    fn scalar_field_has_no_translation() {
        let f = Field::new("p", ValueClass::Field, 1, vec![1.0, 2.0]).unwrap();
        assert!(f.translations().is_err());
        assert!(Field::new("bad", ValueClass::Field, 3, vec![1.0, 2.0]).is_err());
    }

    #[test]
    fn json_round_trip_keeps_modal_data() {
        let mut f = Field::from_vectors("m1", ValueClass::Eigenmode, &[Vector3::new(0.0, 0.0, 1.0)]);
        f.meta.frequency = Some(12.5);
        f.meta.modal_mass = Some(2.0);
        let back = Field::from_json(&f.to_json()).unwrap();
        assert_eq!(back.class, ValueClass::Eigenmode);
        assert_eq!(back.meta.frequency, Some(12.5));
        assert_eq!(back.meta.modal_mass, Some(2.0));
        assert_eq!(back.values, f.values);
    }
}
