use super::MetadataCacheError;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DimensionType {
    Time,
    Measure,
    Standard,
    Geometry,
}

impl FromStr for DimensionType {
    type Err = MetadataCacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Time" => Ok(DimensionType::Time),
            "Measure" => Ok(DimensionType::Measure),
            "Standard" => Ok(DimensionType::Standard),
            "Geometry" => Ok(DimensionType::Geometry),
            other => Err(MetadataCacheError::IllegalDimensionType(other.to_string())),
        }
    }
}

impl fmt::Display for DimensionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DimensionType::Time => "Time",
            DimensionType::Measure => "Measure",
            DimensionType::Standard => "Standard",
            DimensionType::Geometry => "Geometry",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyType {
    Standard,
    Geometry,
}

impl FromStr for PropertyType {
    type Err = MetadataCacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Standard" => Ok(PropertyType::Standard),
            "Geometry" => Ok(PropertyType::Geometry),
            other => Err(MetadataCacheError::IllegalPropertyType(other.to_string())),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Schema {
    pub id: String,
    pub caption: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Cube {
    pub id: String,
    pub caption: String,
    pub description: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Dimension {
    pub id: String,
    pub caption: String,
    pub description: String,
    pub dimension_type: DimensionType,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Hierarchy {
    pub id: String,
    pub caption: String,
    pub description: String,
}

/// A level of a hierarchy. `index` is its position, root first.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Level {
    pub id: String,
    pub caption: String,
    pub description: String,
    pub index: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Property {
    pub id: String,
    pub caption: String,
    pub description: String,
    pub property_type: PropertyType,
}

/// A member of a level.
///
/// Geometry property values are kept as WKT text; they are only converted to
/// GeoJSON on the copies handed out by the orchestrator.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Member {
    pub id: String,
    pub caption: String,
    pub description: String,
    #[serde(default)]
    pub properties: IndexMap<String, Value>,
    #[serde(default)]
    pub children: Vec<String>,
}

impl Member {
    pub fn new(id: impl Into<String>, caption: impl Into<String>) -> Self {
        Member {
            id: id.into(),
            caption: caption.into(),
            description: String::new(),
            properties: IndexMap::new(),
            children: Vec::new(),
        }
    }

    pub fn with_children<I, S>(mut self, children: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.children = children.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_property(mut self, id: impl Into<String>, value: Value) -> Self {
        self.properties.insert(id.into(), value);
        self
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// Members of one level keyed by member id, in the order the API returned them.
pub type Slice = IndexMap<String, Member>;

/// Addresses one hierarchy of one dimension; levels below it are addressed by
/// positional index.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq, Hash)]
pub struct HierarchyPath {
    pub schema: String,
    pub cube: String,
    pub dimension: String,
    pub hierarchy: String,
}

impl HierarchyPath {
    pub fn new(
        schema: impl Into<String>,
        cube: impl Into<String>,
        dimension: impl Into<String>,
        hierarchy: impl Into<String>,
    ) -> Self {
        HierarchyPath {
            schema: schema.into(),
            cube: cube.into(),
            dimension: dimension.into(),
            hierarchy: hierarchy.into(),
        }
    }
}

impl fmt::Display for HierarchyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.schema, self.cube, self.dimension, self.hierarchy
        )
    }
}
