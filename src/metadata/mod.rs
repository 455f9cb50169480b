pub mod model;

use indexmap::{IndexMap, IndexSet};
use model::{
    Cube, Dimension, DimensionType, Hierarchy, HierarchyPath, Level, Member, Property,
    PropertyType, Schema, Slice,
};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MetadataCacheError {
    #[error("Schema not in cache: {0}")]
    SchemaNotInCache(String),

    #[error("Cube not in cache: {0}")]
    CubeNotInCache(String),

    #[error("Dimension not in cache: {0}")]
    DimensionNotInCache(String),

    #[error("Hierarchy not in cache: {0}")]
    HierarchyNotInCache(String),

    #[error("Level not in cache: {0}")]
    LevelNotInCache(String),

    #[error("Illegal dimension type: {0}")]
    IllegalDimensionType(String),

    #[error("Illegal property type: {0}")]
    IllegalPropertyType(String),
}

#[derive(Debug, Clone)]
struct SchemaEntry {
    schema: Schema,
    cubes: IndexMap<String, CubeEntry>,
}

#[derive(Debug, Clone)]
struct CubeEntry {
    cube: Cube,
    dimensions: IndexMap<String, DimensionEntry>,
}

#[derive(Debug, Clone)]
struct DimensionEntry {
    dimension: Dimension,
    hierarchies: IndexMap<String, HierarchyEntry>,
}

#[derive(Debug, Clone)]
struct HierarchyEntry {
    hierarchy: Hierarchy,
    levels: Vec<LevelEntry>,
}

#[derive(Debug, Clone)]
struct LevelEntry {
    level: Level,
    properties: IndexMap<String, Property>,
    members: IndexMap<String, MemberEntry>,
    // set once a full listing of the level was cached; child fetches only
    // populate a level partially
    members_complete: bool,
    // ids a filtered listing asked for and did not get back
    absent: IndexSet<String>,
}

#[derive(Debug, Clone)]
struct MemberEntry {
    member: Member,
    properties_loaded: bool,
}

/// In-process store of the metadata fetched so far.
///
/// Every layer is keyed under its parent: schema, cube, dimension, hierarchy,
/// level, member. Lookups at a layer fail when an ancestor is missing rather
/// than reporting `false`, and inserts never overwrite what is already there.
/// Levels are stored in hierarchy order and addressed by position from the
/// outside; their string ids stay internal to the cache and the orchestrator.
#[derive(Debug, Default, Clone)]
pub struct MetadataCache {
    schemas: IndexMap<String, SchemaEntry>,
}

impl MetadataCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.schemas.clear();
    }

    // existence

    pub fn is_schema_in_cache(&self, schema: &str) -> bool {
        self.schemas.contains_key(schema)
    }

    pub fn is_cube_in_cache(&self, schema: &str, cube: &str) -> Result<bool, MetadataCacheError> {
        Ok(self.schema(schema)?.cubes.contains_key(cube))
    }

    pub fn is_dimension_in_cache(
        &self,
        schema: &str,
        cube: &str,
        dimension: &str,
    ) -> Result<bool, MetadataCacheError> {
        Ok(self
            .cube(schema, cube)?
            .dimensions
            .contains_key(dimension))
    }

    pub fn is_hierarchy_in_cache(
        &self,
        schema: &str,
        cube: &str,
        dimension: &str,
        hierarchy: &str,
    ) -> Result<bool, MetadataCacheError> {
        Ok(self
            .dimension(schema, cube, dimension)?
            .hierarchies
            .contains_key(hierarchy))
    }

    pub fn is_level_in_cache(
        &self,
        path: &HierarchyPath,
        index: usize,
    ) -> Result<bool, MetadataCacheError> {
        Ok(index < self.hierarchy(path)?.levels.len())
    }

    pub fn is_level_id_in_cache(
        &self,
        path: &HierarchyPath,
        level: &str,
    ) -> Result<bool, MetadataCacheError> {
        Ok(self
            .hierarchy(path)?
            .levels
            .iter()
            .any(|entry| entry.level.id == level))
    }

    pub fn is_member_in_cache(
        &self,
        path: &HierarchyPath,
        level_index: usize,
        member: &str,
    ) -> Result<bool, MetadataCacheError> {
        Ok(self.level(path, level_index)?.members.contains_key(member))
    }

    // inserts, first write wins

    pub fn cache_schema(&mut self, id: &str, caption: &str) {
        self.schemas
            .entry(id.to_string())
            .or_insert_with(|| SchemaEntry {
                schema: Schema {
                    id: id.to_string(),
                    caption: caption.to_string(),
                },
                cubes: IndexMap::new(),
            });
    }

    pub fn cache_cube(
        &mut self,
        schema: &str,
        id: &str,
        caption: &str,
        description: &str,
    ) -> Result<(), MetadataCacheError> {
        self.schema_mut(schema)?
            .cubes
            .entry(id.to_string())
            .or_insert_with(|| CubeEntry {
                cube: Cube {
                    id: id.to_string(),
                    caption: caption.to_string(),
                    description: description.to_string(),
                },
                dimensions: IndexMap::new(),
            });
        Ok(())
    }

    /// Caches a dimension; `dimension_type` must name one of the
    /// [`DimensionType`] variants.
    pub fn cache_dimension(
        &mut self,
        schema: &str,
        cube: &str,
        id: &str,
        dimension_type: &str,
        caption: &str,
        description: &str,
    ) -> Result<(), MetadataCacheError> {
        let dimension_type: DimensionType = dimension_type.parse()?;
        self.cube_mut(schema, cube)?
            .dimensions
            .entry(id.to_string())
            .or_insert_with(|| DimensionEntry {
                dimension: Dimension {
                    id: id.to_string(),
                    caption: caption.to_string(),
                    description: description.to_string(),
                    dimension_type,
                },
                hierarchies: IndexMap::new(),
            });
        Ok(())
    }

    pub fn cache_hierarchy(
        &mut self,
        path: &HierarchyPath,
        caption: &str,
        description: &str,
    ) -> Result<(), MetadataCacheError> {
        self.dimension_mut(&path.schema, &path.cube, &path.dimension)?
            .hierarchies
            .entry(path.hierarchy.clone())
            .or_insert_with(|| HierarchyEntry {
                hierarchy: Hierarchy {
                    id: path.hierarchy.clone(),
                    caption: caption.to_string(),
                    description: description.to_string(),
                },
                levels: Vec::new(),
            });
        Ok(())
    }

    /// Appends a level to the hierarchy and returns its index. A level id that
    /// is already cached keeps its position.
    pub fn cache_level(
        &mut self,
        path: &HierarchyPath,
        id: &str,
        caption: &str,
        description: &str,
    ) -> Result<usize, MetadataCacheError> {
        let levels = &mut self.hierarchy_mut(path)?.levels;
        if let Some(index) = levels.iter().position(|entry| entry.level.id == id) {
            return Ok(index);
        }

        let index = levels.len();
        levels.push(LevelEntry {
            level: Level {
                id: id.to_string(),
                caption: caption.to_string(),
                description: description.to_string(),
                index,
            },
            properties: IndexMap::new(),
            members: IndexMap::new(),
            members_complete: false,
            absent: IndexSet::new(),
        });
        Ok(index)
    }

    pub fn cache_property(
        &mut self,
        path: &HierarchyPath,
        level_index: usize,
        property: &str,
        property_type: &str,
        caption: &str,
        description: &str,
    ) -> Result<(), MetadataCacheError> {
        let property_type: PropertyType = property_type.parse()?;
        self.level_mut(path, level_index)?
            .properties
            .entry(property.to_string())
            .or_insert_with(|| Property {
                id: property.to_string(),
                caption: caption.to_string(),
                description: description.to_string(),
                property_type,
            });
        Ok(())
    }

    /// Caches a member of a level.
    ///
    /// An already cached member keeps its caption and description; property
    /// values and children it did not have yet are filled in.
    pub fn cache_member(
        &mut self,
        path: &HierarchyPath,
        level_index: usize,
        member: Member,
        with_properties: bool,
    ) -> Result<(), MetadataCacheError> {
        let level = self.level_mut(path, level_index)?;
        level.absent.shift_remove(&member.id);
        match level.members.get_mut(&member.id) {
            Some(entry) => {
                for (property, value) in member.properties {
                    entry.member.properties.entry(property).or_insert(value);
                }
                if entry.member.children.is_empty() {
                    entry.member.children = member.children;
                }
                entry.properties_loaded |= with_properties;
            }
            None => {
                level.members.insert(
                    member.id.clone(),
                    MemberEntry {
                        member,
                        properties_loaded: with_properties,
                    },
                );
            }
        }
        Ok(())
    }

    pub fn mark_members_complete(
        &mut self,
        path: &HierarchyPath,
        level_index: usize,
    ) -> Result<(), MetadataCacheError> {
        self.level_mut(path, level_index)?.members_complete = true;
        Ok(())
    }

    /// Records the listed ids that are not cached as missing from the level.
    pub fn mark_members_absent<'a, I>(
        &mut self,
        path: &HierarchyPath,
        level_index: usize,
        members: I,
    ) -> Result<(), MetadataCacheError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let level = self.level_mut(path, level_index)?;
        for id in members {
            if !level.members.contains_key(id) {
                level.absent.insert(id.to_string());
            }
        }
        Ok(())
    }

    /// Whether the level is known not to hold `member`: a filtered listing
    /// left it out, or the level is complete without it.
    pub fn is_member_absent(
        &self,
        path: &HierarchyPath,
        level_index: usize,
        member: &str,
    ) -> Result<bool, MetadataCacheError> {
        let level = self.level(path, level_index)?;
        if level.members.contains_key(member) {
            return Ok(false);
        }
        Ok(level.absent.contains(member) || level.members_complete)
    }

    pub fn are_members_complete(
        &self,
        path: &HierarchyPath,
        level_index: usize,
    ) -> Result<bool, MetadataCacheError> {
        let level = self.level(path, level_index)?;
        Ok(level.members_complete && !level.members.is_empty())
    }

    /// Whether every listed member is cached with its property values. An
    /// empty list reports `true`.
    pub fn are_properties_loaded<'a, I>(
        &self,
        path: &HierarchyPath,
        level_index: usize,
        members: I,
    ) -> Result<bool, MetadataCacheError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let level = self.level(path, level_index)?;
        Ok(members.into_iter().all(|id| {
            level
                .members
                .get(id)
                .map(|entry| entry.properties_loaded)
                .unwrap_or(false)
        }))
    }

    // reads

    pub fn get_schemas_from_cache(&self) -> IndexMap<String, String> {
        self.schemas
            .values()
            .map(|entry| (entry.schema.id.clone(), entry.schema.caption.clone()))
            .collect()
    }

    pub fn get_cubes_from_cache(
        &self,
        schema: &str,
    ) -> Result<IndexMap<String, String>, MetadataCacheError> {
        Ok(self
            .schema(schema)?
            .cubes
            .values()
            .map(|entry| (entry.cube.id.clone(), entry.cube.caption.clone()))
            .collect())
    }

    pub fn get_cube_from_cache(&self, schema: &str, cube: &str) -> Result<Cube, MetadataCacheError> {
        Ok(self.cube(schema, cube)?.cube.clone())
    }

    pub fn get_dimensions_from_cache(
        &self,
        schema: &str,
        cube: &str,
    ) -> Result<IndexMap<String, Dimension>, MetadataCacheError> {
        Ok(self
            .cube(schema, cube)?
            .dimensions
            .values()
            .map(|entry| (entry.dimension.id.clone(), entry.dimension.clone()))
            .collect())
    }

    pub fn get_hierarchies_from_cache(
        &self,
        schema: &str,
        cube: &str,
        dimension: &str,
    ) -> Result<IndexMap<String, String>, MetadataCacheError> {
        Ok(self
            .dimension(schema, cube, dimension)?
            .hierarchies
            .values()
            .map(|entry| (entry.hierarchy.id.clone(), entry.hierarchy.caption.clone()))
            .collect())
    }

    /// Level captions, root first.
    pub fn get_levels_from_cache(
        &self,
        path: &HierarchyPath,
    ) -> Result<Vec<String>, MetadataCacheError> {
        Ok(self
            .hierarchy(path)?
            .levels
            .iter()
            .map(|entry| entry.level.caption.clone())
            .collect())
    }

    pub fn get_level_from_cache(
        &self,
        path: &HierarchyPath,
        index: usize,
    ) -> Result<Level, MetadataCacheError> {
        Ok(self.level(path, index)?.level.clone())
    }

    pub fn get_level_id_from_index(
        &self,
        path: &HierarchyPath,
        index: usize,
    ) -> Result<String, MetadataCacheError> {
        Ok(self.level(path, index)?.level.id.clone())
    }

    pub fn get_level_index_from_id(
        &self,
        path: &HierarchyPath,
        level: &str,
    ) -> Result<usize, MetadataCacheError> {
        self.hierarchy(path)?
            .levels
            .iter()
            .position(|entry| entry.level.id == level)
            .ok_or_else(|| MetadataCacheError::LevelNotInCache(format!("{} in {}", level, path)))
    }

    pub fn get_properties_from_cache(
        &self,
        path: &HierarchyPath,
        level_index: usize,
    ) -> Result<IndexMap<String, Property>, MetadataCacheError> {
        Ok(self.level(path, level_index)?.properties.clone())
    }

    pub fn get_members_from_cache(
        &self,
        path: &HierarchyPath,
        level_index: usize,
    ) -> Result<Slice, MetadataCacheError> {
        Ok(self
            .level(path, level_index)?
            .members
            .values()
            .map(|entry| (entry.member.id.clone(), entry.member.clone()))
            .collect())
    }

    pub fn get_member_from_cache(
        &self,
        path: &HierarchyPath,
        level_index: usize,
        member: &str,
    ) -> Result<Option<Member>, MetadataCacheError> {
        Ok(self
            .level(path, level_index)?
            .members
            .get(member)
            .map(|entry| entry.member.clone()))
    }

    // ancestor chain

    fn schema(&self, schema: &str) -> Result<&SchemaEntry, MetadataCacheError> {
        self.schemas
            .get(schema)
            .ok_or_else(|| MetadataCacheError::SchemaNotInCache(schema.to_string()))
    }

    fn cube(&self, schema: &str, cube: &str) -> Result<&CubeEntry, MetadataCacheError> {
        self.schema(schema)?
            .cubes
            .get(cube)
            .ok_or_else(|| MetadataCacheError::CubeNotInCache(cube.to_string()))
    }

    fn dimension(
        &self,
        schema: &str,
        cube: &str,
        dimension: &str,
    ) -> Result<&DimensionEntry, MetadataCacheError> {
        self.cube(schema, cube)?
            .dimensions
            .get(dimension)
            .ok_or_else(|| MetadataCacheError::DimensionNotInCache(dimension.to_string()))
    }

    fn hierarchy(&self, path: &HierarchyPath) -> Result<&HierarchyEntry, MetadataCacheError> {
        self.dimension(&path.schema, &path.cube, &path.dimension)?
            .hierarchies
            .get(&path.hierarchy)
            .ok_or_else(|| MetadataCacheError::HierarchyNotInCache(path.hierarchy.clone()))
    }

    fn level(&self, path: &HierarchyPath, index: usize) -> Result<&LevelEntry, MetadataCacheError> {
        self.hierarchy(path)?.levels.get(index).ok_or_else(|| {
            MetadataCacheError::LevelNotInCache(format!("index {} in {}", index, path))
        })
    }

    fn schema_mut(&mut self, schema: &str) -> Result<&mut SchemaEntry, MetadataCacheError> {
        self.schemas
            .get_mut(schema)
            .ok_or_else(|| MetadataCacheError::SchemaNotInCache(schema.to_string()))
    }

    fn cube_mut(&mut self, schema: &str, cube: &str) -> Result<&mut CubeEntry, MetadataCacheError> {
        self.schema_mut(schema)?
            .cubes
            .get_mut(cube)
            .ok_or_else(|| MetadataCacheError::CubeNotInCache(cube.to_string()))
    }

    fn dimension_mut(
        &mut self,
        schema: &str,
        cube: &str,
        dimension: &str,
    ) -> Result<&mut DimensionEntry, MetadataCacheError> {
        self.cube_mut(schema, cube)?
            .dimensions
            .get_mut(dimension)
            .ok_or_else(|| MetadataCacheError::DimensionNotInCache(dimension.to_string()))
    }

    fn hierarchy_mut(
        &mut self,
        path: &HierarchyPath,
    ) -> Result<&mut HierarchyEntry, MetadataCacheError> {
        self.dimension_mut(&path.schema, &path.cube, &path.dimension)?
            .hierarchies
            .get_mut(&path.hierarchy)
            .ok_or_else(|| MetadataCacheError::HierarchyNotInCache(path.hierarchy.clone()))
    }

    fn level_mut(
        &mut self,
        path: &HierarchyPath,
        index: usize,
    ) -> Result<&mut LevelEntry, MetadataCacheError> {
        let path_text = path.to_string();
        self.hierarchy_mut(path)?.levels.get_mut(index).ok_or_else(|| {
            MetadataCacheError::LevelNotInCache(format!("index {} in {}", index, path_text))
        })
    }
}
