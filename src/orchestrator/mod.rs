pub mod geometry;

use crate::metadata::model::{
    Dimension, DimensionType, HierarchyPath, Member, Property, PropertyType, Slice,
};
use crate::metadata::{MetadataCache, MetadataCacheError};
use crate::query_api::{AggregateQuery, ApiStatus, ExploreRequest, PathSegment, QueryApi};
use futures::future::{BoxFuture, FutureExt, Shared};
use geometry::{wkt_to_geojson, GeometryError};
use indexmap::IndexMap;
use log::{debug, info};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryError {
    #[error("Query API not provided")]
    QueryApiNotProvided,

    #[error("Query API bad request: {0}")]
    BadRequest(String),

    #[error("Query API not supported: {0}")]
    NotSupported(String),

    #[error("Query API server error: {0}")]
    ServerError(String),

    #[error("Illegal API response: {0}")]
    IllegalApiResponse(String),

    #[error(transparent)]
    Cache(#[from] MetadataCacheError),

    #[error("No {dimension_type} dimension in cube {cube}")]
    NoSuchDimensionType {
        dimension_type: DimensionType,
        cube: String,
    },

    #[error("Measure hierarchy has no level: {0}")]
    MeasureHierarchyEmpty(String),

    #[error(transparent)]
    Geometry(#[from] GeometryError),
}

#[derive(Deserialize)]
struct EntityPayload {
    caption: String,
    #[serde(default)]
    description: String,
}

#[derive(Deserialize)]
struct DimensionPayload {
    caption: String,
    #[serde(default)]
    description: String,
    #[serde(rename = "type")]
    dimension_type: String,
}

#[derive(Deserialize)]
struct LevelPayload {
    id: String,
    caption: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    properties: IndexMap<String, PropertyPayload>,
}

#[derive(Deserialize)]
struct PropertyPayload {
    caption: String,
    #[serde(default)]
    description: String,
    #[serde(rename = "type")]
    property_type: String,
}

#[derive(Deserialize)]
struct MemberPayload {
    caption: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    properties: IndexMap<String, Value>,
    #[serde(default)]
    children: Vec<String>,
}

impl MemberPayload {
    fn into_member(self, id: String) -> Member {
        Member {
            id,
            caption: self.caption,
            description: self.description,
            properties: self.properties,
            children: self.children,
        }
    }
}

type PendingFetch = Shared<BoxFuture<'static, Result<Value, QueryError>>>;
type Populate = Box<dyn FnOnce(&mut MetadataCache, &Value) -> Result<(), QueryError> + Send>;

/// Fetch-if-absent bridge between a [`MetadataCache`] and a [`QueryApi`].
///
/// Every accessor first makes sure the ancestors of what it reads are cached,
/// then answers from the cache when it can and only calls
/// [`QueryApi::explore`] on a miss. Concurrent misses on the same request
/// share a single fetch, which validates the reply and populates the cache
/// once.
pub struct QueryOrchestrator {
    api: Option<Arc<dyn QueryApi>>,
    cache: Arc<Mutex<MetadataCache>>,
    in_flight: Mutex<HashMap<String, PendingFetch>>,
    query: Mutex<AggregateQuery>,
}

impl QueryOrchestrator {
    pub fn new(api: Arc<dyn QueryApi>, cache: MetadataCache) -> Self {
        QueryOrchestrator {
            api: Some(api),
            ..QueryOrchestrator::without_api(cache)
        }
    }

    /// Orchestrator serving cached metadata only; fetches fail with
    /// [`QueryError::QueryApiNotProvided`].
    pub fn without_api(cache: MetadataCache) -> Self {
        QueryOrchestrator {
            api: None,
            cache: Arc::new(Mutex::new(cache)),
            in_flight: Mutex::new(HashMap::new()),
            query: Mutex::new(AggregateQuery::default()),
        }
    }

    pub fn set_query_api(&mut self, api: Arc<dyn QueryApi>) {
        self.api = Some(api);
    }

    /// Runs `f` against the cache.
    pub fn with_cache<T>(&self, f: impl FnOnce(&MetadataCache) -> T) -> T {
        f(&lock(&self.cache))
    }

    pub fn clear_cache(&self) {
        info!("Clearing metadata cache");
        lock(&self.cache).clear();
    }

    pub async fn get_schemas(&self) -> Result<IndexMap<String, String>, QueryError> {
        let cached = self.with_cache(|cache| cache.get_schemas_from_cache());
        if !cached.is_empty() {
            return Ok(cached);
        }

        let populate: Populate = Box::new(|cache, data| {
            let schemas: IndexMap<String, EntityPayload> = decode(data)?;
            for (id, schema) in schemas {
                cache.cache_schema(&id, &schema.caption);
            }
            Ok(())
        });
        self.fetch(ExploreRequest::new(Vec::<String>::new()), populate)
            .await?;
        Ok(self.with_cache(|cache| cache.get_schemas_from_cache()))
    }

    pub async fn get_cubes(&self, schema: &str) -> Result<IndexMap<String, String>, QueryError> {
        self.ensure_schema(schema).await?;
        let cached = self.with_cache(|cache| cache.get_cubes_from_cache(schema))?;
        if !cached.is_empty() {
            return Ok(cached);
        }

        let owned_schema = schema.to_string();
        let populate: Populate = Box::new(move |cache, data| {
            let cubes: IndexMap<String, EntityPayload> = decode(data)?;
            for (id, cube) in cubes {
                cache.cache_cube(&owned_schema, &id, &cube.caption, &cube.description)?;
            }
            Ok(())
        });
        self.fetch(ExploreRequest::new([schema]), populate).await?;
        Ok(self.with_cache(|cache| cache.get_cubes_from_cache(schema))?)
    }

    /// Dimensions of a cube, the measure dimension excluded.
    pub async fn get_dimensions(
        &self,
        schema: &str,
        cube: &str,
    ) -> Result<IndexMap<String, Dimension>, QueryError> {
        let mut dimensions = self.load_dimensions(schema, cube).await?;
        dimensions.retain(|_, dimension| dimension.dimension_type != DimensionType::Measure);
        Ok(dimensions)
    }

    pub async fn get_measure_dimension(&self, schema: &str, cube: &str) -> Result<String, QueryError> {
        self.get_dimension_of_type(schema, cube, DimensionType::Measure)
            .await
    }

    pub async fn get_geo_dimension(&self, schema: &str, cube: &str) -> Result<String, QueryError> {
        self.get_dimension_of_type(schema, cube, DimensionType::Geometry)
            .await
    }

    pub async fn get_time_dimension(&self, schema: &str, cube: &str) -> Result<String, QueryError> {
        self.get_dimension_of_type(schema, cube, DimensionType::Time)
            .await
    }

    /// Id of the first dimension of the cube with the given type.
    pub async fn get_dimension_of_type(
        &self,
        schema: &str,
        cube: &str,
        dimension_type: DimensionType,
    ) -> Result<String, QueryError> {
        self.load_dimensions(schema, cube)
            .await?
            .values()
            .find(|dimension| dimension.dimension_type == dimension_type)
            .map(|dimension| dimension.id.clone())
            .ok_or_else(|| QueryError::NoSuchDimensionType {
                dimension_type,
                cube: cube.to_string(),
            })
    }

    /// Members of the single level of the measure dimension.
    pub async fn get_measures(&self, schema: &str, cube: &str) -> Result<Slice, QueryError> {
        let dimension = self.get_measure_dimension(schema, cube).await?;
        let hierarchies = self.get_hierarchies(schema, cube, &dimension).await?;
        let hierarchy = hierarchies
            .keys()
            .next()
            .ok_or_else(|| QueryError::MeasureHierarchyEmpty(dimension.clone()))?;

        let path = HierarchyPath::new(schema, cube, &dimension, hierarchy);
        if self.get_levels(&path).await?.is_empty() {
            return Err(QueryError::MeasureHierarchyEmpty(path.to_string()));
        }
        self.get_members(&path, 0, false).await
    }

    pub async fn get_hierarchies(
        &self,
        schema: &str,
        cube: &str,
        dimension: &str,
    ) -> Result<IndexMap<String, String>, QueryError> {
        self.ensure_dimension(schema, cube, dimension).await?;
        let cached =
            self.with_cache(|cache| cache.get_hierarchies_from_cache(schema, cube, dimension))?;
        if !cached.is_empty() {
            return Ok(cached);
        }

        let (owned_schema, owned_cube, owned_dimension) =
            (schema.to_string(), cube.to_string(), dimension.to_string());
        let populate: Populate = Box::new(move |cache, data| {
            let hierarchies: IndexMap<String, EntityPayload> = decode(data)?;
            for (id, hierarchy) in hierarchies {
                let path = HierarchyPath::new(&owned_schema, &owned_cube, &owned_dimension, id);
                cache.cache_hierarchy(&path, &hierarchy.caption, &hierarchy.description)?;
            }
            Ok(())
        });
        self.fetch(ExploreRequest::new([schema, cube, dimension]), populate)
            .await?;
        Ok(self.with_cache(|cache| cache.get_hierarchies_from_cache(schema, cube, dimension))?)
    }

    /// Level captions of a hierarchy, root first.
    pub async fn get_levels(&self, path: &HierarchyPath) -> Result<Vec<String>, QueryError> {
        self.ensure_hierarchy(path).await?;
        let cached = self.with_cache(|cache| cache.get_levels_from_cache(path))?;
        if !cached.is_empty() {
            return Ok(cached);
        }

        let owned_path = path.clone();
        let populate: Populate = Box::new(move |cache, data| {
            let levels: Vec<LevelPayload> = decode(data)?;
            // a rejected reply must leave the hierarchy without levels
            for property in levels.iter().flat_map(|level| level.properties.values()) {
                property.property_type.parse::<PropertyType>()?;
            }
            for level in levels {
                let index =
                    cache.cache_level(&owned_path, &level.id, &level.caption, &level.description)?;
                for (id, property) in level.properties {
                    cache.cache_property(
                        &owned_path,
                        index,
                        &id,
                        &property.property_type,
                        &property.caption,
                        &property.description,
                    )?;
                }
            }
            Ok(())
        });
        self.fetch(ExploreRequest::new(hierarchy_segments(path)), populate)
            .await?;
        Ok(self.with_cache(|cache| cache.get_levels_from_cache(path))?)
    }

    pub async fn get_properties(
        &self,
        path: &HierarchyPath,
        level_index: usize,
    ) -> Result<IndexMap<String, Property>, QueryError> {
        self.get_levels(path).await?;
        Ok(self.with_cache(|cache| cache.get_properties_from_cache(path, level_index))?)
    }

    /// Id of the first Geometry property declared on any level of the
    /// hierarchy.
    pub async fn get_geo_property(&self, path: &HierarchyPath) -> Result<Option<String>, QueryError> {
        let levels = self.get_levels(path).await?;
        for level_index in 0..levels.len() {
            let properties = self.get_properties(path, level_index).await?;
            if let Some(property) = properties
                .values()
                .find(|property| property.property_type == PropertyType::Geometry)
            {
                return Ok(Some(property.id.clone()));
            }
        }
        Ok(None)
    }

    /// All members of a level. With `with_properties`, Geometry property values
    /// of the returned members are GeoJSON.
    pub async fn get_members(
        &self,
        path: &HierarchyPath,
        level_index: usize,
        with_properties: bool,
    ) -> Result<Slice, QueryError> {
        self.get_levels(path).await?;
        let level = self.with_cache(|cache| cache.get_level_id_from_index(path, level_index))?;

        let cached = self.with_cache(|cache| -> Result<Option<Slice>, MetadataCacheError> {
            if !cache.are_members_complete(path, level_index)? {
                return Ok(None);
            }
            let members = cache.get_members_from_cache(path, level_index)?;
            let ids: Vec<String> = members.keys().cloned().collect();
            Ok(cached_subset(cache, path, level_index, &ids, with_properties)?)
        })?;

        let members = match cached {
            Some(members) => {
                debug!("Members of {} level {} served from cache", path, level_index);
                members
            }
            None => {
                let owned_path = path.clone();
                let populate: Populate = Box::new(move |cache, data| {
                    cache_members(cache, &owned_path, level_index, data, with_properties)?;
                    cache.mark_members_complete(&owned_path, level_index)?;
                    Ok(())
                });
                let request = ExploreRequest::new(hierarchy_segments(path))
                    .push(level)
                    .with_properties(with_properties);
                self.fetch(request, populate).await?;
                self.with_cache(|cache| cache.get_members_from_cache(path, level_index))?
            }
        };

        self.with_geometry(path, level_index, members, with_properties)
    }

    /// The listed members of a level, in the order given. Unknown ids are
    /// skipped; an id a previous listing did not return is not asked for
    /// again.
    pub async fn get_members_infos(
        &self,
        path: &HierarchyPath,
        level_index: usize,
        members: &[String],
        with_properties: bool,
    ) -> Result<Slice, QueryError> {
        self.get_levels(path).await?;
        let level = self.with_cache(|cache| cache.get_level_id_from_index(path, level_index))?;

        let wanted = self.with_cache(|cache| -> Result<Vec<String>, MetadataCacheError> {
            let mut wanted = Vec::with_capacity(members.len());
            for id in members {
                if !cache.is_member_absent(path, level_index, id)? {
                    wanted.push(id.clone());
                }
            }
            Ok(wanted)
        })?;
        if wanted.is_empty() {
            debug!("None of the requested members exist in {} level {}", path, level_index);
            return Ok(Slice::new());
        }

        let cached = self.with_cache(|cache| {
            cached_subset(cache, path, level_index, &wanted, with_properties)
        })?;
        let slice = match cached {
            Some(slice) => slice,
            None => {
                let owned_path = path.clone();
                let requested = wanted.clone();
                let populate: Populate = Box::new(move |cache, data| {
                    cache_members(cache, &owned_path, level_index, data, with_properties)?;
                    cache.mark_members_absent(
                        &owned_path,
                        level_index,
                        requested.iter().map(String::as_str),
                    )?;
                    Ok(())
                });
                let request = ExploreRequest::new(hierarchy_segments(path))
                    .push(level)
                    .push(wanted.clone())
                    .with_properties(with_properties);
                self.fetch(request, populate).await?;
                self.with_cache(|cache| read_subset(cache, path, level_index, members))?
            }
        };

        self.with_geometry(path, level_index, slice, with_properties)
    }

    /// Members `descending_level` levels below `parent` that descend from it.
    pub async fn get_member_children(
        &self,
        path: &HierarchyPath,
        level_index: usize,
        parent: &str,
        descending_level: usize,
        with_properties: bool,
    ) -> Result<Slice, QueryError> {
        self.get_levels(path).await?;
        let level = self.with_cache(|cache| cache.get_level_id_from_index(path, level_index))?;
        let target_index = level_index + descending_level.max(1);
        self.with_cache(|cache| cache.get_level_id_from_index(path, target_index))?;

        // only direct children are known from the parent's children list
        let cached = if descending_level <= 1 {
            self.with_cache(|cache| -> Result<Option<Slice>, MetadataCacheError> {
                let children = match cache.get_member_from_cache(path, level_index, parent)? {
                    Some(member) if !member.is_leaf() => member.children,
                    _ => return Ok(None),
                };
                cached_subset(cache, path, target_index, &children, with_properties)
            })?
        } else {
            None
        };

        let children = match cached {
            Some(children) => {
                debug!("Children of {} served from cache", parent);
                children
            }
            None => {
                let owned_path = path.clone();
                let owned_parent = parent.to_string();
                let populate: Populate = Box::new(move |cache, data| {
                    cache_members(cache, &owned_path, target_index, data, with_properties)?;
                    if target_index == level_index + 1 {
                        if let Some(member) =
                            cache.get_member_from_cache(&owned_path, level_index, &owned_parent)?
                        {
                            let children = object_keys(data);
                            cache.cache_member(
                                &owned_path,
                                level_index,
                                member.with_children(children),
                                false,
                            )?;
                        }
                    }
                    Ok(())
                });
                let request = ExploreRequest::new(hierarchy_segments(path))
                    .push(level)
                    .push(parent)
                    .descending(descending_level.max(1))
                    .with_properties(with_properties);
                let data = self.fetch(request, populate).await?;
                let ids = object_keys(&data);
                self.with_cache(|cache| read_subset(cache, path, target_index, &ids))?
            }
        };

        self.with_geometry(path, target_index, children, with_properties)
    }

    // aggregation query, forwarded to the API on execute

    pub fn drill(&self, cube: &str) {
        lock(&self.query).drill(cube);
    }

    pub fn push(&self, measure: &str) {
        lock(&self.query).push(measure);
    }

    pub fn pull(&self, measure: &str) {
        lock(&self.query).pull(measure);
    }

    pub fn slice(&self, hierarchy: &str, members: Vec<String>, range: bool) {
        lock(&self.query).slice(hierarchy, members, range);
    }

    pub fn dice(&self, hierarchies: Vec<String>) {
        lock(&self.query).dice(hierarchies);
    }

    pub fn project(&self, hierarchy: &str) {
        lock(&self.query).project(hierarchy);
    }

    pub fn filter(&self, hierarchy: &str, members: Vec<String>, range: bool) {
        lock(&self.query).filter(hierarchy, members, range);
    }

    pub fn clear_query(&self) {
        lock(&self.query).clear();
    }

    pub fn pending_query(&self) -> AggregateQuery {
        lock(&self.query).clone()
    }

    pub async fn execute(&self) -> Result<Value, QueryError> {
        let api = self.api()?;
        let query = self.pending_query();
        debug!("Executing aggregate query on cube {:?}", query.cube);
        validate_reply(api.execute(&query).await)
    }

    // ancestors

    async fn ensure_schema(&self, schema: &str) -> Result<(), QueryError> {
        if !self.with_cache(|cache| cache.is_schema_in_cache(schema)) {
            self.get_schemas().await?;
        }
        Ok(())
    }

    async fn ensure_cube(&self, schema: &str, cube: &str) -> Result<(), QueryError> {
        self.ensure_schema(schema).await?;
        if !self.with_cache(|cache| cache.is_cube_in_cache(schema, cube))? {
            self.get_cubes(schema).await?;
        }
        Ok(())
    }

    async fn ensure_dimension(
        &self,
        schema: &str,
        cube: &str,
        dimension: &str,
    ) -> Result<(), QueryError> {
        self.ensure_cube(schema, cube).await?;
        if !self.with_cache(|cache| cache.is_dimension_in_cache(schema, cube, dimension))? {
            self.load_dimensions(schema, cube).await?;
        }
        Ok(())
    }

    async fn ensure_hierarchy(&self, path: &HierarchyPath) -> Result<(), QueryError> {
        self.ensure_dimension(&path.schema, &path.cube, &path.dimension)
            .await?;
        let cached = self.with_cache(|cache| {
            cache.is_hierarchy_in_cache(&path.schema, &path.cube, &path.dimension, &path.hierarchy)
        })?;
        if !cached {
            self.get_hierarchies(&path.schema, &path.cube, &path.dimension)
                .await?;
        }
        Ok(())
    }

    async fn load_dimensions(
        &self,
        schema: &str,
        cube: &str,
    ) -> Result<IndexMap<String, Dimension>, QueryError> {
        self.ensure_cube(schema, cube).await?;
        let cached = self.with_cache(|cache| cache.get_dimensions_from_cache(schema, cube))?;
        if !cached.is_empty() {
            return Ok(cached);
        }

        let (owned_schema, owned_cube) = (schema.to_string(), cube.to_string());
        let populate: Populate = Box::new(move |cache, data| {
            let dimensions: IndexMap<String, DimensionPayload> = decode(data)?;
            for dimension in dimensions.values() {
                dimension.dimension_type.parse::<DimensionType>()?;
            }
            for (id, dimension) in dimensions {
                cache.cache_dimension(
                    &owned_schema,
                    &owned_cube,
                    &id,
                    &dimension.dimension_type,
                    &dimension.caption,
                    &dimension.description,
                )?;
            }
            Ok(())
        });
        self.fetch(ExploreRequest::new([schema, cube]), populate)
            .await?;
        Ok(self.with_cache(|cache| cache.get_dimensions_from_cache(schema, cube))?)
    }

    fn api(&self) -> Result<Arc<dyn QueryApi>, QueryError> {
        self.api.clone().ok_or(QueryError::QueryApiNotProvided)
    }

    /// Issues `request` unless the same request is already in flight, in which
    /// case the pending fetch is awaited instead. Returns the validated data.
    async fn fetch(&self, request: ExploreRequest, populate: Populate) -> Result<Value, QueryError> {
        let key = request.cache_key();
        let pending = {
            let mut in_flight = lock(&self.in_flight);
            match in_flight.get(&key) {
                Some(pending) => {
                    debug!("Joining in-flight fetch {}", key);
                    pending.clone()
                }
                None => {
                    let api = self.api()?;
                    let cache = Arc::clone(&self.cache);
                    debug!("Fetching {}", key);
                    let pending = async move {
                        let data = validate_reply(api.explore(&request).await)?;
                        populate_cache(&cache, populate, &data)?;
                        Ok(data)
                    }
                    .boxed()
                    .shared();
                    in_flight.insert(key.clone(), pending.clone());
                    pending
                }
            }
        };

        let result = pending.clone().await;

        let mut in_flight = lock(&self.in_flight);
        if in_flight
            .get(&key)
            .is_some_and(|current| current.ptr_eq(&pending))
        {
            in_flight.remove(&key);
        }
        result
    }

    fn with_geometry(
        &self,
        path: &HierarchyPath,
        level_index: usize,
        mut members: Slice,
        with_properties: bool,
    ) -> Result<Slice, QueryError> {
        if !with_properties {
            return Ok(members);
        }

        let geometry: Vec<String> = self
            .with_cache(|cache| cache.get_properties_from_cache(path, level_index))?
            .into_values()
            .filter(|property| property.property_type == PropertyType::Geometry)
            .map(|property| property.id)
            .collect();

        for member in members.values_mut() {
            for property in &geometry {
                if let Some(value) = member.properties.get_mut(property) {
                    if value.is_null() {
                        continue;
                    }
                    let converted = wkt_to_geojson(value)?;
                    *value = converted;
                }
            }
        }
        Ok(members)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn populate_cache(
    cache: &Mutex<MetadataCache>,
    populate: Populate,
    data: &Value,
) -> Result<(), QueryError> {
    populate(&mut lock(cache), data)
}

fn decode<T: DeserializeOwned>(data: &Value) -> Result<T, QueryError> {
    T::deserialize(data).map_err(|e| QueryError::IllegalApiResponse(e.to_string()))
}

fn object_keys(data: &Value) -> Vec<String> {
    data.as_object()
        .map(|object| object.keys().cloned().collect())
        .unwrap_or_default()
}

fn hierarchy_segments(path: &HierarchyPath) -> Vec<PathSegment> {
    vec![
        path.schema.as_str().into(),
        path.cube.as_str().into(),
        path.dimension.as_str().into(),
        path.hierarchy.as_str().into(),
    ]
}

fn cache_members(
    cache: &mut MetadataCache,
    path: &HierarchyPath,
    level_index: usize,
    data: &Value,
    with_properties: bool,
) -> Result<(), QueryError> {
    let members: IndexMap<String, MemberPayload> = decode(data)?;
    for (id, member) in members {
        cache.cache_member(path, level_index, member.into_member(id), with_properties)?;
    }
    Ok(())
}

/// The listed members when all of them are cached (with their property values
/// if requested), `None` otherwise. An empty list is never a hit.
fn cached_subset(
    cache: &MetadataCache,
    path: &HierarchyPath,
    level_index: usize,
    ids: &[String],
    with_properties: bool,
) -> Result<Option<Slice>, MetadataCacheError> {
    if ids.is_empty() {
        return Ok(None);
    }
    let slice = read_subset(cache, path, level_index, ids)?;
    if slice.len() != ids.len() {
        return Ok(None);
    }
    if with_properties
        && !cache.are_properties_loaded(path, level_index, ids.iter().map(String::as_str))?
    {
        return Ok(None);
    }
    Ok(Some(slice))
}

fn read_subset(
    cache: &MetadataCache,
    path: &HierarchyPath,
    level_index: usize,
    ids: &[String],
) -> Result<Slice, MetadataCacheError> {
    let mut slice = Slice::new();
    for id in ids {
        if let Some(member) = cache.get_member_from_cache(path, level_index, id)? {
            slice.insert(id.clone(), member);
        }
    }
    Ok(slice)
}

fn validate_reply(reply: Value) -> Result<Value, QueryError> {
    let envelope = match reply {
        Value::Object(envelope) => envelope,
        other => {
            return Err(QueryError::IllegalApiResponse(format!(
                "Reply is not an object: {}",
                other
            )))
        }
    };
    let status = envelope
        .get("error")
        .ok_or_else(|| QueryError::IllegalApiResponse("Reply has no error field".to_string()))?;
    let status: ApiStatus = ApiStatus::deserialize(status)
        .map_err(|_| QueryError::IllegalApiResponse(format!("Unknown reply status: {}", status)))?;
    let data = envelope
        .get("data")
        .cloned()
        .ok_or_else(|| QueryError::IllegalApiResponse("Reply has no data field".to_string()))?;

    match status {
        ApiStatus::Ok => Ok(data),
        ApiStatus::BadRequest => Err(QueryError::BadRequest(message(&data))),
        ApiStatus::NotSupported => Err(QueryError::NotSupported(message(&data))),
        ApiStatus::ServerError => Err(QueryError::ServerError(message(&data))),
    }
}

fn message(data: &Value) -> String {
    data.as_str()
        .map(str::to_string)
        .unwrap_or_else(|| data.to_string())
}

#[cfg(test)]
mod test {
    use super::{QueryError, QueryOrchestrator};
    use crate::metadata::model::{DimensionType, HierarchyPath, Member};
    use crate::metadata::{MetadataCache, MetadataCacheError};
    use crate::query_api::local_store::LocalQueryApi;
    use crate::query_api::{AggregateQuery, ExploreRequest, QueryApi};
    use async_trait::async_trait;
    use rstest::*;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// Local API counting explore calls, optionally answering slowly.
    struct CountingApi {
        inner: LocalQueryApi,
        explores: AtomicUsize,
        delay: Option<Duration>,
    }

    impl CountingApi {
        fn new() -> Self {
            CountingApi {
                inner: LocalQueryApi::mock(),
                explores: AtomicUsize::new(0),
                delay: None,
            }
        }

        fn slow() -> Self {
            CountingApi {
                delay: Some(Duration::from_millis(20)),
                ..CountingApi::new()
            }
        }

        fn explores(&self) -> usize {
            self.explores.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl QueryApi for CountingApi {
        async fn explore(&self, request: &ExploreRequest) -> Value {
            self.explores.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.inner.explore(request).await
        }

        async fn execute(&self, query: &AggregateQuery) -> Value {
            self.inner.execute(query).await
        }
    }

    struct FixedReplyApi(Value);

    #[async_trait]
    impl QueryApi for FixedReplyApi {
        async fn explore(&self, _request: &ExploreRequest) -> Value {
            self.0.clone()
        }

        async fn execute(&self, _query: &AggregateQuery) -> Value {
            self.0.clone()
        }
    }

    #[fixture]
    fn api() -> Arc<CountingApi> {
        Arc::new(CountingApi::new())
    }

    fn orchestrator(api: &Arc<CountingApi>) -> QueryOrchestrator {
        QueryOrchestrator::new(api.clone(), MetadataCache::new())
    }

    fn zone() -> HierarchyPath {
        HierarchyPath::new("Olap", "C", "Zone", "Zone.Nuts")
    }

    fn keys(slice: &crate::metadata::model::Slice) -> Vec<&str> {
        slice.keys().map(String::as_str).collect()
    }

    #[rstest]
    #[tokio::test]
    async fn test_dimensions_match_cache_without_measure(api: Arc<CountingApi>) {
        let orchestrator = orchestrator(&api);
        let fetched = orchestrator.get_dimensions("Olap", "C").await.unwrap();
        let explores = api.explores();

        let mut cached = orchestrator
            .with_cache(|cache| cache.get_dimensions_from_cache("Olap", "C"))
            .unwrap();
        assert!(cached.contains_key("Measures"));
        cached.retain(|_, dimension| dimension.dimension_type != DimensionType::Measure);
        assert_eq!(fetched, cached);

        let again = orchestrator.get_dimensions("Olap", "C").await.unwrap();
        assert_eq!(again, fetched);
        assert_eq!(api.explores(), explores);
    }

    #[rstest]
    #[tokio::test]
    async fn test_ancestors_are_fetched_first(api: Arc<CountingApi>) {
        let orchestrator = orchestrator(&api);
        let levels = orchestrator.get_levels(&zone()).await.unwrap();
        assert_eq!(levels, vec!["Country".to_string(), "Region".to_string()]);
        // schemas, cubes, dimensions, hierarchies, levels
        assert_eq!(api.explores(), 5);

        orchestrator.get_levels(&zone()).await.unwrap();
        assert_eq!(api.explores(), 5);
    }

    #[rstest]
    #[tokio::test]
    async fn test_unknown_ancestor_surfaces_cache_error(api: Arc<CountingApi>) {
        let orchestrator = orchestrator(&api);
        let result = orchestrator.get_cubes("NoSchema").await;
        assert_eq!(
            result,
            Err(QueryError::Cache(MetadataCacheError::SchemaNotInCache(
                "NoSchema".to_string()
            )))
        );
    }

    #[rstest]
    #[case::bad_request(json!({"error": "BAD_REQUEST", "data": "nope"}), QueryError::BadRequest("nope".to_string()))]
    #[case::not_supported(json!({"error": "NOT_SUPPORTED", "data": "nope"}), QueryError::NotSupported("nope".to_string()))]
    #[case::server_error(json!({"error": "SERVER_ERROR", "data": "down"}), QueryError::ServerError("down".to_string()))]
    #[case::missing_data(json!({"error": "OK"}), QueryError::IllegalApiResponse("Reply has no data field".to_string()))]
    #[case::missing_error(json!({"data": {}}), QueryError::IllegalApiResponse("Reply has no error field".to_string()))]
    #[tokio::test]
    async fn test_reply_validation(#[case] reply: Value, #[case] expected: QueryError) {
        let orchestrator =
            QueryOrchestrator::new(Arc::new(FixedReplyApi(reply)), MetadataCache::new());
        assert_eq!(orchestrator.get_schemas().await, Err(expected));
        assert!(orchestrator
            .with_cache(|cache| cache.get_schemas_from_cache())
            .is_empty());
    }

    #[rstest]
    #[case::unknown_status(json!({"error": "TEAPOT", "data": null}))]
    #[case::not_an_object(json!(["OK"]))]
    #[case::malformed_data(json!({"error": "OK", "data": ["Olap"]}))]
    #[tokio::test]
    async fn test_illegal_replies(#[case] reply: Value) {
        let orchestrator =
            QueryOrchestrator::new(Arc::new(FixedReplyApi(reply)), MetadataCache::new());
        assert!(matches!(
            orchestrator.get_schemas().await,
            Err(QueryError::IllegalApiResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_illegal_dimension_type_in_reply() {
        let api = LocalQueryApi::from_json(
            r#"{ "schemas": { "S": { "caption": "S", "cubes": { "K": { "caption": "K",
                "dimensions": { "D": { "caption": "D", "type": "Spatial" } } } } } } }"#,
        )
        .unwrap();
        let orchestrator = QueryOrchestrator::new(Arc::new(api), MetadataCache::new());
        assert_eq!(
            orchestrator.get_dimensions("S", "K").await,
            Err(QueryError::Cache(MetadataCacheError::IllegalDimensionType(
                "Spatial".to_string()
            )))
        );
    }

    #[tokio::test]
    async fn test_rejected_dimensions_are_not_cached() {
        let api = LocalQueryApi::from_json(
            r#"{ "schemas": { "S": { "caption": "S", "cubes": { "K": { "caption": "K",
                "dimensions": {
                    "M": { "caption": "M", "type": "Measure" },
                    "Z": { "caption": "Z", "type": "Geometry" },
                    "D": { "caption": "D", "type": "Spatial" },
                    "T": { "caption": "T", "type": "Time" }
                } } } } } }"#,
        )
        .unwrap();
        let orchestrator = QueryOrchestrator::new(Arc::new(api), MetadataCache::new());
        let expected = Err(QueryError::Cache(MetadataCacheError::IllegalDimensionType(
            "Spatial".to_string(),
        )));

        assert_eq!(orchestrator.get_dimensions("S", "K").await, expected);
        assert_eq!(orchestrator.get_dimensions("S", "K").await, expected);
        assert!(matches!(
            orchestrator.get_time_dimension("S", "K").await,
            Err(QueryError::Cache(MetadataCacheError::IllegalDimensionType(_)))
        ));
        assert!(orchestrator
            .with_cache(|cache| cache.get_dimensions_from_cache("S", "K"))
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_rejected_levels_are_not_cached() {
        let api = LocalQueryApi::from_json(
            r#"{ "schemas": { "S": { "caption": "S", "cubes": { "K": { "caption": "K",
                "dimensions": { "D": { "caption": "D", "type": "Standard",
                    "hierarchies": { "H": { "caption": "H", "levels": [
                        { "id": "l0", "caption": "L0",
                          "properties": { "area": { "caption": "Area", "type": "Number" } } },
                        { "id": "l1", "caption": "L1" }
                    ] } } } } } } } } }"#,
        )
        .unwrap();
        let orchestrator = QueryOrchestrator::new(Arc::new(api), MetadataCache::new());
        let path = HierarchyPath::new("S", "K", "D", "H");
        let expected = Err(QueryError::Cache(MetadataCacheError::IllegalPropertyType(
            "Number".to_string(),
        )));

        assert_eq!(orchestrator.get_levels(&path).await, expected);
        assert_eq!(orchestrator.get_levels(&path).await, expected);
        assert!(orchestrator
            .with_cache(|cache| cache.get_levels_from_cache(&path))
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_query_api_not_provided() {
        let mut cache = MetadataCache::new();
        cache.cache_schema("Olap", "Olap schema");
        let orchestrator = QueryOrchestrator::without_api(cache);

        assert_eq!(orchestrator.get_schemas().await.unwrap()["Olap"], "Olap schema");
        assert_eq!(
            orchestrator.get_cubes("Olap").await,
            Err(QueryError::QueryApiNotProvided)
        );
    }

    #[rstest]
    #[tokio::test]
    async fn test_typed_dimensions(api: Arc<CountingApi>) {
        let orchestrator = orchestrator(&api);
        assert_eq!(orchestrator.get_measure_dimension("Olap", "C").await.unwrap(), "Measures");
        assert_eq!(orchestrator.get_geo_dimension("Olap", "C").await.unwrap(), "Zone");
        assert_eq!(orchestrator.get_time_dimension("Olap", "C").await.unwrap(), "Time");
    }

    #[tokio::test]
    async fn test_missing_dimension_type() {
        let api = LocalQueryApi::from_json(
            r#"{ "schemas": { "S": { "caption": "S", "cubes": { "K": { "caption": "K",
                "dimensions": { "M": { "caption": "M", "type": "Measure" } } } } } } }"#,
        )
        .unwrap();
        let orchestrator = QueryOrchestrator::new(Arc::new(api), MetadataCache::new());
        assert_eq!(
            orchestrator.get_time_dimension("S", "K").await,
            Err(QueryError::NoSuchDimensionType {
                dimension_type: DimensionType::Time,
                cube: "K".to_string(),
            })
        );
        assert!(matches!(
            orchestrator.get_measures("S", "K").await,
            Err(QueryError::MeasureHierarchyEmpty(_))
        ));
    }

    #[rstest]
    #[tokio::test]
    async fn test_measures(api: Arc<CountingApi>) {
        let orchestrator = orchestrator(&api);
        let measures = orchestrator.get_measures("Olap", "C").await.unwrap();
        assert_eq!(keys(&measures), vec!["rate", "count"]);
        assert_eq!(measures["rate"].caption, "Unemployment rate");
    }

    #[rstest]
    #[tokio::test]
    async fn test_geo_property(api: Arc<CountingApi>) {
        let orchestrator = orchestrator(&api);
        assert_eq!(
            orchestrator.get_geo_property(&zone()).await.unwrap(),
            Some("geom".to_string())
        );
        let time = HierarchyPath::new("Olap", "C", "Time", "Time.Calendar");
        assert_eq!(orchestrator.get_geo_property(&time).await.unwrap(), None);
        assert_eq!(orchestrator.get_properties(&zone(), 0).await.unwrap().len(), 2);
    }

    #[rstest]
    #[tokio::test]
    async fn test_geometry_is_converted_but_not_cached(api: Arc<CountingApi>) {
        let orchestrator = orchestrator(&api);
        let members = orchestrator.get_members(&zone(), 0, true).await.unwrap();
        assert_eq!(keys(&members), vec!["BE", "DE", "NL", "LU", "UK"]);
        assert_eq!(members["DE"].properties["geom"]["type"], "Point");
        assert_eq!(members["BE"].properties["geom"]["type"], "Polygon");
        assert_eq!(members["BE"].properties["iso"], "BEL");

        let cached = orchestrator
            .with_cache(|cache| cache.get_member_from_cache(&zone(), 0, "DE"))
            .unwrap()
            .unwrap();
        assert_eq!(cached.properties["geom"], json!("POINT(10.45 51.17)"));

        let explores = api.explores();
        let again = orchestrator.get_members(&zone(), 0, true).await.unwrap();
        assert_eq!(api.explores(), explores);
        assert_eq!(again["DE"].properties["geom"]["type"], "Point");
    }

    #[rstest]
    #[tokio::test]
    async fn test_properties_refetched_when_missing(api: Arc<CountingApi>) {
        let orchestrator = orchestrator(&api);
        let plain = orchestrator.get_members(&zone(), 0, false).await.unwrap();
        assert!(plain["BE"].properties.is_empty());
        let explores = api.explores();

        orchestrator.get_members(&zone(), 0, false).await.unwrap();
        assert_eq!(api.explores(), explores);

        let with_properties = orchestrator.get_members(&zone(), 0, true).await.unwrap();
        assert_eq!(api.explores(), explores + 1);
        assert_eq!(with_properties["BE"].properties["geom"]["type"], "Polygon");
    }

    #[rstest]
    #[tokio::test]
    async fn test_children_and_partial_levels(api: Arc<CountingApi>) {
        let orchestrator = orchestrator(&api);
        orchestrator.get_members(&zone(), 0, false).await.unwrap();

        let children = orchestrator
            .get_member_children(&zone(), 0, "BE", 1, false)
            .await
            .unwrap();
        assert_eq!(keys(&children), vec!["BE1", "BE2", "BE3"]);

        let explores = api.explores();
        let again = orchestrator
            .get_member_children(&zone(), 0, "BE", 1, false)
            .await
            .unwrap();
        assert_eq!(again, children);
        assert_eq!(api.explores(), explores);

        // the region level only holds BE's children so far
        let regions = orchestrator.get_members(&zone(), 1, false).await.unwrap();
        assert_eq!(regions.len(), 10);
        assert_eq!(api.explores(), explores + 1);
    }

    #[rstest]
    #[tokio::test]
    async fn test_children_of_leaf_level(api: Arc<CountingApi>) {
        let orchestrator = orchestrator(&api);
        let result = orchestrator
            .get_member_children(&zone(), 1, "BE1", 1, false)
            .await;
        assert!(matches!(
            result,
            Err(QueryError::Cache(MetadataCacheError::LevelNotInCache(_)))
        ));
    }

    #[rstest]
    #[tokio::test]
    async fn test_members_infos(api: Arc<CountingApi>) {
        let orchestrator = orchestrator(&api);
        let wanted = vec!["UK".to_string(), "BE".to_string(), "XX".to_string()];
        let members = orchestrator
            .get_members_infos(&zone(), 0, &wanted, false)
            .await
            .unwrap();
        assert_eq!(keys(&members), vec!["UK", "BE"]);

        let known = vec!["UK".to_string(), "BE".to_string()];
        let explores = api.explores();
        orchestrator
            .get_members_infos(&zone(), 0, &known, false)
            .await
            .unwrap();
        assert_eq!(api.explores(), explores);

        // XX was left out of the first reply
        let again = orchestrator
            .get_members_infos(&zone(), 0, &wanted, false)
            .await
            .unwrap();
        assert_eq!(keys(&again), vec!["UK", "BE"]);
        let missing = orchestrator
            .get_members_infos(&zone(), 0, &["XX".to_string()], false)
            .await
            .unwrap();
        assert!(missing.is_empty());
        assert_eq!(api.explores(), explores);
    }

    #[test_log::test(tokio::test)]
    async fn test_listings_with_and_without_properties_fetch_separately() {
        let api = Arc::new(CountingApi::slow());
        let orchestrator = QueryOrchestrator::new(api.clone(), MetadataCache::new());
        orchestrator.get_levels(&zone()).await.unwrap();
        let explores = api.explores();

        let (zone_a, zone_b) = (zone(), zone());
        let (plain, with_properties) = tokio::join!(
            orchestrator.get_members(&zone_a, 0, false),
            orchestrator.get_members(&zone_b, 0, true)
        );
        assert_eq!(plain.unwrap().len(), 5);
        let with_properties = with_properties.unwrap();
        assert_eq!(with_properties["DE"].properties["geom"]["type"], "Point");
        assert_eq!(api.explores(), explores + 2);
        assert_eq!(
            orchestrator.with_cache(|cache| cache.are_properties_loaded(
                &zone(),
                0,
                ["BE", "DE", "NL", "LU", "UK"]
            )),
            Ok(true)
        );
    }

    #[test_log::test(tokio::test)]
    async fn test_concurrent_fetches_are_deduplicated() {
        let api = Arc::new(CountingApi::slow());
        let orchestrator = QueryOrchestrator::new(api.clone(), MetadataCache::new());

        let (first, second) = tokio::join!(orchestrator.get_schemas(), orchestrator.get_schemas());
        assert_eq!(first.unwrap(), second.unwrap());
        assert_eq!(api.explores(), 1);
    }

    #[rstest]
    #[tokio::test]
    async fn test_clear_cache(api: Arc<CountingApi>) {
        let orchestrator = orchestrator(&api);
        orchestrator.get_schemas().await.unwrap();
        orchestrator.clear_cache();
        assert!(orchestrator
            .with_cache(|cache| cache.get_schemas_from_cache())
            .is_empty());
        orchestrator.get_schemas().await.unwrap();
        assert_eq!(api.explores(), 2);
    }

    #[rstest]
    #[tokio::test]
    async fn test_aggregate_query_forwarding(api: Arc<CountingApi>) {
        let orchestrator = orchestrator(&api);
        orchestrator.drill("C");
        orchestrator.push("rate");
        orchestrator.slice("Zone.Nuts", vec!["BE".to_string()], false);
        orchestrator.project("Zone.Nuts");
        assert_eq!(orchestrator.pending_query().measures, vec!["rate".to_string()]);

        assert!(matches!(
            orchestrator.execute().await,
            Err(QueryError::NotSupported(_))
        ));

        orchestrator.clear_query();
        assert_eq!(orchestrator.pending_query(), AggregateQuery::default());
    }

    #[rstest]
    #[tokio::test]
    async fn test_cached_members_without_children_are_leaves(api: Arc<CountingApi>) {
        let orchestrator = orchestrator(&api);
        let regions = orchestrator.get_members(&zone(), 1, false).await.unwrap();
        assert!(regions.values().all(Member::is_leaf));
    }
}
