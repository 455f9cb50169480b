use super::{reply, ApiStatus, ExploreRequest, Granularity, PathSegment};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Complete metadata tree of a backend, as stored in a catalog document.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Catalog {
    pub schemas: IndexMap<String, CatalogSchema>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CatalogSchema {
    pub caption: String,
    #[serde(default)]
    pub cubes: IndexMap<String, CatalogCube>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CatalogCube {
    pub caption: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub dimensions: IndexMap<String, CatalogDimension>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CatalogDimension {
    pub caption: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub dimension_type: String,
    #[serde(default)]
    pub hierarchies: IndexMap<String, CatalogHierarchy>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CatalogHierarchy {
    pub caption: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub levels: Vec<CatalogLevel>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CatalogLevel {
    pub id: String,
    pub caption: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub properties: IndexMap<String, CatalogProperty>,
    #[serde(default)]
    pub members: IndexMap<String, CatalogMember>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CatalogProperty {
    pub caption: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub property_type: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CatalogMember {
    pub caption: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub properties: IndexMap<String, Value>,
    #[serde(default)]
    pub children: Vec<String>,
}

impl Catalog {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Answers an explore request with a `{ error, data }` envelope.
    pub fn explore(&self, request: &ExploreRequest) -> Value {
        match self.explore_data(request) {
            Ok(data) => reply(ApiStatus::Ok, data),
            Err(message) => reply(ApiStatus::BadRequest, Value::String(message)),
        }
    }

    fn explore_data(&self, request: &ExploreRequest) -> Result<Value, String> {
        let granularity = request
            .granularity()
            .ok_or_else(|| format!("Invalid explore path: {:?}", request.path))?;
        let ids: Vec<&str> = request
            .path
            .iter()
            .filter_map(|segment| match segment {
                PathSegment::Id(id) => Some(id.as_str()),
                PathSegment::Ids(_) => None,
            })
            .collect();

        if granularity == Granularity::Schemas {
            return Ok(self
                .schemas
                .iter()
                .map(|(id, schema)| (id.clone(), json!({ "caption": schema.caption })))
                .collect::<Map<_, _>>()
                .into());
        }

        let schema = self
            .schemas
            .get(ids[0])
            .ok_or_else(|| format!("Unknown schema: {}", ids[0]))?;
        if granularity == Granularity::Cubes {
            return Ok(schema
                .cubes
                .iter()
                .map(|(id, cube)| {
                    let info = json!({ "caption": cube.caption, "description": cube.description });
                    (id.clone(), info)
                })
                .collect::<Map<_, _>>()
                .into());
        }

        let cube = schema
            .cubes
            .get(ids[1])
            .ok_or_else(|| format!("Unknown cube: {}", ids[1]))?;
        if granularity == Granularity::Dimensions {
            return Ok(cube
                .dimensions
                .iter()
                .map(|(id, dimension)| {
                    let info = json!({
                        "caption": dimension.caption,
                        "description": dimension.description,
                        "type": dimension.dimension_type,
                    });
                    (id.clone(), info)
                })
                .collect::<Map<_, _>>()
                .into());
        }

        let dimension = cube
            .dimensions
            .get(ids[2])
            .ok_or_else(|| format!("Unknown dimension: {}", ids[2]))?;
        if granularity == Granularity::Hierarchies {
            return Ok(dimension
                .hierarchies
                .iter()
                .map(|(id, hierarchy)| {
                    let info = json!({
                        "caption": hierarchy.caption,
                        "description": hierarchy.description,
                    });
                    (id.clone(), info)
                })
                .collect::<Map<_, _>>()
                .into());
        }

        let hierarchy = dimension
            .hierarchies
            .get(ids[3])
            .ok_or_else(|| format!("Unknown hierarchy: {}", ids[3]))?;
        if granularity == Granularity::Levels {
            return Ok(Value::Array(
                hierarchy.levels.iter().map(level_info).collect(),
            ));
        }

        let level_index = hierarchy
            .levels
            .iter()
            .position(|level| level.id == ids[4])
            .ok_or_else(|| format!("Unknown level: {}", ids[4]))?;
        let level = &hierarchy.levels[level_index];

        match (granularity, request.path.get(5)) {
            (Granularity::Members, _) => Ok(members_info(
                level.members.iter(),
                request.with_properties,
            )),
            (Granularity::FilteredMembers, Some(PathSegment::Ids(wanted))) => Ok(members_info(
                level
                    .members
                    .iter()
                    .filter(|(id, _)| wanted.contains(*id)),
                request.with_properties,
            )),
            (Granularity::Children, Some(PathSegment::Id(parent))) => {
                if !level.members.contains_key(parent) {
                    return Err(format!("Unknown member: {}", parent));
                }
                let target_index = level_index + request.descending_level;
                let target = hierarchy
                    .levels
                    .get(target_index)
                    .filter(|_| request.descending_level > 0)
                    .ok_or_else(|| format!("No level {} below {}", request.descending_level, level.id))?;

                let mut frontier = vec![parent.clone()];
                for depth in level_index..target_index {
                    let current = &hierarchy.levels[depth];
                    frontier = frontier
                        .iter()
                        .filter_map(|id| current.members.get(id))
                        .flat_map(|member| member.children.iter().cloned())
                        .collect();
                }

                Ok(members_info(
                    target
                        .members
                        .iter()
                        .filter(|(id, _)| frontier.contains(*id)),
                    request.with_properties,
                ))
            }
            _ => Err(format!("Invalid explore path: {:?}", request.path)),
        }
    }
}

fn level_info(level: &CatalogLevel) -> Value {
    let properties: Map<String, Value> = level
        .properties
        .iter()
        .map(|(id, property)| {
            let info = json!({
                "caption": property.caption,
                "description": property.description,
                "type": property.property_type,
            });
            (id.clone(), info)
        })
        .collect();
    json!({
        "id": level.id,
        "caption": level.caption,
        "description": level.description,
        "properties": properties,
    })
}

fn members_info<'a, I>(members: I, with_properties: bool) -> Value
where
    I: Iterator<Item = (&'a String, &'a CatalogMember)>,
{
    members
        .map(|(id, member)| {
            let mut info = json!({
                "caption": member.caption,
                "description": member.description,
                "children": member.children,
            });
            if with_properties {
                info["properties"] = json!(member.properties);
            }
            (id.clone(), info)
        })
        .collect::<Map<_, _>>()
        .into()
}

#[cfg(test)]
mod test {
    use super::super::local_store::LocalQueryApi;
    use super::super::ExploreRequest;
    use rstest::*;
    use serde_json::Value;

    fn keys(reply: &Value) -> Vec<String> {
        reply["data"]
            .as_object()
            .map(|data| data.keys().cloned().collect())
            .unwrap_or_default()
    }

    #[rstest]
    fn test_explore_layers() {
        let catalog = LocalQueryApi::mock().catalog().clone();

        let schemas = catalog.explore(&ExploreRequest::new(Vec::<String>::new()));
        assert_eq!(schemas["error"], "OK");
        assert_eq!(keys(&schemas), vec!["Olap".to_string()]);

        let dimensions = catalog.explore(&ExploreRequest::new(["Olap", "C"]));
        assert_eq!(dimensions["data"]["Zone"]["type"], "Geometry");

        let levels = catalog.explore(&ExploreRequest::new(["Olap", "C", "Zone", "Zone.Nuts"]));
        assert_eq!(levels["data"][0]["id"], "nuts0");
        assert_eq!(levels["data"][1]["id"], "nuts1");
        assert_eq!(levels["data"][0]["properties"]["geom"]["type"], "Geometry");
    }

    #[rstest]
    fn test_explore_members_and_children() {
        let catalog = LocalQueryApi::mock().catalog().clone();
        let path = ["Olap", "C", "Zone", "Zone.Nuts", "nuts0"];

        let members = catalog.explore(&ExploreRequest::new(path));
        assert_eq!(keys(&members), vec!["BE", "DE", "NL", "LU", "UK"]);
        assert!(members["data"]["BE"].get("properties").is_none());

        let with_properties = catalog.explore(&ExploreRequest::new(path).with_properties(true));
        assert!(with_properties["data"]["BE"]["properties"]["geom"].is_string());

        let children = catalog.explore(&ExploreRequest::new(path).push("BE"));
        assert_eq!(keys(&children), vec!["BE1", "BE2", "BE3"]);

        let filtered = catalog
            .explore(&ExploreRequest::new(path).push(vec!["DE".to_string(), "LU".to_string()]));
        assert_eq!(keys(&filtered), vec!["DE", "LU"]);
    }

    #[rstest]
    #[case::unknown_schema(ExploreRequest::new(["Nope"]))]
    #[case::unknown_member(ExploreRequest::new(["Olap", "C", "Zone", "Zone.Nuts", "nuts0", "XX"]))]
    #[case::below_leaf(ExploreRequest::new(["Olap", "C", "Zone", "Zone.Nuts", "nuts1", "BE1"]))]
    fn test_explore_bad_request(#[case] request: ExploreRequest) {
        let catalog = LocalQueryApi::mock().catalog().clone();
        assert_eq!(catalog.explore(&request)["error"], "BAD_REQUEST");
    }
}
