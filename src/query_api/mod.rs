pub mod aggregate;
pub mod catalog;
pub mod local_store;
pub mod s3_store;

pub use aggregate::AggregateQuery;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// One element of an explore path.
///
/// Only the sixth element may be a list: it then selects a filtered member
/// list instead of the children of a single parent member.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Id(String),
    Ids(Vec<String>),
}

impl From<&str> for PathSegment {
    fn from(id: &str) -> Self {
        PathSegment::Id(id.to_string())
    }
}

impl From<String> for PathSegment {
    fn from(id: String) -> Self {
        PathSegment::Id(id)
    }
}

impl From<Vec<String>> for PathSegment {
    fn from(ids: Vec<String>) -> Self {
        PathSegment::Ids(ids)
    }
}

/// Granularity of an explore request, selected by the path length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Schemas,
    Cubes,
    Dimensions,
    Hierarchies,
    Levels,
    Members,
    FilteredMembers,
    Children,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExploreRequest {
    pub path: Vec<PathSegment>,
    pub with_properties: bool,
    pub descending_level: usize,
}

impl ExploreRequest {
    pub fn new<I, S>(path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<PathSegment>,
    {
        ExploreRequest {
            path: path.into_iter().map(Into::into).collect(),
            with_properties: false,
            descending_level: 1,
        }
    }

    pub fn with_properties(mut self, with_properties: bool) -> Self {
        self.with_properties = with_properties;
        self
    }

    pub fn descending(mut self, descending_level: usize) -> Self {
        self.descending_level = descending_level;
        self
    }

    pub fn push(mut self, segment: impl Into<PathSegment>) -> Self {
        self.path.push(segment.into());
        self
    }

    /// `None` for paths longer than six elements or with a list anywhere but
    /// in sixth position.
    pub fn granularity(&self) -> Option<Granularity> {
        let list_position = self
            .path
            .iter()
            .position(|segment| matches!(segment, PathSegment::Ids(_)));
        match (self.path.len(), list_position) {
            (0, None) => Some(Granularity::Schemas),
            (1, None) => Some(Granularity::Cubes),
            (2, None) => Some(Granularity::Dimensions),
            (3, None) => Some(Granularity::Hierarchies),
            (4, None) => Some(Granularity::Levels),
            (5, None) => Some(Granularity::Members),
            (6, Some(5)) => Some(Granularity::FilteredMembers),
            (6, None) => Some(Granularity::Children),
            _ => None,
        }
    }

    /// Key identifying the request among in-flight fetches.
    ///
    /// The options are part of the key: a listing with properties and one
    /// without are different replies, and a caller joining the other kind of
    /// fetch would not find the property values it asked for once it lands.
    pub fn cache_key(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{:?}", self))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApiStatus {
    Ok,
    BadRequest,
    NotSupported,
    ServerError,
}

/// Builds the `{ error, data }` envelope every [`QueryApi`] reply uses.
pub fn reply(status: ApiStatus, data: Value) -> Value {
    json!({ "error": status, "data": data })
}

/// Backend answering metadata exploration and aggregation requests.
///
/// Replies are raw JSON envelopes; validating them is the caller's job.
/// Transport failures are answered with [`ApiStatus::ServerError`].
#[async_trait]
pub trait QueryApi: Send + Sync {
    async fn explore(&self, request: &ExploreRequest) -> Value;

    async fn execute(&self, query: &AggregateQuery) -> Value;
}

#[cfg(test)]
mod test {
    use super::*;
    use rstest::*;

    #[rstest]
    #[case::schemas(ExploreRequest::new(Vec::<String>::new()), Some(Granularity::Schemas))]
    #[case::levels(ExploreRequest::new(["s", "c", "d", "h"]), Some(Granularity::Levels))]
    #[case::members(ExploreRequest::new(["s", "c", "d", "h", "l"]), Some(Granularity::Members))]
    #[case::children(
        ExploreRequest::new(["s", "c", "d", "h", "l", "BE"]),
        Some(Granularity::Children)
    )]
    #[case::filtered(
        ExploreRequest::new(["s", "c", "d", "h", "l"]).push(vec!["BE".to_string()]),
        Some(Granularity::FilteredMembers)
    )]
    #[case::misplaced_list(
        ExploreRequest::new(["s"]).push(vec!["c".to_string()]),
        None
    )]
    #[case::too_long(ExploreRequest::new(["1", "2", "3", "4", "5", "6", "7"]), None)]
    fn test_granularity(#[case] request: ExploreRequest, #[case] expected: Option<Granularity>) {
        assert_eq!(request.granularity(), expected);
    }

    #[rstest]
    fn test_cache_key_distinguishes_options() {
        let plain = ExploreRequest::new(["s", "c", "d", "h", "l"]);
        let with_properties = plain.clone().with_properties(true);
        assert_ne!(plain.cache_key(), with_properties.cache_key());
        assert_eq!(plain.cache_key(), plain.clone().cache_key());
    }

    #[rstest]
    fn test_reply_envelope() {
        let value = reply(ApiStatus::BadRequest, json!("unknown cube"));
        assert_eq!(value["error"], "BAD_REQUEST");
        assert_eq!(value["data"], "unknown cube");
    }
}
