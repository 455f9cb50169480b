use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemberSelection {
    pub members: Vec<String>,
    /// `members` holds the two bounds of a range instead of a list
    pub range: bool,
}

/// Request for the aggregation engine, built up call by call and sent with
/// [`QueryApi::execute`](super::QueryApi::execute).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateQuery {
    pub cube: Option<String>,
    pub measures: Vec<String>,
    pub slices: IndexMap<String, MemberSelection>,
    pub dices: Vec<String>,
    pub projections: Vec<String>,
    pub filters: IndexMap<String, MemberSelection>,
}

impl AggregateQuery {
    pub fn drill(&mut self, cube: &str) {
        self.cube = Some(cube.to_string());
    }

    pub fn push(&mut self, measure: &str) {
        if !self.measures.iter().any(|m| m == measure) {
            self.measures.push(measure.to_string());
        }
    }

    pub fn pull(&mut self, measure: &str) {
        self.measures.retain(|m| m != measure);
    }

    pub fn slice(&mut self, hierarchy: &str, members: Vec<String>, range: bool) {
        self.slices
            .insert(hierarchy.to_string(), MemberSelection { members, range });
    }

    pub fn dice(&mut self, hierarchies: Vec<String>) {
        self.dices = hierarchies;
    }

    pub fn project(&mut self, hierarchy: &str) {
        if !self.projections.iter().any(|h| h == hierarchy) {
            self.projections.push(hierarchy.to_string());
        }
    }

    pub fn filter(&mut self, hierarchy: &str, members: Vec<String>, range: bool) {
        self.filters
            .insert(hierarchy.to_string(), MemberSelection { members, range });
    }

    pub fn clear(&mut self) {
        *self = AggregateQuery::default();
    }
}
