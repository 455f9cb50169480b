use super::NavigationError;
use crate::metadata::model::{DimensionType, HierarchyPath, Slice};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Where member filters live while navigating a dimension.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterScope {
    /// One filter set per slice. Rolling up exposes the set of the slice that
    /// becomes current again.
    #[default]
    Slice,
    /// One set for the whole dimension, cleared on drill down and left as is
    /// on roll up.
    Dimension,
}

impl FromStr for FilterScope {
    type Err = NavigationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "slice" => Ok(FilterScope::Slice),
            "dimension" => Ok(FilterScope::Dimension),
            _ => Err(NavigationError::InvalidFilterScope(s.to_string())),
        }
    }
}

impl fmt::Display for FilterScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterScope::Slice => write!(f, "slice"),
            FilterScope::Dimension => write!(f, "dimension"),
        }
    }
}

/// Serializable position of one dimension: member ids of every slice, root
/// first, and the filter sets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionSnapshot {
    pub path: HierarchyPath,
    pub slices: Vec<Vec<String>>,
    pub filters: Vec<Vec<String>>,
}

/// Navigation position of one dimension along one of its hierarchies.
///
/// The stack always holds the root slice (level 0); each drill down pushes
/// the members of the next level.
#[derive(Debug, Clone)]
pub struct DimensionState {
    pub path: HierarchyPath,
    pub caption: String,
    pub dimension_type: DimensionType,
    levels: Vec<String>,
    members_stack: Vec<Slice>,
    filters: Vec<IndexSet<String>>,
    scope: FilterScope,
}

impl PartialEq for DimensionState {
    fn eq(&self, other: &Self) -> bool {
        self.path.dimension == other.path.dimension
    }
}

impl DimensionState {
    pub fn new(
        path: HierarchyPath,
        caption: impl Into<String>,
        dimension_type: DimensionType,
        levels: Vec<String>,
        root: Slice,
        scope: FilterScope,
    ) -> Self {
        DimensionState {
            path,
            caption: caption.into(),
            dimension_type,
            levels,
            members_stack: vec![root],
            filters: vec![IndexSet::new()],
            scope,
        }
    }

    pub fn id(&self) -> &str {
        &self.path.dimension
    }

    pub fn scope(&self) -> FilterScope {
        self.scope
    }

    /// Level captions of the hierarchy, root first.
    pub fn levels(&self) -> &[String] {
        &self.levels
    }

    pub fn current_level(&self) -> usize {
        self.members_stack.len() - 1
    }

    pub fn max_level(&self) -> usize {
        self.levels.len().saturating_sub(1)
    }

    pub fn is_drill_possible(&self) -> bool {
        self.current_level() < self.max_level()
    }

    pub fn is_roll_possible(&self) -> bool {
        self.current_level() > 0
    }

    /// Members of the current slice.
    pub fn members(&self) -> &Slice {
        &self.members_stack[self.current_level()]
    }

    pub fn slices(&self) -> &[Slice] {
        &self.members_stack
    }

    pub fn add_slice(&mut self, members: Slice) -> Result<(), NavigationError> {
        if !self.is_drill_possible() {
            return Err(NavigationError::LevelOutOfRange {
                dimension: self.id().to_string(),
                level: self.current_level() + 1,
            });
        }
        self.members_stack.push(members);
        match self.scope {
            FilterScope::Slice => self.filters.push(IndexSet::new()),
            FilterScope::Dimension => self.filter_set_mut().clear(),
        }
        Ok(())
    }

    /// Pops the current slice. The root slice stays; returns whether a slice
    /// was removed.
    pub fn remove_last_slice(&mut self) -> bool {
        if !self.is_roll_possible() {
            return false;
        }
        self.members_stack.pop();
        if self.scope == FilterScope::Slice {
            self.filters.pop();
        }
        true
    }

    /// Ids of the filtered members of the current slice.
    pub fn filters(&self) -> Vec<String> {
        self.filter_set().iter().cloned().collect()
    }

    pub fn has_filters(&self) -> bool {
        !self.filter_set().is_empty()
    }

    /// Replaces the filter set. Every id must be a member of the current
    /// slice.
    pub fn set_filters<I, S>(&mut self, members: I) -> Result<(), NavigationError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let members: IndexSet<String> = members.into_iter().map(Into::into).collect();
        if let Some(member) = members.iter().find(|m| !self.members().contains_key(*m)) {
            return Err(self.not_in_slice(member));
        }
        *self.filter_set_mut() = members;
        Ok(())
    }

    pub fn add_filter(&mut self, member: &str) -> Result<(), NavigationError> {
        if !self.members().contains_key(member) {
            return Err(self.not_in_slice(member));
        }
        self.filter_set_mut().insert(member.to_string());
        Ok(())
    }

    pub fn remove_filter(&mut self, member: &str) {
        self.filter_set_mut().shift_remove(member);
    }

    pub fn clear_filters(&mut self) {
        self.filter_set_mut().clear();
    }

    /// Members to expand on a selected drill down: the filters, or the whole
    /// current slice when none is set.
    pub fn drill_targets(&self) -> Vec<String> {
        if self.has_filters() {
            self.filters()
        } else {
            self.members().keys().cloned().collect()
        }
    }

    pub fn snapshot(&self) -> DimensionSnapshot {
        DimensionSnapshot {
            path: self.path.clone(),
            slices: self
                .members_stack
                .iter()
                .map(|slice| slice.keys().cloned().collect())
                .collect(),
            filters: self
                .filters
                .iter()
                .map(|set| set.iter().cloned().collect())
                .collect(),
        }
    }

    /// Restores saved filter sets onto the current stack. Sets beyond the
    /// stack depth and ids no longer in their slice are dropped.
    pub fn restore_filters(&mut self, filters: &[Vec<String>]) {
        let depth = self.filters.len();
        for (index, saved) in filters.iter().take(depth).enumerate() {
            let slice = match self.scope {
                FilterScope::Slice => &self.members_stack[index],
                FilterScope::Dimension => &self.members_stack[self.current_level()],
            };
            let kept: IndexSet<String> = saved
                .iter()
                .filter(|id| slice.contains_key(*id))
                .cloned()
                .collect();
            self.filters[index] = kept;
        }
    }

    fn filter_set(&self) -> &IndexSet<String> {
        match self.scope {
            FilterScope::Slice => &self.filters[self.current_level()],
            FilterScope::Dimension => &self.filters[0],
        }
    }

    fn filter_set_mut(&mut self) -> &mut IndexSet<String> {
        let index = match self.scope {
            FilterScope::Slice => self.current_level(),
            FilterScope::Dimension => 0,
        };
        &mut self.filters[index]
    }

    fn not_in_slice(&self, member: &str) -> NavigationError {
        NavigationError::MemberNotInSlice {
            dimension: self.id().to_string(),
            member: member.to_string(),
        }
    }
}
