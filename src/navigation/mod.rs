pub mod dimension_state;

pub use dimension_state::{DimensionSnapshot, DimensionState, FilterScope};

use crate::metadata::model::{DimensionType, HierarchyPath, Slice};
use crate::orchestrator::{QueryError, QueryOrchestrator};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NavigationError {
    #[error(transparent)]
    Query(#[from] QueryError),

    #[error("Catalog has no schema")]
    NoSchema,

    #[error("Schema {0} has no cube")]
    NoCube(String),

    #[error("Cube {0} has no measure")]
    NoMeasure(String),

    #[error("Cube {cube} not found in schema {schema}")]
    UnknownCube { schema: String, cube: String },

    #[error("Measure {measure} not found in cube {cube}")]
    UnknownMeasure { cube: String, measure: String },

    #[error("No cube selected")]
    NoSelection,

    #[error("Dimension {0} not found")]
    DimensionNotFound(String),

    #[error("Member {member} is not in the current slice of {dimension}")]
    MemberNotInSlice { dimension: String, member: String },

    #[error("Level {level} is out of range for dimension {dimension}")]
    LevelOutOfRange { dimension: String, level: usize },

    #[error("Invalid filter scope: {0}")]
    InvalidFilterScope(String),

    #[error("Invalid navigation snapshot: {0}")]
    Snapshot(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrillMode {
    /// Expand the given member only.
    Simple,
    /// Expand the filtered members, or the whole current slice without
    /// filters.
    Selected,
}

/// Receives drill and roll failures for display to the user.
pub trait Notifier: Send + Sync {
    fn notify(&self, error: &NavigationError);
}

pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, error: &NavigationError) {
        error!("Navigation failed: {}", error);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub schema: String,
    pub cube: String,
    pub measure: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NavigationSnapshot {
    pub selection: Option<Selection>,
    pub filter_scope: FilterScope,
    pub dimensions: Vec<DimensionSnapshot>,
}

/// Navigation session over one cube: the selected schema, cube and measure,
/// and the drill position of every dimension.
pub struct NavigationController {
    orchestrator: Arc<QueryOrchestrator>,
    filter_scope: FilterScope,
    notifier: Box<dyn Notifier>,
    selection: Option<Selection>,
    dimensions: Vec<DimensionState>,
    initialized_for: Option<Selection>,
}

impl NavigationController {
    pub fn new(orchestrator: Arc<QueryOrchestrator>, filter_scope: FilterScope) -> Self {
        NavigationController {
            orchestrator,
            filter_scope,
            notifier: Box::new(LogNotifier),
            selection: None,
            dimensions: Vec::new(),
            initialized_for: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Box<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn orchestrator(&self) -> &Arc<QueryOrchestrator> {
        &self.orchestrator
    }

    pub fn selection(&self) -> Option<&Selection> {
        self.selection.as_ref()
    }

    pub fn dimensions(&self) -> &[DimensionState] {
        &self.dimensions
    }

    pub fn dimension(&self, dimension: &str) -> Result<&DimensionState, NavigationError> {
        self.dimensions
            .iter()
            .find(|state| state.id() == dimension)
            .ok_or_else(|| NavigationError::DimensionNotFound(dimension.to_string()))
    }

    fn dimension_mut(&mut self, dimension: &str) -> Result<&mut DimensionState, NavigationError> {
        self.dimensions
            .iter_mut()
            .find(|state| state.id() == dimension)
            .ok_or_else(|| NavigationError::DimensionNotFound(dimension.to_string()))
    }

    /// Keeps the selected schema, cube and measure when the catalog still has
    /// them and falls back to the first available ones otherwise.
    pub async fn init_measure(&mut self) -> Result<Selection, NavigationError> {
        let previous = self.selection.clone();

        let schemas = self.orchestrator.get_schemas().await?;
        let schema = match previous.as_ref() {
            Some(selection) if schemas.contains_key(&selection.schema) => selection.schema.clone(),
            _ => schemas
                .keys()
                .next()
                .cloned()
                .ok_or(NavigationError::NoSchema)?,
        };

        let cubes = self.orchestrator.get_cubes(&schema).await?;
        let cube = match previous.as_ref() {
            Some(selection) if selection.schema == schema && cubes.contains_key(&selection.cube) => {
                selection.cube.clone()
            }
            _ => cubes
                .keys()
                .next()
                .cloned()
                .ok_or_else(|| NavigationError::NoCube(schema.clone()))?,
        };

        let measures = self.orchestrator.get_measures(&schema, &cube).await?;
        let measure = match previous.as_ref() {
            Some(selection)
                if selection.schema == schema
                    && selection.cube == cube
                    && measures.contains_key(&selection.measure) =>
            {
                selection.measure.clone()
            }
            _ => measures
                .keys()
                .next()
                .cloned()
                .ok_or_else(|| NavigationError::NoMeasure(cube.clone()))?,
        };

        let selection = Selection {
            schema,
            cube,
            measure,
        };
        self.select(selection.clone());
        Ok(selection)
    }

    /// Whether the dimension states were built for another selection.
    pub fn is_init_necessary(&self) -> bool {
        self.selection.is_none() || self.initialized_for != self.selection
    }

    /// Builds a state for every non-measure dimension of the selected cube,
    /// on its first hierarchy, with the root level members. Property values
    /// are loaded for geometry dimensions only.
    pub async fn init_dimensions(&mut self) -> Result<(), NavigationError> {
        let selection = self.selection.clone().ok_or(NavigationError::NoSelection)?;
        if !self.is_init_necessary() {
            debug!("Dimensions already initialized for cube {}", selection.cube);
            return Ok(());
        }

        let dimensions = self
            .orchestrator
            .get_dimensions(&selection.schema, &selection.cube)
            .await?;
        let mut states = Vec::with_capacity(dimensions.len());
        for dimension in dimensions.values() {
            let hierarchies = self
                .orchestrator
                .get_hierarchies(&selection.schema, &selection.cube, &dimension.id)
                .await?;
            let hierarchy = match hierarchies.keys().next() {
                Some(hierarchy) => hierarchy,
                None => {
                    warn!("Dimension {} has no hierarchy, skipped", dimension.id);
                    continue;
                }
            };

            let path = HierarchyPath::new(
                &selection.schema,
                &selection.cube,
                &dimension.id,
                hierarchy,
            );
            let levels = self.orchestrator.get_levels(&path).await?;
            if levels.is_empty() {
                warn!("Hierarchy {} has no level, skipped", path);
                continue;
            }
            let with_properties = dimension.dimension_type == DimensionType::Geometry;
            let root = self
                .orchestrator
                .get_members(&path, 0, with_properties)
                .await?;
            states.push(DimensionState::new(
                path,
                &dimension.caption,
                dimension.dimension_type,
                levels,
                root,
                self.filter_scope,
            ));
        }

        info!(
            "Initialized {} dimensions for cube {}",
            states.len(),
            selection.cube
        );
        self.dimensions = states;
        self.initialized_for = Some(selection);
        Ok(())
    }

    /// Selects a cube and its first measure.
    pub async fn select_cube(&mut self, schema: &str, cube: &str) -> Result<(), NavigationError> {
        let cubes = self.orchestrator.get_cubes(schema).await?;
        if !cubes.contains_key(cube) {
            return Err(NavigationError::UnknownCube {
                schema: schema.to_string(),
                cube: cube.to_string(),
            });
        }
        let measures = self.orchestrator.get_measures(schema, cube).await?;
        let measure = measures
            .keys()
            .next()
            .cloned()
            .ok_or_else(|| NavigationError::NoMeasure(cube.to_string()))?;
        self.select(Selection {
            schema: schema.to_string(),
            cube: cube.to_string(),
            measure,
        });
        Ok(())
    }

    pub async fn select_measure(&mut self, measure: &str) -> Result<(), NavigationError> {
        let mut selection = self.selection.clone().ok_or(NavigationError::NoSelection)?;
        let measures = self
            .orchestrator
            .get_measures(&selection.schema, &selection.cube)
            .await?;
        if !measures.contains_key(measure) {
            return Err(NavigationError::UnknownMeasure {
                cube: selection.cube,
                measure: measure.to_string(),
            });
        }
        selection.measure = measure.to_string();
        self.select(selection);
        Ok(())
    }

    fn select(&mut self, selection: Selection) {
        if self.selection.as_ref() == Some(&selection) {
            return;
        }
        info!(
            "Selected measure {} of cube {} in schema {}",
            selection.measure, selection.cube, selection.schema
        );
        self.selection = Some(selection);
        self.dimensions.clear();
        self.initialized_for = None;
    }

    /// Pushes the children of `member` (or of the selection, see
    /// [`DrillMode`]) as the new current slice of `dimension`. Returns `false`
    /// when the dimension is already at its deepest level.
    pub async fn drill_down(
        &mut self,
        dimension: &str,
        member: &str,
        mode: DrillMode,
    ) -> Result<bool, NavigationError> {
        let result = self.try_drill_down(dimension, member, mode).await;
        self.report(result)
    }

    async fn try_drill_down(
        &mut self,
        dimension: &str,
        member: &str,
        mode: DrillMode,
    ) -> Result<bool, NavigationError> {
        let state = self.dimension(dimension)?;
        if !state.is_drill_possible() {
            warn!(
                "Drill down refused on {}: already at level {}",
                dimension,
                state.current_level()
            );
            return Ok(false);
        }

        let parents = match mode {
            DrillMode::Simple => {
                if !state.members().contains_key(member) {
                    return Err(NavigationError::MemberNotInSlice {
                        dimension: dimension.to_string(),
                        member: member.to_string(),
                    });
                }
                vec![member.to_string()]
            }
            DrillMode::Selected => state.drill_targets(),
        };
        let path = state.path.clone();
        let level = state.current_level();
        let with_properties = state.dimension_type == DimensionType::Geometry;

        let mut children = Slice::new();
        for parent in &parents {
            let fetched = self
                .orchestrator
                .get_member_children(&path, level, parent, 1, with_properties)
                .await?;
            children.extend(fetched);
        }

        debug!(
            "Drilled {} from {} parents to {} members",
            dimension,
            parents.len(),
            children.len()
        );
        self.dimension_mut(dimension)?.add_slice(children)?;
        Ok(true)
    }

    /// Pops up to `nb_levels` slices of `dimension`, never past the root.
    /// Returns the number of levels actually rolled up.
    pub fn roll_up(&mut self, dimension: &str, nb_levels: usize) -> Result<usize, NavigationError> {
        let result = self.dimension_mut(dimension).map(|state| {
            let mut rolled = 0;
            while rolled < nb_levels && state.remove_last_slice() {
                rolled += 1;
            }
            rolled
        });
        if let Ok(0) = result {
            debug!("Roll up of {} is a no-op at level 0", dimension);
        }
        self.report(result)
    }

    pub fn filters(&self, dimension: &str) -> Result<Vec<String>, NavigationError> {
        Ok(self.dimension(dimension)?.filters())
    }

    pub fn set_filters(&mut self, dimension: &str, members: &[String]) -> Result<(), NavigationError> {
        self.dimension_mut(dimension)?.set_filters(members.iter().cloned())
    }

    pub fn add_filter(&mut self, dimension: &str, member: &str) -> Result<(), NavigationError> {
        self.dimension_mut(dimension)?.add_filter(member)
    }

    pub fn remove_filter(&mut self, dimension: &str, member: &str) -> Result<(), NavigationError> {
        self.dimension_mut(dimension)?.remove_filter(member);
        Ok(())
    }

    pub fn clear_filters(&mut self, dimension: &str) -> Result<(), NavigationError> {
        self.dimension_mut(dimension)?.clear_filters();
        Ok(())
    }

    pub fn get_state(&self) -> NavigationSnapshot {
        NavigationSnapshot {
            selection: self.selection.clone(),
            filter_scope: self.filter_scope,
            dimensions: self.dimensions.iter().map(DimensionState::snapshot).collect(),
        }
    }

    /// Restores a saved session. The selection is validated against the
    /// catalog again and deeper slices are refetched. Dimensions the current
    /// cube no longer has are skipped. On error the session keeps the
    /// re-validated selection with freshly initialized dimensions.
    pub async fn set_state(&mut self, snapshot: NavigationSnapshot) -> Result<(), NavigationError> {
        let selection = snapshot
            .selection
            .ok_or_else(|| NavigationError::Snapshot("no selection".to_string()))?;

        self.filter_scope = snapshot.filter_scope;
        self.select(selection);
        self.initialized_for = None;
        self.init_measure().await?;
        self.init_dimensions().await?;

        let mut dimensions = self.dimensions.clone();
        for saved in &snapshot.dimensions {
            let state = match dimensions.iter_mut().find(|state| state.path == saved.path) {
                Some(state) => state,
                None => {
                    warn!("Snapshot dimension {} not restored", saved.path);
                    continue;
                }
            };
            let with_properties = state.dimension_type == DimensionType::Geometry;
            for (level, members) in saved.slices.iter().enumerate().skip(1) {
                if !state.is_drill_possible() {
                    break;
                }
                let slice = self
                    .orchestrator
                    .get_members_infos(&state.path, level, members, with_properties)
                    .await?;
                state.add_slice(slice)?;
            }
            state.restore_filters(&saved.filters);
        }

        info!("Restored navigation state of {} dimensions", snapshot.dimensions.len());
        self.dimensions = dimensions;
        Ok(())
    }

    fn report<T>(&self, result: Result<T, NavigationError>) -> Result<T, NavigationError> {
        if let Err(e) = &result {
            self.notifier.notify(e);
        }
        result
    }
}
