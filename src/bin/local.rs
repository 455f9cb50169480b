use log::{error, info};
use std::sync::Arc;

use olap_navigator::{
    config::{Config, LocalCatalogConfig},
    metadata::MetadataCache,
    navigation::FilterScope,
    query_api::local_store::LocalQueryApi,
    NavigationController, QueryOrchestrator,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = Config::new().map_err(|e| {
        error!("Failed to initialize config: {}", e);
        e
    })?;

    let catalog_config = LocalCatalogConfig::new().map_err(|e| {
        error!("Failed to initialize local catalog config: {}", e);
        e
    })?;

    let filter_scope: FilterScope = config.filter_scope.parse().map_err(|e| {
        error!("Failed to parse filter scope: {}", e);
        e
    })?;

    let query_api = match &catalog_config.catalog_path {
        Some(path) => {
            let content = tokio::fs::read_to_string(path).await.map_err(|e| {
                error!("Failed to read catalog {}: {}", path, e);
                e
            })?;
            LocalQueryApi::from_json(&content).map_err(|e| {
                error!("Failed to parse catalog {}: {}", path, e);
                e
            })?
        }
        None => {
            info!("No CATALOG_PATH set, using the mock catalog");
            LocalQueryApi::mock()
        }
    };

    let orchestrator = Arc::new(QueryOrchestrator::new(
        Arc::new(query_api),
        MetadataCache::new(),
    ));
    let mut controller = NavigationController::new(orchestrator, filter_scope);

    let selection = controller.init_measure().await.map_err(|e| {
        error!("Failed to select a measure: {}", e);
        e
    })?;
    controller.init_dimensions().await.map_err(|e| {
        error!("Failed to initialize dimensions: {}", e);
        e
    })?;

    info!(
        "Navigating {}/{} on measure {}",
        selection.schema, selection.cube, selection.measure
    );
    for dimension in controller.dimensions() {
        info!(
            "Dimension {} ({}): {} levels, {} root members",
            dimension.id(),
            dimension.dimension_type,
            dimension.levels().len(),
            dimension.members().len()
        );
    }

    println!("{}", serde_json::to_string_pretty(&controller.get_state())?);

    Ok(())
}
