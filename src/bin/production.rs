use log::{error, info};
use std::sync::Arc;

use olap_navigator::{
    config::{Config, S3Config},
    metadata::MetadataCache,
    navigation::FilterScope,
    query_api::s3_store::S3QueryApi,
    NavigationController, QueryOrchestrator,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = Config::new().map_err(|e| {
        error!("Failed to initialize config: {}", e);
        e
    })?;

    let s3_config = S3Config::new().map_err(|e| {
        error!("Failed to initialize S3 config: {}", e);
        e
    })?;

    let filter_scope: FilterScope = config.filter_scope.parse().map_err(|e| {
        error!("Failed to parse filter scope: {}", e);
        e
    })?;

    let query_api = S3QueryApi::new(s3_config).await;
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
        "Navigating {}/{} on measure {} with {} dimensions",
        selection.schema,
        selection.cube,
        selection.measure,
        controller.dimensions().len()
    );

    println!("{}", serde_json::to_string_pretty(&controller.get_state())?);

    Ok(())
}
