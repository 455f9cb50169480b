use super::catalog::Catalog;
use super::{reply, AggregateQuery, ApiStatus, ExploreRequest, QueryApi};
use crate::config::S3Config;
use async_trait::async_trait;
use aws_sdk_s3::{config::BehaviorVersion, Client};
use log::{debug, error, info};
use serde_json::Value;
use std::error::Error;
use tokio::sync::OnceCell;

type BoxError = Box<dyn Error + Send + Sync>;

/// [`QueryApi`] answering from a catalog document stored in S3 under
/// `<tenant>/<catalog_key>`.
///
/// The document is downloaded on the first request and kept for the life of
/// the store. A failed download is retried on the next request.
pub struct S3QueryApi {
    tenant: String,
    bucket_name: String,
    catalog_key: String,
    s3_client: Client,
    catalog: OnceCell<Catalog>,
}

impl S3QueryApi {
    pub async fn new(config: S3Config) -> Self {
        let shared_config = aws_config::load_defaults(BehaviorVersion::latest()).await;
        let s3_client = Client::new(&shared_config);
        S3QueryApi {
            tenant: config.tenant,
            bucket_name: config.bucket_name,
            catalog_key: config.catalog_key,
            s3_client,
            catalog: OnceCell::new(),
        }
    }

    async fn get_object_content(&self, key: &str) -> Result<String, BoxError> {
        let bucket_key = format!("{}/{}", self.tenant, key);
        debug!("Fetching s3://{}/{}", self.bucket_name, bucket_key);
        let result = self
            .s3_client
            .get_object()
            .bucket(self.bucket_name.clone())
            .key(bucket_key)
            .send()
            .await?;

        let body = result.body.collect().await?;

        let content = String::from_utf8(body.to_vec())?;
        Ok(content)
    }

    async fn catalog(&self) -> Result<&Catalog, BoxError> {
        self.catalog
            .get_or_try_init(|| async {
                let content = self.get_object_content(&self.catalog_key).await?;
                let catalog = Catalog::from_json(&content)?;
                info!(
                    "Loaded catalog {} with {} schemas",
                    self.catalog_key,
                    catalog.schemas.len()
                );
                Ok::<Catalog, BoxError>(catalog)
            })
            .await
    }
}

#[async_trait]
impl QueryApi for S3QueryApi {
    async fn explore(&self, request: &ExploreRequest) -> Value {
        match self.catalog().await {
            Ok(catalog) => catalog.explore(request),
            Err(e) => {
                error!("Failed to load catalog {}: {}", self.catalog_key, e);
                reply(ApiStatus::ServerError, Value::String(e.to_string()))
            }
        }
    }

    async fn execute(&self, query: &AggregateQuery) -> Value {
        debug!("S3 execute on cube {:?}", query.cube);
        reply(
            ApiStatus::NotSupported,
            Value::String("S3 catalog holds no facts".to_string()),
        )
    }
}
