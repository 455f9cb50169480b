use envconfig::Envconfig;
use log::debug;

#[derive(Envconfig)]
pub struct Config {
    /// `slice` or `dimension`, see [`FilterScope`](crate::navigation::FilterScope)
    #[envconfig(from = "FILTER_SCOPE", default = "slice")]
    pub filter_scope: String,
}

impl Config {
    pub fn new() -> Result<Self, envconfig::Error> {
        let config = Self::init_from_env()?;
        debug!("Config loaded: filter_scope={}", config.filter_scope);
        Ok(config)
    }
}

#[derive(Envconfig, Clone)]
pub struct LocalCatalogConfig {
    #[envconfig(from = "CATALOG_PATH")]
    pub catalog_path: Option<String>,
}

impl LocalCatalogConfig {
    pub fn new() -> Result<Self, envconfig::Error> {
        let config = Self::init_from_env()?;
        debug!(
            "LocalCatalogConfig loaded: catalog_path={:?}",
            config.catalog_path
        );
        Ok(config)
    }
}

#[derive(Envconfig, Clone)]
pub struct S3Config {
    #[envconfig(from = "TENANT")]
    pub tenant: String,

    #[envconfig(from = "S3_BUCKET_NAME")]
    pub bucket_name: String,

    #[envconfig(from = "CATALOG_KEY", default = "catalog.json")]
    pub catalog_key: String,
}

impl S3Config {
    pub fn new() -> Result<Self, envconfig::Error> {
        let config = Self::init_from_env()?;
        debug!(
            "S3Config loaded: tenant={}, bucket_name={}, catalog_key={}",
            config.tenant, config.bucket_name, config.catalog_key
        );
        Ok(config)
    }
}
