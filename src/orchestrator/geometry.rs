use geo_types::Geometry;
use serde_json::Value;
use std::str::FromStr;
use thiserror::Error;
use wkt::Wkt;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GeometryError {
    #[error("Geometry value is not WKT text: {0}")]
    NotText(String),

    #[error("Invalid WKT: {0}")]
    InvalidWkt(String),

    #[error("Unsupported WKT geometry: {0}")]
    Unsupported(String),

    #[error("GeoJSON encoding failed: {0}")]
    Encoding(String),
}

/// Converts a WKT property value, as sent by the API, into a GeoJSON geometry.
pub fn wkt_to_geojson(value: &Value) -> Result<Value, GeometryError> {
    let text = value
        .as_str()
        .ok_or_else(|| GeometryError::NotText(value.to_string()))?;
    let parsed: Wkt<f64> =
        Wkt::from_str(text).map_err(|e| GeometryError::InvalidWkt(e.to_string()))?;
    let geometry = Geometry::<f64>::try_from(parsed)
        .map_err(|e| GeometryError::Unsupported(e.to_string()))?;
    let geojson = geojson::Geometry::new(geojson::Value::from(&geometry));
    serde_json::to_value(&geojson).map_err(|e| GeometryError::Encoding(e.to_string()))
}
