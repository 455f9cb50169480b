use super::catalog::Catalog;
use super::{reply, AggregateQuery, ApiStatus, ExploreRequest, QueryApi};
use async_trait::async_trait;
use log::debug;
use serde_json::Value;

const MOCK_CATALOG: &str = r#"
{
    "schemas": {
        "Olap": {
            "caption": "Olap schema",
            "cubes": {
                "C": {
                    "caption": "Unemployment",
                    "description": "Unemployment in the European Union",
                    "dimensions": {
                        "Measures": {
                            "caption": "Measures",
                            "type": "Measure",
                            "hierarchies": {
                                "Measures": {
                                    "caption": "Measures",
                                    "levels": [{
                                        "id": "MeasuresLevel",
                                        "caption": "Measures",
                                        "members": {
                                            "rate": { "caption": "Unemployment rate" },
                                            "count": { "caption": "Unemployed persons" }
                                        }
                                    }]
                                }
                            }
                        },
                        "Zone": {
                            "caption": "Zone",
                            "description": "NUTS regions",
                            "type": "Geometry",
                            "hierarchies": {
                                "Zone.Nuts": {
                                    "caption": "Nuts",
                                    "levels": [
                                        {
                                            "id": "nuts0",
                                            "caption": "Country",
                                            "properties": {
                                                "geom": { "caption": "Geometry", "type": "Geometry" },
                                                "iso": { "caption": "ISO code", "type": "Standard" }
                                            },
                                            "members": {
                                                "BE": {
                                                    "caption": "Belgium",
                                                    "children": ["BE1", "BE2", "BE3"],
                                                    "properties": {
                                                        "geom": "POLYGON((2.5 49.5,6.4 49.5,6.4 51.5,2.5 51.5,2.5 49.5))",
                                                        "iso": "BEL"
                                                    }
                                                },
                                                "DE": {
                                                    "caption": "Germany",
                                                    "children": ["DE1", "DE2"],
                                                    "properties": { "geom": "POINT(10.45 51.17)", "iso": "DEU" }
                                                },
                                                "NL": {
                                                    "caption": "Netherlands",
                                                    "children": ["NL1", "NL2"],
                                                    "properties": { "geom": "POINT(5.29 52.13)", "iso": "NLD" }
                                                },
                                                "LU": {
                                                    "caption": "Luxembourg",
                                                    "children": ["LU0"],
                                                    "properties": { "geom": "POINT(6.13 49.81)", "iso": "LUX" }
                                                },
                                                "UK": {
                                                    "caption": "United Kingdom",
                                                    "children": ["UKC", "UKD"],
                                                    "properties": { "geom": "POINT(-3.44 55.38)", "iso": "GBR" }
                                                }
                                            }
                                        },
                                        {
                                            "id": "nuts1",
                                            "caption": "Region",
                                            "properties": {
                                                "geom": { "caption": "Geometry", "type": "Geometry" }
                                            },
                                            "members": {
                                                "BE1": { "caption": "Brussels", "properties": { "geom": "POINT(4.35 50.85)" } },
                                                "BE2": { "caption": "Flanders", "properties": { "geom": "POINT(4.24 51.05)" } },
                                                "BE3": { "caption": "Wallonia", "properties": { "geom": "POINT(4.87 50.42)" } },
                                                "DE1": { "caption": "Baden-Wurttemberg", "properties": { "geom": "POINT(9.35 48.66)" } },
                                                "DE2": { "caption": "Bavaria", "properties": { "geom": "POINT(11.5 48.79)" } },
                                                "NL1": { "caption": "Noord-Nederland", "properties": { "geom": "POINT(6.57 53.21)" } },
                                                "NL2": { "caption": "Oost-Nederland", "properties": { "geom": "POINT(6.1 52.25)" } },
                                                "LU0": { "caption": "Luxembourg", "properties": { "geom": "POINT(6.13 49.81)" } },
                                                "UKC": { "caption": "North East", "properties": { "geom": "POINT(-1.73 55.0)" } },
                                                "UKD": { "caption": "North West", "properties": { "geom": "POINT(-2.77 54.04)" } }
                                            }
                                        }
                                    ]
                                }
                            }
                        },
                        "Time": {
                            "caption": "Time",
                            "type": "Time",
                            "hierarchies": {
                                "Time.Calendar": {
                                    "caption": "Calendar",
                                    "levels": [
                                        {
                                            "id": "year",
                                            "caption": "Year",
                                            "members": {
                                                "2011": { "caption": "2011", "children": ["2011-Q1", "2011-Q2"] },
                                                "2012": { "caption": "2012", "children": ["2012-Q1", "2012-Q2"] }
                                            }
                                        },
                                        {
                                            "id": "quarter",
                                            "caption": "Quarter",
                                            "members": {
                                                "2011-Q1": { "caption": "Q1 2011" },
                                                "2011-Q2": { "caption": "Q2 2011" },
                                                "2012-Q1": { "caption": "Q1 2012" },
                                                "2012-Q2": { "caption": "Q2 2012" }
                                            }
                                        }
                                    ]
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}
"#;

/// [`QueryApi`] answering from a catalog held in memory.
#[derive(Clone, Debug, Default)]
pub struct LocalQueryApi {
    catalog: Catalog,
}

impl LocalQueryApi {
    pub fn new(catalog: Catalog) -> Self {
        LocalQueryApi { catalog }
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        Ok(LocalQueryApi::new(Catalog::from_json(json)?))
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Small unemployment cube: a `Zone` geometry dimension (countries and
    /// regions), a `Time` dimension (years and quarters) and two measures.
    pub fn mock() -> Self {
        LocalQueryApi::from_json(MOCK_CATALOG).expect("mock catalog literal is well formed")
    }
}

#[async_trait]
impl QueryApi for LocalQueryApi {
    async fn explore(&self, request: &ExploreRequest) -> Value {
        debug!("Local explore: {:?}", request.path);
        self.catalog.explore(request)
    }

    async fn execute(&self, query: &AggregateQuery) -> Value {
        debug!("Local execute on cube {:?}", query.cube);
        reply(
            ApiStatus::NotSupported,
            Value::String("Local catalog holds no facts".to_string()),
        )
    }
}
