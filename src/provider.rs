//! The STAC catalogs scenes can be searched on and fetched from.
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use serde_json::json;
use stac::{ItemCollection, Link};
use std::fmt;

use crate::element84::{self, EarthSearch};
use crate::item::{CatalogItem, GRID_CODE, MGRS_TILE};
use crate::planetary_computer::{self, PlanetaryComputer};
use crate::stac_operations::{Operator, SearchQuery, SearchRequest, StacApi};
use crate::transport::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Microsoft Planetary Computer, assets signed with SAS tokens.
    PlanetaryComputer,
    /// Element84 Earth Search, public assets.
    Element84,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PlanetaryComputer => f.write_str("planetary_computer"),
            Self::Element84 => f.write_str("element84"),
        }
    }
}

impl ProviderKind {
    pub fn api_root(&self) -> &'static str {
        match self {
            Self::PlanetaryComputer => planetary_computer::API_ROOT,
            Self::Element84 => element84::API_ROOT,
        }
    }

    /// Sentinel-2 L2A collection of this catalog.
    pub fn default_collection(&self) -> &'static str {
        match self {
            Self::PlanetaryComputer => planetary_computer::sentinel2l2a::COLLECTION,
            Self::Element84 => element84::sentinel2collection1level2a::COLLECTION,
        }
    }

    /// Query restricting a search to one MGRS tile. The catalogs index the
    /// tile under different properties.
    pub fn tile_filter(&self, tile: &str) -> SearchQuery {
        match self {
            Self::PlanetaryComputer => {
                SearchQuery::new().with(MGRS_TILE, Operator::In, json!([tile]))
            }
            Self::Element84 => {
                SearchQuery::new().with(GRID_CODE, Operator::Eq, format!("MGRS-{tile}"))
            }
        }
    }

    /// Starter selection file for this catalog.
    pub fn image_selection_toml(&self) -> toml::Table {
        match self {
            Self::PlanetaryComputer => planetary_computer::sentinel2l2a::image_selection_toml(),
            Self::Element84 => element84::sentinel2collection1level2a::image_selection_toml(),
        }
    }

    pub fn connect(&self, client: reqwest::Client) -> Result<Provider, TransportError> {
        let provider = match self {
            Self::PlanetaryComputer => Provider::PlanetaryComputer(PlanetaryComputer::new(client)?),
            Self::Element84 => Provider::Element84(EarthSearch::new(client)?),
        };
        Ok(provider)
    }
}

/// A connected catalog.
pub enum Provider {
    PlanetaryComputer(PlanetaryComputer),
    Element84(EarthSearch),
}

impl Provider {
    pub fn kind(&self) -> ProviderKind {
        match self {
            Self::PlanetaryComputer(_) => ProviderKind::PlanetaryComputer,
            Self::Element84(_) => ProviderKind::Element84,
        }
    }
}

impl StacApi for Provider {
    async fn search(&self, request: &SearchRequest) -> Result<ItemCollection, TransportError> {
        match self {
            Self::PlanetaryComputer(api) => api.search(request).await,
            Self::Element84(api) => api.search(request).await,
        }
    }

    async fn next_page(
        &self,
        request: &SearchRequest,
        link: &Link,
    ) -> Result<ItemCollection, TransportError> {
        match self {
            Self::PlanetaryComputer(api) => api.next_page(request, link).await,
            Self::Element84(api) => api.next_page(request, link).await,
        }
    }

    async fn sign_item(&self, item: &mut CatalogItem) -> Result<(), TransportError> {
        match self {
            Self::PlanetaryComputer(api) => api.sign_item(item).await,
            Self::Element84(api) => api.sign_item(item).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tile_filters() {
        let query = ProviderKind::PlanetaryComputer.tile_filter("10SDJ");
        assert_eq!(query.get(MGRS_TILE, Operator::In), Some(&json!(["10SDJ"])));

        let query = ProviderKind::Element84.tile_filter("10SDJ");
        assert_eq!(query.get(GRID_CODE, Operator::Eq), Some(&json!("MGRS-10SDJ")));
    }

    #[test]
    fn test_kind_round_trips_through_toml_names() {
        #[derive(Deserialize)]
        struct Holder {
            provider: ProviderKind,
        }
        let holder: Holder = toml::from_str("provider = \"element84\"").unwrap();
        assert_eq!(holder.provider, ProviderKind::Element84);
        assert_eq!(ProviderKind::PlanetaryComputer.to_string(), "planetary_computer");
    }

    #[test]
    fn test_connect_picks_the_catalog() {
        let provider = ProviderKind::Element84.connect(reqwest::Client::new()).unwrap();
        assert_eq!(provider.kind(), ProviderKind::Element84);
        assert_eq!(ProviderKind::Element84.default_collection(), "sentinel-2-c1-l2a");
        assert_eq!(ProviderKind::PlanetaryComputer.default_collection(), "sentinel-2-l2a");
    }
}
