use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use stac::Item;
use std::collections::BTreeMap;

pub const CLOUD_COVER: &str = "eo:cloud_cover";
pub const NO_DATA_PERCENTAGE: &str = "s2:nodata_pixel_percentage";
pub const MGRS_TILE: &str = "s2:mgrs_tile";
pub const GRID_CODE: &str = "grid:code";

/// The item properties this workflow reads, typed, with everything else
/// kept in `additional_fields`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemProperties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datetime: Option<DateTime<Utc>>,

    #[serde(rename = "eo:cloud_cover", default, skip_serializing_if = "Option::is_none")]
    pub cloud_cover: Option<f64>,

    #[serde(
        rename = "s2:nodata_pixel_percentage",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub no_data_percentage: Option<f64>,

    #[serde(rename = "s2:mgrs_tile", default, skip_serializing_if = "Option::is_none")]
    pub mgrs_tile: Option<String>,

    #[serde(flatten)]
    pub additional_fields: Map<String, Value>,
}

impl ItemProperties {
    /// Numeric property lookup by its STAC name.
    pub fn number(&self, name: &str) -> Option<f64> {
        match name {
            CLOUD_COVER => self.cloud_cover,
            NO_DATA_PERCENTAGE => self.no_data_percentage,
            _ => self.additional_fields.get(name)?.as_f64(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CatalogItem {
    pub id: String,
    pub collection: Option<String>,
    pub properties: ItemProperties,
    /// Asset key (band name) to href.
    pub assets: BTreeMap<String, String>,
}

impl CatalogItem {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_owned(),
            collection: None,
            properties: ItemProperties::default(),
            assets: BTreeMap::new(),
        }
    }

    pub fn from_item(item: &Item) -> serde_json::Result<Self> {
        let properties = serde_json::from_value(serde_json::to_value(&item.properties)?)?;
        let assets = item
            .assets
            .iter()
            .map(|(key, asset)| (key.to_owned(), asset.href.to_owned()))
            .collect();
        Ok(Self {
            id: item.id.to_owned(),
            collection: item.collection.to_owned(),
            properties,
            assets,
        })
    }

    pub fn cloud_cover(&self) -> Option<f64> {
        self.properties.cloud_cover
    }

    pub fn no_data_percentage(&self) -> Option<f64> {
        self.properties.no_data_percentage
    }

    /// MGRS tile id, from `s2:mgrs_tile` or from an Earth Search style
    /// `grid:code` of the form `MGRS-10SDJ`.
    pub fn tile_id(&self) -> Option<&str> {
        if let Some(tile) = self.properties.mgrs_tile.as_deref() {
            return Some(tile);
        }
        self.properties
            .additional_fields
            .get(GRID_CODE)?
            .as_str()?
            .strip_prefix("MGRS-")
    }

    pub fn asset_href(&self, band: &str) -> Option<&str> {
        self.assets.get(band).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stac_item() -> Item {
        serde_json::from_value(json!({
            "type": "Feature",
            "stac_version": "1.0.0",
            "id": "S2A_MSIL2A_20240610T184921_R113_T10SDJ_20240611T010101",
            "collection": "sentinel-2-l2a",
            "geometry": null,
            "properties": {
                "datetime": "2024-06-10T18:49:21.024000Z",
                "eo:cloud_cover": 0.42,
                "s2:nodata_pixel_percentage": 3.5,
                "s2:mgrs_tile": "10SDJ",
                "platform": "Sentinel-2A"
            },
            "links": [],
            "assets": {
                "visual": {"href": "https://example.blob.core.windows.net/s2/T10SDJ_TCI_10m.tif"},
                "B02": {"href": "https://example.blob.core.windows.net/s2/T10SDJ_B02_10m.tif"}
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_from_item_reads_typed_properties() {
        let item = CatalogItem::from_item(&stac_item()).unwrap();
        assert_eq!(item.collection.as_deref(), Some("sentinel-2-l2a"));
        assert_eq!(item.cloud_cover(), Some(0.42));
        assert_eq!(item.no_data_percentage(), Some(3.5));
        assert_eq!(item.tile_id(), Some("10SDJ"));
        assert!(item.properties.datetime.is_some());
        assert_eq!(
            item.properties.additional_fields.get("platform"),
            Some(&json!("Sentinel-2A"))
        );
        assert_eq!(
            item.asset_href("B02"),
            Some("https://example.blob.core.windows.net/s2/T10SDJ_B02_10m.tif")
        );
        assert_eq!(item.asset_href("B08"), None);
    }

    #[test]
    fn test_number_falls_back_to_additional_fields() {
        let mut item = CatalogItem::new("a");
        item.properties
            .additional_fields
            .insert("view:sun_elevation".to_string(), json!(61.5));
        item.properties.no_data_percentage = Some(1.0);
        assert_eq!(item.properties.number("view:sun_elevation"), Some(61.5));
        assert_eq!(item.properties.number(NO_DATA_PERCENTAGE), Some(1.0));
        assert_eq!(item.properties.number("missing"), None);
    }

    #[test]
    fn test_tile_id_from_grid_code() {
        let mut item = CatalogItem::new("b");
        item.properties
            .additional_fields
            .insert(GRID_CODE.to_string(), json!("MGRS-10SDJ"));
        assert_eq!(item.tile_id(), Some("10SDJ"));
    }
}
