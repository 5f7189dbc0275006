//! Best-product search over a list of MGRS tiles.
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use crate::date_range::DateRange;
use crate::error::{Error, Result, Stage, StageFailure};
use crate::image_selection::ImageSelection;
use crate::item::{CatalogItem, CLOUD_COVER};
use crate::provider::ProviderKind;
use crate::search::CatalogSearchClient;
use crate::stac_operations::{Operator, SearchQuery, SortBy, StacApi};

pub const PRODUCT_LIST: &str = "product_list.txt";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BestProduct {
    pub id: String,
    pub cloud_cover: Option<f64>,
    pub no_data: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TileOutcome {
    Found(BestProduct),
    /// Products exist, but none covers the tile well enough.
    Incomplete,
    /// The search failed or found nothing.
    Failed(String),
}

/// Per-tile results, split the way they are written to disk.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TileSearchResults {
    pub successful: BTreeMap<String, BestProduct>,
    pub incomplete: Vec<String>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResultFiles {
    pub data: PathBuf,
    pub incomplete: Option<PathBuf>,
    pub errors: Option<PathBuf>,
}

#[derive(Serialize)]
struct IncompleteTiles<'a> {
    incomplete: &'a [String],
}

#[derive(Serialize)]
struct FailedTiles<'a> {
    errors: &'a [String],
}

impl TileSearchResults {
    pub fn record(&mut self, tile: &str, outcome: TileOutcome) {
        match outcome {
            TileOutcome::Found(product) => {
                self.successful.insert(tile.to_owned(), product);
            }
            TileOutcome::Incomplete => self.incomplete.push(tile.to_owned()),
            TileOutcome::Failed(_) => self.errors.push(tile.to_owned()),
        }
    }

    /// Distinct best product ids, sorted.
    pub fn product_ids(&self) -> Vec<String> {
        self.successful
            .values()
            .map(|product| product.id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Writes `data_lt<cc>cc.json`, plus `incomplete_lt<cc>cc.json` and
    /// `errors_lt<cc>cc.json` when those lists are not empty.
    pub fn write(&self, output_dir: &Path, max_cloud_cover: f64) -> Result<ResultFiles> {
        fs::create_dir_all(output_dir)?;

        let data = output_dir.join(format!("data_lt{max_cloud_cover}cc.json"));
        fs::write(&data, serde_json::to_string_pretty(&self.successful)?)?;
        info!("Results have been written to {}", data.display());

        let mut files = ResultFiles {
            data,
            incomplete: None,
            errors: None,
        };
        if !self.incomplete.is_empty() {
            let path = output_dir.join(format!("incomplete_lt{max_cloud_cover}cc.json"));
            let content = serde_json::to_string_pretty(&IncompleteTiles {
                incomplete: &self.incomplete,
            })?;
            fs::write(&path, content)?;
            info!("Incomplete results have been written to {}", path.display());
            files.incomplete = Some(path);
        }
        if !self.errors.is_empty() {
            let path = output_dir.join(format!("errors_lt{max_cloud_cover}cc.json"));
            fs::write(&path, serde_json::to_string_pretty(&FailedTiles { errors: &self.errors })?)?;
            info!("Error results have been written to {}", path.display());
            files.errors = Some(path);
        }
        Ok(files)
    }

    /// One product id per line.
    pub fn write_product_list(&self, path: &Path) -> Result<()> {
        let mut content = self.product_ids().join("\n");
        content.push('\n');
        fs::write(path, content)?;
        info!("Product list written to {}", path.display());
        Ok(())
    }
}

/// Product ids from a `.txt` file (one per line) or a comma-separated list.
pub fn parse_product_list(products: &str) -> Result<Vec<String>> {
    let content;
    let ids: Vec<&str> = if products.ends_with(".txt") {
        content = fs::read_to_string(products)?;
        content.lines().collect()
    } else {
        products.split(',').collect()
    };
    Ok(ids
        .into_iter()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_owned)
        .collect())
}

/// Finds the clearest sufficiently complete product for each tile.
pub struct ProductSearch<A> {
    client: CatalogSearchClient<A>,
    provider: ProviderKind,
    collection: String,
    date_ranges: Vec<DateRange>,
    max_cloud_cover: f64,
    no_data_property: String,
    max_no_data: f64,
    page_limit: u32,
}

impl<A: StacApi> ProductSearch<A> {
    pub fn new(api: A, selection: &ImageSelection) -> Result<Self> {
        Ok(Self {
            client: CatalogSearchClient::new(api),
            provider: selection.provider,
            collection: selection.collection.clone(),
            date_ranges: selection.date_ranges()?,
            max_cloud_cover: selection.max_cloud_cover,
            no_data_property: selection.no_data_property.clone(),
            max_no_data: selection.max_no_data,
            page_limit: selection.page_limit,
        })
    }

    /// Searches the configured period for `tile` and picks the clearest
    /// product passing the no-data threshold.
    ///
    /// A failed or empty search fails at [`Stage::Search`]; results that all
    /// fail the threshold fail at [`Stage::Select`] with
    /// [`Error::NoResults`]. The failure is reported under the tile id.
    pub async fn select(&self, tile: &str) -> std::result::Result<CatalogItem, StageFailure> {
        let query = SearchQuery::new()
            .with(CLOUD_COVER, Operator::Lt, self.max_cloud_cover)
            .merge(&self.provider.tile_filter(tile));
        let sortby = [SortBy::asc(&format!("properties.{CLOUD_COVER}"))];

        let mut session = self
            .client
            .search(&self.date_ranges, &self.collection, &query, &sortby, self.page_limit)
            .await
            .map_err(|failure| StageFailure::new(tile, Stage::Search, failure))?;
        if session.is_empty() {
            return Err(StageFailure::new(tile, Stage::Search, Error::EmptySearch));
        }

        session.sort_by_cloud_cover();
        session.filter_no_data(&self.no_data_property, self.max_no_data);
        let best = session
            .best()
            .map_err(|e| StageFailure::new(tile, Stage::Select, e))?;
        Ok(best.clone())
    }

    pub async fn best_for_tile(&self, tile: &str) -> TileOutcome {
        match self.select(tile).await {
            Ok(best) => TileOutcome::Found(BestProduct {
                no_data: best.properties.number(&self.no_data_property),
                cloud_cover: best.cloud_cover(),
                id: best.id,
            }),
            Err(StageFailure {
                stage: Stage::Select,
                source: Error::NoResults,
                ..
            }) => TileOutcome::Incomplete,
            Err(failure) => TileOutcome::Failed(format!("{failure}: {}", failure.source)),
        }
    }

    /// Searches every tile in turn.
    pub async fn run(&self, tiles: &[String]) -> TileSearchResults {
        let mut results = TileSearchResults::default();
        for tile in tiles {
            let outcome = self.best_for_tile(tile).await;
            match &outcome {
                TileOutcome::Found(product) => info!("Best product for {tile}: {}", product.id),
                TileOutcome::Incomplete => warn!("No product covers tile {tile} entirely"),
                TileOutcome::Failed(reason) => warn!("Search for tile {tile} failed: {reason}"),
            }
            results.record(tile, outcome);
        }

        if !results.incomplete.is_empty() {
            warn!(
                "Some tiles have no product covering them entirely, a mosaic would be needed: {:?}",
                results.incomplete
            );
        }
        if !results.errors.is_empty() {
            warn!(
                "No products found for some tiles, \
                 consider a longer period or a higher cloud cover: {:?}",
                results.errors
            );
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::MGRS_TILE;
    use crate::planetary_computer::sentinel2l2a;
    use crate::stac_operations::SearchRequest;
    use crate::transport::TransportError;
    use serde_json::{json, Value};
    use stac::{Item, ItemCollection, Link};
    use std::collections::HashMap;

    fn stac_item(id: &str, cloud_cover: f64, no_data: f64) -> Item {
        serde_json::from_value(json!({
            "type": "Feature",
            "stac_version": "1.0.0",
            "id": id,
            "geometry": null,
            "properties": {
                "datetime": "2024-06-10T00:00:00Z",
                "eo:cloud_cover": cloud_cover,
                "s2:nodata_pixel_percentage": no_data
            },
            "links": [],
            "assets": {}
        }))
        .unwrap()
    }

    /// Answers by tile; tiles without an entry get a server error.
    #[derive(Default)]
    struct TileApi {
        tiles: HashMap<String, Vec<Item>>,
    }

    impl StacApi for TileApi {
        async fn search(
            &self,
            request: &SearchRequest,
        ) -> std::result::Result<ItemCollection, TransportError> {
            let tile = request
                .query
                .get(MGRS_TILE, Operator::In)
                .and_then(|tiles| tiles.get(0))
                .and_then(Value::as_str)
                .unwrap_or_default();
            let features = self.tiles.get(tile).cloned().ok_or(TransportError::Status {
                url: "canned://search".to_string(),
                status: 503,
            })?;
            Ok(ItemCollection::from(features))
        }

        async fn next_page(
            &self,
            _request: &SearchRequest,
            link: &Link,
        ) -> std::result::Result<ItemCollection, TransportError> {
            Err(TransportError::Status {
                url: link.href.clone(),
                status: 404,
            })
        }
    }

    fn selection() -> ImageSelection {
        let mut selection =
            ImageSelection::from_template(&sentinel2l2a::image_selection_toml()).unwrap();
        selection.period.start_year = 2024;
        selection.period.end_year = 2024;
        selection.max_cloud_cover = 1.0;
        selection
    }

    fn api() -> TileApi {
        let mut api = TileApi::default();
        api.tiles.insert(
            "10SDJ".to_string(),
            vec![
                stac_item("cloudy", 0.9, 0.0),
                stac_item("partial", 0.1, 60.0),
                stac_item("best", 0.3, 2.0),
            ],
        );
        api.tiles
            .insert("10SEJ".to_string(), vec![stac_item("edge", 0.2, 80.0)]);
        api.tiles.insert("10SFJ".to_string(), vec![]);
        api
    }

    #[tokio::test]
    async fn test_tiles_are_classified() {
        let search = ProductSearch::new(api(), &selection()).unwrap();
        let tiles = ["10SDJ", "10SEJ", "10SFJ", "11SKA"].map(String::from).to_vec();
        let results = search.run(&tiles).await;

        assert_eq!(
            results.successful.get("10SDJ"),
            Some(&BestProduct {
                id: "best".to_string(),
                cloud_cover: Some(0.3),
                no_data: Some(2.0),
            })
        );
        assert_eq!(results.incomplete, vec!["10SEJ"]);
        assert_eq!(results.errors, vec!["10SFJ", "11SKA"]);
        assert_eq!(results.product_ids(), vec!["best"]);
    }

    #[tokio::test]
    async fn test_query_carries_cloud_cover_and_tile() {
        let search = ProductSearch::new(api(), &selection()).unwrap();
        assert!(matches!(search.best_for_tile("10SDJ").await, TileOutcome::Found(_)));
        assert!(matches!(search.best_for_tile("10SFJ").await, TileOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn test_failures_are_tagged_with_their_stage() {
        let search = ProductSearch::new(api(), &selection()).unwrap();

        let failure = search.select("11SKA").await.unwrap_err();
        assert_eq!(failure.item_id, "11SKA");
        assert_eq!(failure.stage, Stage::Search);
        assert!(matches!(failure.source, Error::Search(_)));

        let failure = search.select("10SFJ").await.unwrap_err();
        assert_eq!(failure.stage, Stage::Search);
        assert!(matches!(failure.source, Error::EmptySearch));

        let failure = search.select("10SEJ").await.unwrap_err();
        assert_eq!(failure.stage, Stage::Select);
        assert!(matches!(failure.source, Error::NoResults));

        assert_eq!(search.select("10SDJ").await.unwrap().id, "best");
    }

    #[test]
    fn test_parse_product_list() {
        assert_eq!(parse_product_list("a, b,,c").unwrap(), vec!["a", "b", "c"]);

        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join(PRODUCT_LIST);
        fs::write(&list, "S2A_1\n\n  S2B_2  \n").unwrap();
        let ids = parse_product_list(list.to_str().unwrap()).unwrap();
        assert_eq!(ids, vec!["S2A_1", "S2B_2"]);

        assert!(parse_product_list(dir.path().join("missing.txt").to_str().unwrap()).is_err());
    }

    #[test]
    fn test_result_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut results = TileSearchResults::default();
        let product = |id: &str| BestProduct {
            id: id.to_string(),
            cloud_cover: Some(0.5),
            no_data: Some(0.0),
        };
        results.record("10SDJ", TileOutcome::Found(product("S2B_B")));
        results.record("10SEJ", TileOutcome::Found(product("S2A_A")));
        results.record("10SFJ", TileOutcome::Found(product("S2A_A")));
        results.record("10SGJ", TileOutcome::Incomplete);

        let files = results.write(dir.path(), 15.0).unwrap();
        assert_eq!(files.data, dir.path().join("data_lt15cc.json"));
        assert_eq!(files.incomplete, Some(dir.path().join("incomplete_lt15cc.json")));
        assert_eq!(files.errors, None);

        let data: Value = serde_json::from_str(&fs::read_to_string(&files.data).unwrap()).unwrap();
        assert_eq!(data["10SDJ"], json!({"id": "S2B_B", "cloud_cover": 0.5, "no_data": 0.0}));
        let incomplete: Value =
            serde_json::from_str(&fs::read_to_string(files.incomplete.unwrap()).unwrap()).unwrap();
        assert_eq!(incomplete, json!({"incomplete": ["10SGJ"]}));

        let list = dir.path().join(PRODUCT_LIST);
        results.write_product_list(&list).unwrap();
        assert_eq!(fs::read_to_string(list).unwrap(), "S2A_A\nS2B_B\n");
    }
}
