//! Multi-range catalog search and quality-based selection of its results.
use log::{debug, info, warn};
use serde_json::Value;

use crate::date_range::DateRange;
use crate::error::{Error, Result, SearchFailure};
use crate::item::CatalogItem;
use crate::stac_operations::{catalog_items, next_link, SearchQuery, SearchRequest, SortBy, StacApi};
use crate::transport::TransportError;

pub const DEFAULT_PAGE_LIMIT: u32 = 100;

#[derive(Debug, Clone, PartialEq)]
struct NoDataFilter {
    property: String,
    max_value: f64,
}

impl NoDataFilter {
    fn keeps(&self, item: &CatalogItem) -> bool {
        item.properties
            .number(&self.property)
            .is_some_and(|value| value <= self.max_value)
    }
}

/// Outcome of [`SearchSession::filter_no_data`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterReport {
    pub kept: usize,
    pub missing_property: usize,
    pub above_threshold: usize,
}

impl FilterReport {
    pub fn excluded(&self) -> usize {
        self.missing_property + self.above_threshold
    }
}

/// Every item found for one logical search, in search order until sorted.
///
/// The filtered view is derived from the raw list and the filters applied so
/// far. Filters only accumulate, so an item excluded once stays excluded.
#[derive(Debug, Clone, Default)]
pub struct SearchSession {
    items: Vec<CatalogItem>,
    filters: Vec<NoDataFilter>,
}

impl SearchSession {
    pub fn new(items: Vec<CatalogItem>) -> Self {
        Self {
            items,
            filters: vec![],
        }
    }

    pub fn items(&self) -> &[CatalogItem] {
        &self.items
    }

    pub fn into_items(self) -> Vec<CatalogItem> {
        self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn extend(&mut self, items: Vec<CatalogItem>) {
        self.items.extend(items);
    }

    /// Stable ascending sort on cloud cover. Items without a cloud cover
    /// value go last.
    pub fn sort_by_cloud_cover(&mut self) {
        info!("Sorting {} results by cloud cover (from least to most)", self.items.len());
        self.items.sort_by(|a, b| {
            let a = a.cloud_cover().unwrap_or(f64::INFINITY);
            let b = b.cloud_cover().unwrap_or(f64::INFINITY);
            a.total_cmp(&b)
        });
    }

    /// Restricts the filtered view to items whose `property` is at most
    /// `max_value`. Items lacking the property are excluded and counted.
    pub fn filter_no_data(&mut self, property: &str, max_value: f64) -> FilterReport {
        let filter = NoDataFilter {
            property: property.to_owned(),
            max_value,
        };

        let mut report = FilterReport::default();
        for item in self.items.iter().filter(|item| self.passes(item)) {
            match item.properties.number(property) {
                None => report.missing_property += 1,
                Some(value) if value > max_value => report.above_threshold += 1,
                Some(_) => report.kept += 1,
            }
        }
        self.filters.push(filter);

        if report.missing_property > 0 {
            warn!(
                "{} item(s) have no '{property}' property and were excluded",
                report.missing_property
            );
        }
        info!(
            "Kept {} item(s) with {property} <= {max_value}, excluded {}",
            report.kept,
            report.excluded()
        );
        report
    }

    fn passes(&self, item: &CatalogItem) -> bool {
        self.filters.iter().all(|filter| filter.keeps(item))
    }

    /// Items passing every filter applied so far, in current list order.
    pub fn filtered(&self) -> Vec<&CatalogItem> {
        self.items.iter().filter(|item| self.passes(item)).collect()
    }

    /// First item of the filtered view.
    pub fn best(&self) -> Result<&CatalogItem> {
        self.items
            .iter()
            .find(|item| self.passes(item))
            .ok_or(Error::NoResults)
    }
}

/// Runs one catalog query per date range and gathers the results.
pub struct CatalogSearchClient<A> {
    api: A,
    bbox: Option<[f64; 4]>,
    intersects: Option<Value>,
    max_items: Option<usize>,
}

impl<A: StacApi> CatalogSearchClient<A> {
    pub fn new(api: A) -> Self {
        Self {
            api,
            bbox: None,
            intersects: None,
            max_items: None,
        }
    }

    pub fn with_bbox(mut self, bbox: [f64; 4]) -> Self {
        self.bbox = Some(bbox);
        self
    }

    pub fn with_intersects(mut self, geometry: Value) -> Self {
        self.intersects = Some(geometry);
        self
    }

    /// Caps the number of items kept per date range.
    pub fn with_max_items(mut self, max_items: usize) -> Self {
        self.max_items = Some(max_items);
        self
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    /// Searches `collection` once per range, exhausting pagination.
    ///
    /// Stops at the first range whose query fails; the returned
    /// [`SearchFailure`] names that range and holds what earlier ranges found.
    pub async fn search(
        &self,
        date_ranges: &[DateRange],
        collection: &str,
        query: &SearchQuery,
        sortby: &[SortBy],
        page_limit: u32,
    ) -> std::result::Result<SearchSession, Box<SearchFailure>> {
        info!(
            "Searching {collection} over {} date range(s), query: {}",
            date_ranges.len(),
            serde_json::to_string(query).unwrap_or_default()
        );

        let mut session = SearchSession::default();
        for range in date_ranges {
            let request = SearchRequest {
                collections: vec![collection.to_owned()],
                datetime: Some(range.to_string()),
                bbox: self.bbox,
                intersects: self.intersects.clone(),
                query: query.clone(),
                sortby: sortby.to_vec(),
                limit: Some(page_limit),
                ..Default::default()
            };

            match self.collect(&request).await {
                Ok(items) => {
                    info!("Search successful for date range [{range}]: {} item(s)", items.len());
                    session.extend(items);
                }
                Err(source) => {
                    warn!("Search failed for date range [{range}]: {source}");
                    return Err(Box::new(SearchFailure {
                        range: *range,
                        source,
                        partial: session,
                    }));
                }
            }
        }

        if session.is_empty() {
            warn!("Search found no results for {} date range(s)", date_ranges.len());
        }
        Ok(session)
    }

    fn is_full(&self, items: &[CatalogItem]) -> bool {
        self.max_items.is_some_and(|max| items.len() >= max)
    }

    async fn collect(
        &self,
        request: &SearchRequest,
    ) -> std::result::Result<Vec<CatalogItem>, TransportError> {
        let mut items = vec![];
        let mut page = self.api.search(request).await?;
        let mut page_count = 1;
        loop {
            for mut item in catalog_items(&page)? {
                if self.is_full(&items) {
                    return Ok(items);
                }
                self.api.sign_item(&mut item).await?;
                items.push(item);
            }
            if self.is_full(&items) {
                break;
            }

            let Some(next) = next_link(&page).cloned() else {
                break;
            };
            page_count += 1;
            let datetime = request.datetime.as_deref().unwrap_or("*");
            debug!("Fetching page {page_count} for {datetime}");
            page = self.api.next_page(request, &next).await?;
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::NO_DATA_PERCENTAGE;
    use crate::stac_operations::Operator;
    use serde_json::json;
    use stac::{Item, ItemCollection, Link};
    use std::cell::RefCell;
    use std::collections::HashMap;

    fn item(id: &str, cloud_cover: Option<f64>, no_data: Option<f64>) -> CatalogItem {
        let mut item = CatalogItem::new(id);
        item.properties.cloud_cover = cloud_cover;
        item.properties.no_data_percentage = no_data;
        item
    }

    fn ids(items: &[&CatalogItem]) -> Vec<String> {
        items.iter().map(|i| i.id.clone()).collect()
    }

    #[test]
    fn test_sort_is_ascending_and_stable() {
        let mut session = SearchSession::new(vec![
            item("a", Some(5.0), None),
            item("b", Some(1.0), None),
            item("c", None, None),
            item("d", Some(1.0), None),
            item("e", Some(0.5), None),
            item("f", Some(5.0), None),
        ]);
        session.sort_by_cloud_cover();

        let sorted: Vec<&str> = session.items().iter().map(|i| i.id.as_str()).collect();
        assert_eq!(sorted, vec!["e", "b", "d", "a", "f", "c"]);
        let covers: Vec<f64> = session
            .items()
            .iter()
            .map(|i| i.cloud_cover().unwrap_or(f64::INFINITY))
            .collect();
        assert!(covers.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_filter_reports_missing_and_excluded() {
        let mut session = SearchSession::new(vec![
            item("a", Some(0.1), Some(7.0)),
            item("b", Some(0.2), None),
            item("c", Some(0.3), Some(5.0)),
            item("d", Some(0.4), Some(0.0)),
        ]);

        let report = session.filter_no_data(NO_DATA_PERCENTAGE, 5.0);
        assert_eq!(
            report,
            FilterReport {
                kept: 2,
                missing_property: 1,
                above_threshold: 1
            }
        );
        assert_eq!(ids(&session.filtered()), vec!["c", "d"]);
        for kept in session.filtered() {
            assert!(kept.no_data_percentage().unwrap() <= 5.0);
        }
        assert_eq!(session.len(), 4);
    }

    #[test]
    fn test_filtering_never_reincludes() {
        let mut session = SearchSession::new(vec![
            item("a", Some(0.1), Some(7.0)),
            item("b", Some(0.2), Some(2.0)),
        ]);
        session.filter_no_data(NO_DATA_PERCENTAGE, 5.0);
        let report = session.filter_no_data(NO_DATA_PERCENTAGE, 50.0);
        assert_eq!(report.kept, 1);
        assert_eq!(ids(&session.filtered()), vec!["b"]);
    }

    #[test]
    fn test_best_is_lowest_cloud_cover_passing_filter() {
        let mut session = SearchSession::new(vec![
            item("cloudy", Some(0.9), Some(0.0)),
            item("clear-but-partial", Some(0.1), Some(40.0)),
            item("clear", Some(0.2), Some(1.0)),
        ]);
        session.sort_by_cloud_cover();
        session.filter_no_data(NO_DATA_PERCENTAGE, 5.0);
        assert_eq!(session.best().unwrap().id, "clear");
    }

    #[test]
    fn test_best_without_passing_items_is_an_error() {
        let mut session = SearchSession::new(vec![item("a", Some(0.1), Some(90.0))]);
        session.filter_no_data(NO_DATA_PERCENTAGE, 5.0);
        assert!(matches!(session.best(), Err(Error::NoResults)));
        assert!(matches!(SearchSession::default().best(), Err(Error::NoResults)));
    }

    fn stac_item(id: &str, cloud_cover: f64) -> Item {
        serde_json::from_value(json!({
            "type": "Feature",
            "stac_version": "1.0.0",
            "id": id,
            "geometry": null,
            "properties": {"datetime": "2024-06-10T00:00:00Z", "eo:cloud_cover": cloud_cover},
            "links": [],
            "assets": {}
        }))
        .unwrap()
    }

    /// Serves canned pages keyed by request datetime; a datetime without
    /// pages answers with a server error.
    #[derive(Default)]
    struct CannedApi {
        pages: HashMap<String, Vec<ItemCollection>>,
        requests: RefCell<Vec<SearchRequest>>,
    }

    impl CannedApi {
        fn page(
            &self,
            datetime: &str,
            index: usize,
        ) -> std::result::Result<ItemCollection, TransportError> {
            self.pages
                .get(datetime)
                .and_then(|pages| pages.get(index))
                .cloned()
                .ok_or(TransportError::Status {
                    url: format!("canned://{datetime}"),
                    status: 502,
                })
        }
    }

    impl StacApi for CannedApi {
        async fn search(
            &self,
            request: &SearchRequest,
        ) -> std::result::Result<ItemCollection, TransportError> {
            self.requests.borrow_mut().push(request.clone());
            self.page(request.datetime.as_deref().unwrap_or_default(), 0)
        }

        async fn next_page(
            &self,
            request: &SearchRequest,
            link: &Link,
        ) -> std::result::Result<ItemCollection, TransportError> {
            let index = link.href.parse().unwrap();
            self.page(request.datetime.as_deref().unwrap_or_default(), index)
        }
    }

    fn page(items: Vec<Item>, next: Option<usize>) -> ItemCollection {
        let mut page = ItemCollection::from(items);
        page.links.extend(next.map(|index| Link::new(index, "next")));
        page
    }

    fn ranges() -> Vec<DateRange> {
        crate::date_range::build(2023, 2024, 6, 7).unwrap()
    }

    #[tokio::test]
    async fn test_search_exhausts_pages_for_each_range() {
        let [first, second] = [ranges()[0].to_string(), ranges()[1].to_string()];
        let mut api = CannedApi::default();
        api.pages.insert(
            first.clone(),
            vec![
                page(vec![stac_item("a", 3.0)], Some(1)),
                page(vec![stac_item("b", 1.0)], None),
            ],
        );
        api.pages
            .insert(second.clone(), vec![page(vec![stac_item("c", 2.0)], None)]);

        let client = CatalogSearchClient::new(api);
        let query = SearchQuery::new().with("eo:cloud_cover", Operator::Lt, 5);
        let sortby = [SortBy::asc("properties.eo:cloud_cover")];
        let session = client
            .search(&ranges(), "sentinel-2-l2a", &query, &sortby, 1)
            .await
            .unwrap();

        let found: Vec<&str> = session.items().iter().map(|i| i.id.as_str()).collect();
        assert_eq!(found, vec!["a", "b", "c"]);

        let requests = client.api().requests.borrow();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].datetime.as_deref(), Some(first.as_str()));
        assert_eq!(requests[0].limit, Some(1));
        assert_eq!(requests[0].collections, vec!["sentinel-2-l2a".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_range_keeps_partial_results() {
        let first = ranges()[0].to_string();
        let mut api = CannedApi::default();
        api.pages.insert(first, vec![page(vec![stac_item("a", 3.0)], None)]);

        let client = CatalogSearchClient::new(api);
        let failure = client
            .search(&ranges(), "sentinel-2-l2a", &SearchQuery::new(), &[], 100)
            .await
            .unwrap_err();

        assert_eq!(failure.range, ranges()[1]);
        assert!(matches!(failure.source, TransportError::Status { status: 502, .. }));
        let partial = failure.into_partial();
        assert_eq!(partial.len(), 1);
        assert_eq!(partial.items()[0].id, "a");
    }

    #[tokio::test]
    async fn test_max_items_caps_each_range() {
        let first = ranges()[0].to_string();
        let mut api = CannedApi::default();
        let items = vec![stac_item("a", 3.0), stac_item("b", 1.0), stac_item("c", 2.0)];
        api.pages.insert(first, vec![page(items, Some(1))]);

        let client = CatalogSearchClient::new(api).with_max_items(2);
        let session = client
            .search(&ranges()[..1], "sentinel-2-l2a", &SearchQuery::new(), &[], 100)
            .await
            .unwrap();
        assert_eq!(session.len(), 2);
    }

    #[tokio::test]
    async fn test_full_page_does_not_follow_next_link() {
        let first = ranges()[0].to_string();
        let mut api = CannedApi::default();
        // Page 1 is missing, so following the link would fail the range.
        let items = vec![stac_item("a", 3.0), stac_item("b", 1.0)];
        api.pages.insert(first, vec![page(items, Some(1))]);

        let client = CatalogSearchClient::new(api).with_max_items(2);
        let session = client
            .search(&ranges()[..1], "sentinel-2-l2a", &SearchQuery::new(), &[], 2)
            .await
            .unwrap();
        let found: Vec<&str> = session.items().iter().map(|i| i.id.as_str()).collect();
        assert_eq!(found, vec!["a", "b"]);
    }
}
