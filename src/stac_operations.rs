use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use stac::{ItemCollection, Link, Links};
use std::collections::BTreeMap;
use url::Url;

use crate::item::CatalogItem;
use crate::transport::TransportError;

/// Comparison operators of the STAC API `query` extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    In,
}

/// Property filters, e.g. `{"eo:cloud_cover": {"lt": 15}, "s2:mgrs_tile": {"in": ["10SDJ"]}}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SearchQuery(BTreeMap<String, BTreeMap<Operator, Value>>);

impl SearchQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, property: &str, operator: Operator, value: impl Into<Value>) -> Self {
        self.0
            .entry(property.to_owned())
            .or_default()
            .insert(operator, value.into());
        self
    }

    pub fn merge(mut self, other: &SearchQuery) -> Self {
        for (property, comparisons) in &other.0 {
            let entry = self.0.entry(property.to_owned()).or_default();
            entry.extend(comparisons.iter().map(|(op, value)| (*op, value.clone())));
        }
        self
    }

    pub fn get(&self, property: &str, operator: Operator) -> Option<&Value> {
        self.0.get(property)?.get(&operator)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortBy {
    pub field: String,
    pub direction: Direction,
}

impl SortBy {
    pub fn asc(field: &str) -> Self {
        Self {
            field: field.to_owned(),
            direction: Direction::Asc,
        }
    }

    pub fn desc(field: &str) -> Self {
        Self {
            field: field.to_owned(),
            direction: Direction::Desc,
        }
    }
}

/// Body of a `POST /search` request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub collections: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datetime: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<[f64; 4]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intersects: Option<Value>,
    #[serde(default, skip_serializing_if = "SearchQuery::is_empty")]
    pub query: SearchQuery,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sortby: Vec<SortBy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

/// The `next` link of a search page, when the page is not empty.
pub fn next_link(page: &ItemCollection) -> Option<&Link> {
    if page.items.is_empty() {
        return None;
    }
    page.link("next")
}

pub fn catalog_items(page: &ItemCollection) -> Result<Vec<CatalogItem>, TransportError> {
    page.items
        .iter()
        .map(|item| CatalogItem::from_item(item).map_err(TransportError::from))
        .collect()
}

fn is_post(link: &Link) -> bool {
    link.method
        .as_deref()
        .is_some_and(|method| method.eq_ignore_ascii_case("POST"))
}

/// Body to send when following `link` from `request`. The link body replaces
/// the request unless the link asks for the two to be merged.
pub fn next_body(link: &Link, request: &SearchRequest) -> Result<Value, TransportError> {
    let merge = link.merge.unwrap_or(false);
    let mut body = match &link.body {
        Some(_) if !merge => Map::new(),
        _ => match serde_json::to_value(request)? {
            Value::Object(map) => map,
            _ => Map::new(),
        },
    };
    if let Some(link_body) = &link.body {
        body.extend(link_body.iter().map(|(k, v)| (k.to_owned(), v.clone())));
    }
    Ok(Value::Object(body))
}

/// A STAC API item search endpoint.
pub trait StacApi {
    async fn search(&self, request: &SearchRequest) -> Result<ItemCollection, TransportError>;

    /// Follows a `next` link of a page returned for `request`.
    async fn next_page(
        &self,
        request: &SearchRequest,
        link: &Link,
    ) -> Result<ItemCollection, TransportError>;

    /// Rewrites asset hrefs so they can be fetched; catalogs serving public
    /// assets leave the item untouched.
    async fn sign_item(&self, item: &mut CatalogItem) -> Result<(), TransportError> {
        let _ = item;
        Ok(())
    }
}

/// A plain STAC API served over HTTP.
#[derive(Debug, Clone)]
pub struct StacClient {
    client: reqwest::Client,
    search_url: Url,
}

impl StacClient {
    pub fn new(client: reqwest::Client, api_root: &str) -> Result<Self, TransportError> {
        let search_url = Url::parse(&format!("{}/search", api_root.trim_end_matches('/')))?;
        Ok(Self { client, search_url })
    }

    pub fn search_url(&self) -> &Url {
        &self.search_url
    }

    async fn post(&self, url: &str, body: &Value) -> Result<ItemCollection, TransportError> {
        debug!("POST {url} {body}");
        let response = self.client.post(url).json(body).send().await?;
        Self::read_page(url, response).await
    }

    async fn get(&self, url: &str) -> Result<ItemCollection, TransportError> {
        debug!("GET {url}");
        let response = self.client.get(url).send().await?;
        Self::read_page(url, response).await
    }

    async fn read_page(
        url: &str,
        response: reqwest::Response,
    ) -> Result<ItemCollection, TransportError> {
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                url: url.to_owned(),
                status: status.as_u16(),
            });
        }
        let page = response.json::<ItemCollection>().await?;
        Ok(page)
    }
}

impl StacApi for StacClient {
    async fn search(&self, request: &SearchRequest) -> Result<ItemCollection, TransportError> {
        let body = serde_json::to_value(request)?;
        self.post(self.search_url.as_str(), &body).await
    }

    async fn next_page(
        &self,
        request: &SearchRequest,
        link: &Link,
    ) -> Result<ItemCollection, TransportError> {
        if is_post(link) {
            let body = next_body(link, request)?;
            self.post(&link.href, &body).await
        } else {
            self.get(&link.href).await
        }
    }
}

/// Fetches the given item ids from one collection, following pagination.
pub async fn search_by_ids(
    api: &impl StacApi,
    collection: &str,
    ids: &[String],
) -> Result<Vec<CatalogItem>, TransportError> {
    let request = SearchRequest {
        collections: vec![collection.to_owned()],
        ids: ids.to_vec(),
        limit: Some(ids.len().clamp(1, 1000) as u32),
        ..Default::default()
    };

    let mut items = vec![];
    let mut page = api.search(&request).await?;
    loop {
        for mut item in catalog_items(&page)? {
            api.sign_item(&mut item).await?;
            items.push(item);
        }
        match next_link(&page).cloned() {
            Some(link) => page = api.next_page(&request, &link).await?,
            None => break,
        }
    }
    Ok(items)
}

/// Requested ids with no matching item, in request order.
pub fn missing_ids(ids: &[String], items: &[CatalogItem]) -> Vec<String> {
    ids.iter()
        .filter(|id| !items.iter().any(|item| &item.id == *id))
        .cloned()
        .collect()
}
