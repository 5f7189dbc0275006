use chrono::{DateTime, Duration, Utc};
use log::{debug, info};
use serde::Deserialize;
use stac::{ItemCollection, Link};
use std::collections::HashMap;
use std::sync::Mutex;
use url::Url;

use super::sentinel2l2a::COLLECTION;
use super::{API_ROOT, SAS_ENDPOINT};
use crate::item::CatalogItem;
use crate::stac_operations::{SearchRequest, StacApi, StacClient};
use crate::transport::TransportError;

const BLOB_HOST_SUFFIX: &str = ".blob.core.windows.net";
/// Tokens this close to expiry are replaced before use.
const REFRESH_MARGIN_MINUTES: i64 = 5;

#[derive(Debug, Clone, Deserialize)]
struct SasToken {
    token: String,
    #[serde(rename = "msft:expiry")]
    expiry: DateTime<Utc>,
}

impl SasToken {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now + Duration::minutes(REFRESH_MARGIN_MINUTES) < self.expiry
    }
}

/// Planetary Computer STAC API. Asset hrefs on Azure blob storage are
/// signed with a per-collection SAS token, cached until shortly before it
/// expires.
pub struct PlanetaryComputer {
    client: reqwest::Client,
    stac: StacClient,
    tokens: Mutex<HashMap<String, SasToken>>,
}

impl PlanetaryComputer {
    pub fn new(client: reqwest::Client) -> Result<Self, TransportError> {
        let stac = StacClient::new(client.clone(), API_ROOT)?;
        Ok(Self {
            client,
            stac,
            tokens: Mutex::new(HashMap::new()),
        })
    }

    fn cached_token(&self, collection: &str) -> Option<String> {
        let tokens = self.tokens.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        tokens
            .get(collection)
            .filter(|token| token.is_fresh(Utc::now()))
            .map(|token| token.token.clone())
    }

    async fn token(&self, collection: &str) -> Result<String, TransportError> {
        if let Some(token) = self.cached_token(collection) {
            return Ok(token);
        }

        let url = format!("{SAS_ENDPOINT}/{collection}");
        debug!("Requesting SAS token: GET {url}");
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                url,
                status: status.as_u16(),
            });
        }
        let token = response.json::<SasToken>().await?;
        info!("New SAS token for {collection}, valid until {}", token.expiry);

        let value = token.token.clone();
        self.tokens
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(collection.to_owned(), token);
        Ok(value)
    }
}

/// Appends `token` to `href` when it points at Azure blob storage and is not
/// signed yet.
fn sign_href(href: &str, token: &str) -> Option<String> {
    let url = Url::parse(href).ok()?;
    if !url.host_str()?.ends_with(BLOB_HOST_SUFFIX) {
        return None;
    }
    if url.query_pairs().any(|(key, _)| key == "sig") {
        return None;
    }
    let separator = if url.query().is_some() { '&' } else { '?' };
    Some(format!("{href}{separator}{token}"))
}

fn needs_signing(href: &str) -> bool {
    sign_href(href, "").is_some()
}

impl StacApi for PlanetaryComputer {
    async fn search(&self, request: &SearchRequest) -> Result<ItemCollection, TransportError> {
        self.stac.search(request).await
    }

    async fn next_page(
        &self,
        request: &SearchRequest,
        link: &Link,
    ) -> Result<ItemCollection, TransportError> {
        self.stac.next_page(request, link).await
    }

    async fn sign_item(&self, item: &mut CatalogItem) -> Result<(), TransportError> {
        if !item.assets.values().any(|href| needs_signing(href)) {
            return Ok(());
        }
        let collection = item.collection.as_deref().unwrap_or(COLLECTION);
        let token = self.token(collection).await?;
        for href in item.assets.values_mut() {
            if let Some(signed) = sign_href(href, &token) {
                *href = signed;
            }
        }
        Ok(())
    }
}
