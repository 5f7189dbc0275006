use stac::{ItemCollection, Link};

use crate::stac_operations::{SearchRequest, StacApi, StacClient};
use crate::transport::TransportError;

use super::API_ROOT;

/// Element84 Earth Search. Assets are public, so items are used as found.
pub struct EarthSearch {
    stac: StacClient,
}

impl EarthSearch {
    pub fn new(client: reqwest::Client) -> Result<Self, TransportError> {
        Ok(Self {
            stac: StacClient::new(client, API_ROOT)?,
        })
    }
}

impl StacApi for EarthSearch {
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
}
