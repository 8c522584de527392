use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::fetch::{FetchRequest, Fetcher};
use crate::node::ParentContext;
use crate::stream::{AdaptiveBridge, ResolveRequest, StreamDescriptor};

/// What an updater gets to work with when completing a leaf.
#[derive(Clone)]
pub struct UpdateContext {
    fetcher: Arc<dyn Fetcher>,
    bridge: AdaptiveBridge,
    parent: Option<ParentContext>,
}

impl UpdateContext {
    pub fn new(fetcher: Arc<dyn Fetcher>, bridge: AdaptiveBridge) -> Self {
        Self {
            fetcher,
            bridge,
            parent: None,
        }
    }

    #[must_use]
    pub fn with_parent(mut self, parent: Option<ParentContext>) -> Self {
        self.parent = parent;
        self
    }

    pub fn fetcher(&self) -> &dyn Fetcher {
        self.fetcher.as_ref()
    }

    pub fn bridge(&self) -> &AdaptiveBridge {
        &self.bridge
    }

    /// Context of the folder the leaf was expanded from, if known.
    pub fn parent(&self) -> Option<&ParentContext> {
        self.parent.as_ref()
    }

    /// GET `url` and return the body, failing on non-2xx statuses.
    pub async fn fetch_text(&self, url: &str, headers: &BTreeMap<String, String>) -> Result<String> {
        let response = self
            .fetcher
            .fetch(FetchRequest::get(url).with_headers(headers.clone()))
            .await?;
        if !response.is_success() {
            return Err(Error::HttpStatus {
                url: url.to_string(),
                status: response.status,
            });
        }
        Ok(response.text())
    }

    /// Resolve a manifest through the adaptive bridge.
    pub async fn resolve_streams(&self, request: ResolveRequest) -> Result<Vec<StreamDescriptor>> {
        self.bridge.resolve_streams(self.fetcher.as_ref(), request).await
    }
}

impl std::fmt::Debug for UpdateContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateContext")
            .field("bridge", &self.bridge)
            .field("parent", &self.parent)
            .finish_non_exhaustive()
    }
}
