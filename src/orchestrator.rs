//! Fetch and parse pipeline.
//!
//! Folders are expanded by fetch → preprocess → structural parse → create →
//! postprocess. Leaves are completed by their definition's updater.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::auth::AuthGate;
use crate::config::Config;
use crate::error::{Error, ProcessorStage, Result};
use crate::fetch::{FetchRequest, Fetcher};
use crate::node::ContentNode;
use crate::parser::{parse_rows, ParserDefinition, ParserRegistry, UpdateContext};
use crate::stream::AdaptiveBridge;

/// A structural row the creator could not turn into a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowFailure {
    /// Label of the definition that produced the row.
    pub parser: String,
    pub index: usize,
    pub reason: String,
}

/// Children of an expansion plus the rows that were dropped.
#[derive(Debug, Default)]
pub struct Expansion {
    pub children: Vec<ContentNode>,
    pub failures: Vec<RowFailure>,
}

/// Per-leaf result of [`Orchestrator::complete_all`].
#[derive(Debug)]
pub enum LeafOutcome {
    Completed(ContentNode),
    /// Resolution failed; the original node is returned.
    Failed { node: ContentNode, error: Error },
    /// Cancelled before or during resolution; the original node is returned.
    Cancelled(ContentNode),
}

impl LeafOutcome {
    pub fn node(&self) -> &ContentNode {
        match self {
            Self::Completed(node) | Self::Failed { node, .. } | Self::Cancelled(node) => node,
        }
    }

    pub fn into_node(self) -> ContentNode {
        match self {
            Self::Completed(node) | Self::Failed { node, .. } | Self::Cancelled(node) => node,
        }
    }
}

/// Drives node expansion and completion against a parser registry.
pub struct Orchestrator {
    registry: Arc<ParserRegistry>,
    fetcher: Arc<dyn Fetcher>,
    auth: Option<Arc<AuthGate>>,
    bridge: AdaptiveBridge,
    workers: usize,
}

impl Orchestrator {
    pub fn new(registry: ParserRegistry, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            registry: Arc::new(registry),
            fetcher,
            auth: None,
            bridge: AdaptiveBridge::default(),
            workers: 4,
        }
    }

    /// Orchestrator with bridge and worker settings from `config`.
    pub fn from_config(registry: ParserRegistry, fetcher: Arc<dyn Fetcher>, config: &Config) -> Self {
        Self::new(registry, fetcher)
            .with_bridge(AdaptiveBridge::from_config(config))
            .with_workers(config.orchestrator.workers)
    }

    #[must_use]
    pub fn with_auth(mut self, gate: Arc<AuthGate>) -> Self {
        self.auth = Some(gate);
        self
    }

    #[must_use]
    pub fn with_bridge(mut self, bridge: AdaptiveBridge) -> Self {
        self.bridge = bridge;
        self
    }

    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn registry(&self) -> &ParserRegistry {
        &self.registry
    }

    async fn ensure_logon(&self, chain: &[&ParserDefinition], url: &str) -> Result<()> {
        if !chain.iter().any(|def| def.needs_logon()) {
            return Ok(());
        }
        match &self.auth {
            Some(gate) => gate.ensure_logged_on(url).await,
            None => Err(Error::LogonRequired { url: url.to_string() }),
        }
    }

    async fn fetch_payload(&self, def: &ParserDefinition, url: &str) -> Result<String> {
        let request = FetchRequest::get(url).with_headers(def.headers().clone());
        let response = self.fetcher.fetch(request).await?;
        if !response.is_success() {
            return Err(Error::HttpStatus {
                url: url.to_string(),
                status: response.status,
            });
        }
        Ok(response.text())
    }

    /// Children of `node`, dropping rows the creators reject.
    pub async fn expand(&self, node: &ContentNode) -> Result<Vec<ContentNode>> {
        Ok(self.expand_report(node).await?.children)
    }

    /// Expand `node`, returning the children and the dropped rows.
    #[instrument(skip(self, node), fields(url = %node.url))]
    pub async fn expand_report(&self, node: &ContentNode) -> Result<Expansion> {
        let url = node.url.as_str();
        let chain = self.registry.resolve_chain(url)?;
        let primary = chain[0];
        self.ensure_logon(&chain, url).await?;

        let payload = self.fetch_payload(primary, url).await?;

        let (payload, mut children) = match primary.preprocessor() {
            Some(pre) => pre(&payload).map_err(|source| Error::ProcessorFailed {
                stage: ProcessorStage::Preprocessor,
                url: url.to_string(),
                source,
            })?,
            None => (payload, Vec::new()),
        };
        if !children.is_empty() {
            debug!(extra = children.len(), "preprocessor added nodes");
        }

        let parent = node.context();
        let mut failures = Vec::new();
        for def in &chain {
            let rows = parse_rows(def, url, &payload)?;
            let Some(creator) = def.creator() else {
                if !rows.is_empty() {
                    debug!(parser = def.label(), rows = rows.len(), "no creator, rows ignored");
                }
                continue;
            };

            for (index, row) in rows.iter().enumerate() {
                let reason = match creator(&parent, row) {
                    Ok(Some(child)) => {
                        children.push(child);
                        continue;
                    }
                    Ok(None) => "creator produced no node".to_string(),
                    Err(e) => format!("{e:#}"),
                };
                warn!(parser = def.label(), index, %reason, "dropping row");
                failures.push(RowFailure {
                    parser: def.label().to_string(),
                    index,
                    reason,
                });
            }
        }

        if let Some(post) = primary.postprocessor() {
            children = post(&payload, children).map_err(|source| Error::ProcessorFailed {
                stage: ProcessorStage::Postprocessor,
                url: url.to_string(),
                source,
            })?;
        }

        for child in &mut children {
            child.set_parent(parent.clone());
        }

        info!(parser = primary.label(), children = children.len(), dropped = failures.len(), "expanded node");
        Ok(Expansion { children, failures })
    }

    /// Expand `node` in place. The folder is complete only if it got children.
    pub async fn expand_into(&self, node: &mut ContentNode) -> Result<Vec<RowFailure>> {
        let Expansion { children, failures } = self.expand_report(node).await?;
        node.set_children(children);
        Ok(failures)
    }

    /// Resolve a leaf's streams through its updater.
    ///
    /// A leaf that ends up with no streams is returned incomplete.
    #[instrument(skip(self, node), fields(url = %node.url))]
    pub async fn complete(&self, node: ContentNode) -> Result<ContentNode> {
        if node.is_complete() {
            debug!("already complete");
            return Ok(node);
        }

        let url = node.url.clone();
        let chain = self.registry.resolve_chain(&url)?;
        let Some((def, updater)) = chain.iter().find_map(|def| def.updater().map(|u| (def, u))) else {
            return Err(Error::NoUpdater { url });
        };
        self.ensure_logon(&chain, &url).await?;

        let parent = node.parent().cloned();
        let context = UpdateContext::new(self.fetcher.clone(), self.bridge.clone()).with_parent(parent.clone());
        debug!(parser = def.label(), "running updater");

        let mut updated = updater(context, node).await.map_err(|e| match e.downcast::<Error>() {
            Ok(typed) => typed,
            Err(source) => Error::UpdaterFailed { url: url.clone(), source },
        })?;

        if updated.parent().is_none() {
            if let Some(parent) = parent {
                updated.set_parent(parent);
            }
        }

        if updated.set_complete(true) {
            info!(streams = updated.streams().len(), "completed leaf");
        } else {
            warn!("updater produced no streams, leaving node incomplete");
        }
        Ok(updated)
    }

    /// Complete sibling leaves with bounded concurrency, in input order.
    ///
    /// After `cancel` fires no new resolution starts. Resolutions already
    /// running finish, but their results are discarded.
    pub async fn complete_all(&self, nodes: Vec<ContentNode>, cancel: &CancellationToken) -> Vec<LeafOutcome> {
        let total = nodes.len();
        let outcomes: Vec<LeafOutcome> = stream::iter(nodes)
            .map(|node| async move {
                if cancel.is_cancelled() {
                    return LeafOutcome::Cancelled(node);
                }
                let original = node.clone();
                let result = self.complete(node).await;
                if cancel.is_cancelled() {
                    return LeafOutcome::Cancelled(original);
                }
                match result {
                    Ok(node) => LeafOutcome::Completed(node),
                    Err(error) => {
                        warn!(url = %original.url, %error, "leaf resolution failed");
                        LeafOutcome::Failed { node: original, error }
                    }
                }
            })
            .buffered(self.workers)
            .collect()
            .await;

        let completed = outcomes.iter().filter(|o| matches!(o, LeafOutcome::Completed(_))).count();
        info!(total, completed, cancelled = cancel.is_cancelled(), "batch resolution finished");
        outcomes
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("parsers", &self.registry.len())
            .field("auth", &self.auth.is_some())
            .field("bridge", &self.bridge)
            .field("workers", &self.workers)
            .finish_non_exhaustive()
    }
}
