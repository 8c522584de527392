//! Content tree nodes.
//!
//! A [`ContentNode`] is either a folder (programs, seasons, listings) or a
//! leaf (a playable video). Nodes start incomplete and are resolved lazily:
//! folders by expansion, leaves by their updater. Completeness is private
//! and clamped so that a complete folder always has children and a complete
//! leaf always has streams.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::{Error, Result};
use crate::stream::StreamDescriptor;

/// Current [`NodeSnapshot`] format version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Non-owning view of a node's parent, for lookups from creators and
/// updaters (e.g. inheriting the show title or artwork).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParentContext {
    pub id: String,
    pub name: String,
    pub url: String,
    pub metadata: Map<String, Value>,
}

/// Folder or leaf payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum NodeKind {
    Folder {
        #[serde(default)]
        children: Vec<ContentNode>,
    },
    Leaf {
        #[serde(default)]
        streams: Vec<StreamDescriptor>,
    },
}

/// Deserialization goes through [`RawNode`], so the completeness clamp and
/// parent contexts hold for every decoded node, not only snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawNode")]
pub struct ContentNode {
    pub id: String,
    pub name: String,
    pub url: String,
    #[serde(default)]
    complete: bool,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub geo_locked: bool,
    #[serde(default)]
    pub is_paid: bool,
    #[serde(default)]
    pub is_drm_protected: bool,
    #[serde(default)]
    pub date: Option<NaiveDateTime>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(flatten)]
    kind: NodeKind,
    #[serde(skip)]
    parent: Option<ParentContext>,
}

/// Wire form of [`ContentNode`], trusted for nothing.
#[derive(Deserialize)]
struct RawNode {
    id: String,
    name: String,
    url: String,
    #[serde(default)]
    complete: bool,
    #[serde(default)]
    metadata: Map<String, Value>,
    #[serde(default)]
    geo_locked: bool,
    #[serde(default)]
    is_paid: bool,
    #[serde(default)]
    is_drm_protected: bool,
    #[serde(default)]
    date: Option<NaiveDateTime>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    thumbnail: Option<String>,
    #[serde(flatten)]
    kind: NodeKind,
}

impl From<RawNode> for ContentNode {
    fn from(raw: RawNode) -> Self {
        let mut node = Self {
            id: raw.id,
            name: raw.name,
            url: raw.url,
            complete: false,
            metadata: raw.metadata,
            geo_locked: raw.geo_locked,
            is_paid: raw.is_paid,
            is_drm_protected: raw.is_drm_protected,
            date: raw.date,
            description: raw.description,
            thumbnail: raw.thumbnail,
            kind: raw.kind,
            parent: None,
        };
        // children arrive already clamped; only their parent link is missing
        let context = node.context();
        if let NodeKind::Folder { children } = &mut node.kind {
            for child in children {
                child.parent = Some(context.clone());
            }
        }
        node.set_complete(raw.complete);
        node
    }
}

impl ContentNode {
    fn new(name: impl Into<String>, url: impl Into<String>, kind: NodeKind) -> Self {
        let url = url.into();
        Self {
            id: url.clone(),
            name: name.into(),
            url,
            complete: false,
            metadata: Map::new(),
            geo_locked: false,
            is_paid: false,
            is_drm_protected: false,
            date: None,
            description: String::new(),
            thumbnail: None,
            kind,
            parent: None,
        }
    }

    /// New, unexpanded folder. The id defaults to the URL.
    pub fn folder(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self::new(name, url, NodeKind::Folder { children: Vec::new() })
    }

    /// New, unresolved leaf. The id defaults to the URL.
    pub fn leaf(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self::new(name, url, NodeKind::Leaf { streams: Vec::new() })
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub fn with_thumbnail(mut self, thumbnail: impl Into<String>) -> Self {
        self.thumbnail = Some(thumbnail.into());
        self
    }

    #[must_use]
    pub fn with_date(mut self, date: NaiveDateTime) -> Self {
        self.date = Some(date);
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_drm(mut self, protected: bool) -> Self {
        self.is_drm_protected = protected;
        self
    }

    #[must_use]
    pub fn with_parent(mut self, parent: ParentContext) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn is_folder(&self) -> bool {
        matches!(self.kind, NodeKind::Folder { .. })
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, NodeKind::Leaf { .. })
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Request a completeness state. Completion is refused for an empty
    /// folder or a leaf without streams; returns the resulting state.
    pub fn set_complete(&mut self, complete: bool) -> bool {
        self.complete = complete && self.has_content();
        self.complete
    }

    fn has_content(&self) -> bool {
        match &self.kind {
            NodeKind::Folder { children } => !children.is_empty(),
            NodeKind::Leaf { streams } => !streams.is_empty(),
        }
    }

    /// Children of a folder; empty for leaves.
    pub fn children(&self) -> &[ContentNode] {
        match &self.kind {
            NodeKind::Folder { children } => children,
            NodeKind::Leaf { .. } => &[],
        }
    }

    /// Keep only the children matching `keep` (e.g. dropping geo-locked or
    /// paid items). A folder left empty becomes incomplete.
    pub fn retain_children(&mut self, keep: impl FnMut(&ContentNode) -> bool) {
        if let NodeKind::Folder { children } = &mut self.kind {
            children.retain(keep);
            if children.is_empty() {
                self.complete = false;
            }
        }
    }

    /// Streams of a leaf; empty for folders.
    pub fn streams(&self) -> &[StreamDescriptor] {
        match &self.kind {
            NodeKind::Leaf { streams } => streams,
            NodeKind::Folder { .. } => &[],
        }
    }

    /// Attach expanded children, pointing their parent context at this
    /// folder. The folder is complete only if at least one child arrived.
    pub fn set_children(&mut self, mut children: Vec<ContentNode>) {
        let context = self.context();
        match &mut self.kind {
            NodeKind::Folder { children: slot } => {
                for child in &mut children {
                    child.parent = Some(context.clone());
                }
                *slot = children;
                self.complete = !slot.is_empty();
            }
            NodeKind::Leaf { .. } => warn!(url = %self.url, "ignoring children for a leaf node"),
        }
    }

    /// Add a stream to a leaf. Does not mark the leaf complete.
    pub fn add_stream(&mut self, stream: StreamDescriptor) {
        self.add_streams([stream]);
    }

    pub fn add_streams(&mut self, new: impl IntoIterator<Item = StreamDescriptor>) {
        match &mut self.kind {
            NodeKind::Leaf { streams } => streams.extend(new),
            NodeKind::Folder { .. } => warn!(url = %self.url, "ignoring streams for a folder node"),
        }
    }

    /// Drop all streams; the leaf becomes incomplete.
    pub fn clear_streams(&mut self) {
        if let NodeKind::Leaf { streams } = &mut self.kind {
            streams.clear();
            self.complete = false;
        }
    }

    pub fn parent(&self) -> Option<&ParentContext> {
        self.parent.as_ref()
    }

    pub(crate) fn set_parent(&mut self, parent: ParentContext) {
        self.parent = Some(parent);
    }

    /// Snapshot of this node as a parent context for its children.
    pub fn context(&self) -> ParentContext {
        ParentContext {
            id: self.id.clone(),
            name: self.name.clone(),
            url: self.url.clone(),
            metadata: self.metadata.clone(),
        }
    }

    /// String metadata value, if present.
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

}

/// Versioned JSON form of a node tree, for favorites stores and caches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub version: u32,
    pub node: ContentNode,
}

#[derive(Deserialize)]
struct VersionProbe {
    version: u32,
}

impl NodeSnapshot {
    pub fn new(node: ContentNode) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            node,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Load a snapshot, checking the version before touching the node.
    pub fn from_json(json: &str) -> Result<ContentNode> {
        let probe: VersionProbe = serde_json::from_str(json)?;
        if probe.version == 0 || probe.version > SNAPSHOT_VERSION {
            return Err(Error::SnapshotVersion {
                found: probe.version,
                supported: SNAPSHOT_VERSION,
            });
        }

        let snapshot: NodeSnapshot = serde_json::from_str(json)?;
        Ok(snapshot.node)
    }
}
