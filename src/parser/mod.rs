//! Declarative per-URL parser definitions.
//!
//! Site plugins describe each page type they understand as a
//! [`ParserDefinition`]: which URLs it applies to, how the payload is cut
//! into rows, and the callbacks that turn rows into [`ContentNode`]s or
//! complete a leaf.
//!
//! # Example
//!
//! ```rust
//! use channelkit::node::ContentNode;
//! use channelkit::parser::{MatchType, ParserDefinition, ParserRegistry, PathStep};
//!
//! # fn main() -> channelkit::Result<()> {
//! let mut registry = ParserRegistry::new();
//! registry.register(
//!     ParserDefinition::new("programs", "https://tv.example/api/programs", MatchType::Exact)
//!         .with_json_items(vec![PathStep::key("items")])
//!         .with_creator(|_parent, row| {
//!             let name = row.str("title").unwrap_or_default();
//!             let url = row.str("url").unwrap_or_default();
//!             Ok(Some(ContentNode::folder(name, url)))
//!         }),
//! )?;
//!
//! assert_eq!(registry.resolve("https://tv.example/api/programs")?.label(), "programs");
//! # Ok(())
//! # }
//! ```

mod context;
mod registry;
mod rows;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use regex::Regex;
use serde_json::Value;

use crate::node::{ContentNode, ParentContext};

pub use context::UpdateContext;
pub use registry::ParserRegistry;
pub(crate) use rows::parse_rows;

/// How a definition's pattern is compared against a URL.
///
/// Listed from highest to lowest dispatch precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchType {
    Exact,
    /// Substring; the longest matching pattern wins.
    Contains,
    /// Suffix; the longest matching suffix wins.
    End,
    Regex,
    /// `*`, used only when nothing else matched.
    Wildcard,
}

/// Payload format expected by the structural parse.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ContentKind {
    #[default]
    Raw,
    Json,
}

/// One step of a JSON item path.
#[derive(Debug, Clone, PartialEq)]
pub enum PathStep {
    Key(String),
    Index(usize),
    /// Within an array keep the elements whose `field == value`, then take
    /// `index` of those, or all of them.
    Select {
        field: String,
        value: Value,
        index: Option<usize>,
    },
}

impl PathStep {
    pub fn key(key: impl Into<String>) -> Self {
        Self::Key(key.into())
    }

    pub fn index(index: usize) -> Self {
        Self::Index(index)
    }

    pub fn select(field: impl Into<String>, value: impl Into<Value>, index: Option<usize>) -> Self {
        Self::Select {
            field: field.into(),
            value: value.into(),
            index,
        }
    }
}

/// How the payload is cut into rows.
#[derive(Debug, Clone, Default)]
pub enum ItemParser {
    /// No structural rows (pre/postprocessor only pages).
    #[default]
    None,
    /// Regex with (preferably named) groups; one row per match.
    Regex(String),
    JsonPath(Vec<PathStep>),
}

/// A structural parse result handed to a creator.
#[derive(Debug, Clone, PartialEq)]
pub enum Row {
    Json(Value),
    /// Regex groups by name; unnamed groups are keyed by their index.
    Captures(BTreeMap<String, String>),
}

impl Row {
    /// String field of a JSON object row, or a regex group.
    pub fn str(&self, key: &str) -> Option<&str> {
        match self {
            Self::Json(value) => value.get(key).and_then(Value::as_str),
            Self::Captures(groups) => groups.get(key).map(String::as_str),
        }
    }

    /// Nested JSON value by RFC 6901 pointer (`/a/0/b`).
    pub fn pointer(&self, pointer: &str) -> Option<&Value> {
        match self {
            Self::Json(value) => value.pointer(pointer),
            Self::Captures(_) => None,
        }
    }

    pub fn json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            Self::Captures(_) => None,
        }
    }
}

pub type Creator = Arc<dyn Fn(&ParentContext, &Row) -> anyhow::Result<Option<ContentNode>> + Send + Sync>;
pub type Preprocessor = Arc<dyn Fn(&str) -> anyhow::Result<(String, Vec<ContentNode>)> + Send + Sync>;
pub type Postprocessor = Arc<dyn Fn(&str, Vec<ContentNode>) -> anyhow::Result<Vec<ContentNode>> + Send + Sync>;
pub type Updater =
    Arc<dyn Fn(UpdateContext, ContentNode) -> BoxFuture<'static, anyhow::Result<ContentNode>> + Send + Sync>;

/// Dispatch rule and pipeline for one kind of page.
#[derive(Clone)]
pub struct ParserDefinition {
    label: String,
    pattern: String,
    match_type: MatchType,
    content_kind: ContentKind,
    item_parser: ItemParser,
    creator: Option<Creator>,
    preprocessor: Option<Preprocessor>,
    postprocessor: Option<Postprocessor>,
    updater: Option<Updater>,
    requires_logon: bool,
    headers: BTreeMap<String, String>,
    // Filled in by the registry.
    pub(crate) url_regex: Option<Regex>,
    pub(crate) item_regex: Option<Regex>,
}

impl ParserDefinition {
    pub fn new(label: impl Into<String>, pattern: impl Into<String>, match_type: MatchType) -> Self {
        Self {
            label: label.into(),
            pattern: pattern.into(),
            match_type,
            content_kind: ContentKind::Raw,
            item_parser: ItemParser::None,
            creator: None,
            preprocessor: None,
            postprocessor: None,
            updater: None,
            requires_logon: false,
            headers: BTreeMap::new(),
            url_regex: None,
            item_regex: None,
        }
    }

    /// Catch-all definition.
    pub fn wildcard(label: impl Into<String>) -> Self {
        Self::new(label, "*", MatchType::Wildcard)
    }

    #[must_use]
    pub fn with_content_kind(mut self, kind: ContentKind) -> Self {
        self.content_kind = kind;
        self
    }

    /// Rows from regex matches over the raw payload.
    #[must_use]
    pub fn with_regex_items(mut self, pattern: impl Into<String>) -> Self {
        self.item_parser = ItemParser::Regex(pattern.into());
        self
    }

    /// Rows from a JSON path; switches the content kind to JSON.
    #[must_use]
    pub fn with_json_items(mut self, path: Vec<PathStep>) -> Self {
        self.item_parser = ItemParser::JsonPath(path);
        self.content_kind = ContentKind::Json;
        self
    }

    #[must_use]
    pub fn with_creator<F>(mut self, creator: F) -> Self
    where
        F: Fn(&ParentContext, &Row) -> anyhow::Result<Option<ContentNode>> + Send + Sync + 'static,
    {
        self.creator = Some(Arc::new(creator));
        self
    }

    #[must_use]
    pub fn with_preprocessor<F>(mut self, preprocessor: F) -> Self
    where
        F: Fn(&str) -> anyhow::Result<(String, Vec<ContentNode>)> + Send + Sync + 'static,
    {
        self.preprocessor = Some(Arc::new(preprocessor));
        self
    }

    #[must_use]
    pub fn with_postprocessor<F>(mut self, postprocessor: F) -> Self
    where
        F: Fn(&str, Vec<ContentNode>) -> anyhow::Result<Vec<ContentNode>> + Send + Sync + 'static,
    {
        self.postprocessor = Some(Arc::new(postprocessor));
        self
    }

    /// Leaf completion callback.
    ///
    /// ```rust
    /// use channelkit::parser::{MatchType, ParserDefinition};
    /// use channelkit::stream::ResolveRequest;
    ///
    /// let def = ParserDefinition::new("video", "/video/", MatchType::Contains).with_updater(|ctx, mut node| {
    ///     Box::pin(async move {
    ///         let streams = ctx.resolve_streams(ResolveRequest::new(format!("{}/master.m3u8", node.url))).await?;
    ///         node.add_streams(streams);
    ///         anyhow::Ok(node)
    ///     })
    /// });
    /// assert!(def.has_updater());
    /// ```
    #[must_use]
    pub fn with_updater<F>(mut self, updater: F) -> Self
    where
        F: Fn(UpdateContext, ContentNode) -> BoxFuture<'static, anyhow::Result<ContentNode>> + Send + Sync + 'static,
    {
        self.updater = Some(Arc::new(updater));
        self
    }

    #[must_use]
    pub fn requires_logon(mut self, required: bool) -> Self {
        self.requires_logon = required;
        self
    }

    /// Extra request headers for fetching matching pages.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn match_type(&self) -> MatchType {
        self.match_type
    }

    pub fn content_kind(&self) -> ContentKind {
        self.content_kind
    }

    pub fn item_parser(&self) -> &ItemParser {
        &self.item_parser
    }

    pub fn needs_logon(&self) -> bool {
        self.requires_logon
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn has_updater(&self) -> bool {
        self.updater.is_some()
    }

    pub(crate) fn creator(&self) -> Option<&Creator> {
        self.creator.as_ref()
    }

    pub(crate) fn preprocessor(&self) -> Option<&Preprocessor> {
        self.preprocessor.as_ref()
    }

    pub(crate) fn postprocessor(&self) -> Option<&Postprocessor> {
        self.postprocessor.as_ref()
    }

    pub(crate) fn updater(&self) -> Option<&Updater> {
        self.updater.as_ref()
    }

    /// Whether this definition's pattern applies to `url` at all.
    pub(crate) fn matches(&self, url: &str) -> bool {
        match self.match_type {
            MatchType::Exact => url == self.pattern,
            MatchType::Contains => url.contains(&self.pattern),
            MatchType::End => url.ends_with(&self.pattern),
            MatchType::Regex => self.url_regex.as_ref().is_some_and(|re| re.is_match(url)),
            MatchType::Wildcard => true,
        }
    }

    pub(crate) fn same_key(&self, other: &Self) -> bool {
        self.match_type == other.match_type && self.pattern == other.pattern
    }
}

impl fmt::Debug for ParserDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParserDefinition")
            .field("label", &self.label)
            .field("pattern", &self.pattern)
            .field("match_type", &self.match_type)
            .field("content_kind", &self.content_kind)
            .field("item_parser", &self.item_parser)
            .field("preprocessor", &self.preprocessor.is_some())
            .field("postprocessor", &self.postprocessor.is_some())
            .field("updater", &self.updater.is_some())
            .field("requires_logon", &self.requires_logon)
            .finish_non_exhaustive()
    }
}
