//! `channelkit` - shared core for broadcaster channel plugins
//!
//! # Features
//!
//! - **Dispatch**: declarative URL patterns route each page to its parser
//! - **Content tree**: lazily resolved folders and playable leaves
//! - **HLS**: master playlist parsing into bitrate-ranked streams, audio
//!   group mapping and subtitle discovery
//! - **Adaptive bridge**: license key descriptors and the decision between
//!   native adaptive playback and manifest expansion
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use channelkit::{Config, ContentNode, HttpFetcher, Orchestrator, ParserRegistry};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     let registry = ParserRegistry::new();
//!     let fetcher = Arc::new(HttpFetcher::new(&config.fetch)?);
//!     let orchestrator = Orchestrator::from_config(registry, fetcher, &config);
//!
//!     let mut root = ContentNode::folder("Programs", "https://tv.example/programs");
//!     orchestrator.expand_into(&mut root).await?;
//!     println!("{} programs", root.children().len());
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod config;
pub mod error;
pub mod fetch;
pub mod node;
pub mod orchestrator;
pub mod parser;
pub mod stream;

pub use auth::{AuthGate, Authenticator, Credential, Session};
pub use config::Config;
pub use error::{Error, Result};
pub use fetch::{FetchRequest, FetchResponse, Fetcher, HttpFetcher, MemoryFetcher, ResponseCache};
pub use node::{ContentNode, NodeSnapshot, ParentContext};
pub use orchestrator::{Expansion, LeafOutcome, Orchestrator, RowFailure};
pub use parser::{MatchType, ParserDefinition, ParserRegistry, PathStep, Row, UpdateContext};
pub use stream::{AdaptiveBridge, HlsManifest, HlsOptions, LicenseDescriptor, StreamDescriptor, Transport};

/// Version of channelkit
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
