//! Stream resolution: HLS master playlists, playable descriptors and the
//! native adaptive engine bridge.

pub mod adaptive;
pub mod descriptor;
pub mod hls;

pub use adaptive::{
    format_license_key, AdaptiveBridge, AdaptiveEngine, DeclaredEngine, PlayableStreamOptions, ResolveRequest,
};
pub use descriptor::{AdaptiveProperties, KeyType, LicenseDescriptor, StreamDescriptor, StreamQuality, Transport};
pub use hls::{HlsManifest, HlsOptions, UrlJoin, Variant};
