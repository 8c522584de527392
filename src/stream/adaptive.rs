//! Adaptive playback / license bridge.
//!
//! Decides whether a manifest goes to a native adaptive engine (the only
//! route for DRM protected content) or gets expanded into one stream per
//! HLS variant. The engine itself is external; an [`AdaptiveEngine`] only
//! describes what it can play.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::fetch::Fetcher;

use super::descriptor::{AdaptiveProperties, KeyType, LicenseDescriptor, StreamDescriptor, Transport};
use super::hls::{self, HlsManifest, HlsOptions, UrlJoin};

/// Capabilities of a native adaptive playback engine.
pub trait AdaptiveEngine: Send + Sync {
    /// Engine identifier, copied into [`AdaptiveProperties::engine`].
    fn name(&self) -> &str;

    /// Returns `true` if the engine can play this transport.
    fn can_handle(&self, transport: Transport, encrypted: bool) -> bool;
}

/// Engine whose capabilities come from configuration.
#[derive(Debug, Clone)]
pub struct DeclaredEngine {
    name: String,
    hls: bool,
    dash: bool,
    drm: bool,
}

impl DeclaredEngine {
    pub fn new(name: impl Into<String>, hls: bool, dash: bool, drm: bool) -> Self {
        Self {
            name: name.into(),
            hls,
            dash,
            drm,
        }
    }

    /// `None` when the configuration names no engine.
    pub fn from_config(config: &Config) -> Option<Self> {
        let adaptive = &config.adaptive;
        adaptive
            .engine
            .as_ref()
            .map(|name| Self::new(name.clone(), adaptive.hls, adaptive.dash, adaptive.drm))
    }
}

impl AdaptiveEngine for DeclaredEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn can_handle(&self, transport: Transport, encrypted: bool) -> bool {
        let transport_ok = match transport {
            Transport::Hls => self.hls,
            Transport::Dash => self.dash,
            Transport::Progressive => false,
        };
        transport_ok && (!encrypted || self.drm)
    }
}

/// Options for a stream handed to the native engine.
#[derive(Debug, Clone, Default)]
pub struct PlayableStreamOptions {
    /// Headers for every request (manifest and segments).
    pub headers: BTreeMap<String, String>,
    /// Query parameters for segment requests.
    pub params: Option<String>,
    pub license: Option<LicenseDescriptor>,
    pub max_bitrate_kbps: Option<u32>,
    pub persist_storage: bool,
    pub service_certificate: Option<String>,
    pub manifest_headers: BTreeMap<String, String>,
    pub manifest_params: Option<String>,
}

impl PlayableStreamOptions {
    #[must_use]
    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    #[must_use]
    pub fn with_license(mut self, license: LicenseDescriptor) -> Self {
        self.license = Some(license);
        self
    }

    #[must_use]
    pub fn with_max_bitrate(mut self, kbps: u32) -> Self {
        self.max_bitrate_kbps = Some(kbps);
        self
    }
}

/// Everything needed to turn a manifest URL into playable streams.
#[derive(Debug, Clone, Default)]
pub struct ResolveRequest {
    pub manifest_url: String,
    /// Pre-fetched manifest text; fetched on demand otherwise.
    pub manifest_text: Option<String>,
    /// The source marks the content as DRM protected.
    pub drm_required: bool,
    pub hls: HlsOptions,
    pub subtitle_language: Option<String>,
    pub playable: PlayableStreamOptions,
}

impl ResolveRequest {
    pub fn new(manifest_url: impl Into<String>) -> Self {
        Self {
            manifest_url: manifest_url.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.manifest_text = Some(text.into());
        self
    }

    #[must_use]
    pub fn drm_required(mut self, required: bool) -> Self {
        self.drm_required = required;
        self
    }

    #[must_use]
    pub fn with_hls(mut self, options: HlsOptions) -> Self {
        self.hls = options;
        self
    }

    #[must_use]
    pub fn with_subtitles(mut self, language: impl Into<String>) -> Self {
        self.subtitle_language = Some(language.into());
        self
    }

    #[must_use]
    pub fn with_playable(mut self, options: PlayableStreamOptions) -> Self {
        self.playable = options;
        self
    }
}

/// Format a license key descriptor: `key_url|headers|key_value|json_filter`.
///
/// `{KID}` / `{SSM}` placeholders in `key_value` are left for the engine.
pub fn format_license_key(
    key_url: &str,
    key_type: KeyType,
    key_headers: Option<&BTreeMap<String, String>>,
    key_value: Option<&str>,
    json_filter: Option<&str>,
) -> Result<String> {
    let mut license = LicenseDescriptor::new(key_url, key_type, key_value)?;
    if let Some(headers) = key_headers {
        license = license.with_headers(headers.clone());
    }
    if let Some(filter) = json_filter {
        license = license.with_json_filter(filter);
    }
    Ok(license.to_key_string())
}

/// Bridge between manifests and the (optional) native adaptive engine.
#[derive(Clone, Default)]
pub struct AdaptiveBridge {
    engine: Option<Arc<dyn AdaptiveEngine>>,
    prefer_native: bool,
    url_join: UrlJoin,
}

impl AdaptiveBridge {
    pub fn new(engine: Option<Arc<dyn AdaptiveEngine>>) -> Self {
        Self {
            engine,
            prefer_native: false,
            url_join: UrlJoin::Standard,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let engine = DeclaredEngine::from_config(config).map(|e| Arc::new(e) as Arc<dyn AdaptiveEngine>);
        Self {
            engine,
            prefer_native: config.adaptive.prefer_native,
            url_join: config.hls.url_join,
        }
    }

    #[must_use]
    pub fn with_prefer_native(mut self, prefer: bool) -> Self {
        self.prefer_native = prefer;
        self
    }

    #[must_use]
    pub fn with_url_join(mut self, join: UrlJoin) -> Self {
        self.url_join = join;
        self
    }

    pub fn engine(&self) -> Option<&dyn AdaptiveEngine> {
        self.engine.as_deref()
    }

    fn engine_for(&self, transport: Transport, encrypted: bool) -> Option<&dyn AdaptiveEngine> {
        self.engine().filter(|e| e.can_handle(transport, encrypted))
    }

    /// Descriptor for native adaptive playback of `manifest_url`.
    pub fn build_playable_stream(&self, manifest_url: &str, options: PlayableStreamOptions) -> StreamDescriptor {
        let engine = self.engine().map_or_else(|| "adaptive".to_string(), |e| e.name().to_string());
        let transport = match Transport::from_url(manifest_url) {
            Transport::Dash => Transport::Dash,
            _ => Transport::Hls,
        };

        let mut stream = StreamDescriptor::new(manifest_url, 0, transport).with_headers(options.headers);
        stream.license = options.license;
        stream.adaptive = Some(AdaptiveProperties {
            engine,
            max_bitrate_kbps: options.max_bitrate_kbps,
            persist_storage: options.persist_storage,
            service_certificate: options.service_certificate,
            manifest_headers: options.manifest_headers,
            manifest_params: options.manifest_params,
            stream_params: options.params,
        });
        stream
    }

    /// Resolve a manifest into playable streams.
    ///
    /// DRM protected content (flagged, licensed, or with an encrypted
    /// manifest) is only ever handed to a DRM capable engine; without one
    /// this fails with [`Error::UnsupportedDrm`]. Unencrypted HLS is
    /// expanded into one stream per variant unless native playback is
    /// preferred. An empty manifest yields an empty list.
    pub async fn resolve_streams(&self, fetcher: &dyn Fetcher, request: ResolveRequest) -> Result<Vec<StreamDescriptor>> {
        let url = request.manifest_url.clone();
        let transport = Transport::from_url(&url);
        let flagged = request.drm_required || request.playable.license.is_some();

        if flagged {
            return match self.engine_for(transport, true) {
                Some(engine) => {
                    info!(url = %url, engine = engine.name(), "DRM stream handed to adaptive engine");
                    Ok(vec![self.build_playable_stream(&url, request.playable)])
                }
                None => Err(Error::UnsupportedDrm { url }),
            };
        }

        match transport {
            Transport::Progressive => {
                let stream = StreamDescriptor::new(&url, 0, Transport::Progressive)
                    .with_headers(request.playable.headers);
                Ok(vec![stream])
            }
            Transport::Dash => match self.engine_for(Transport::Dash, false) {
                Some(_) => Ok(vec![self.build_playable_stream(&url, request.playable)]),
                None => Err(Error::NoAdaptiveEngine { url }),
            },
            Transport::Hls => {
                if self.prefer_native && request.manifest_text.is_none() && self.engine_for(Transport::Hls, false).is_some() {
                    debug!(url = %url, "native HLS playback preferred");
                    return Ok(vec![self.build_playable_stream(&url, request.playable)]);
                }
                self.expand_hls(fetcher, request).await
            }
        }
    }

    async fn expand_hls(&self, fetcher: &dyn Fetcher, request: ResolveRequest) -> Result<Vec<StreamDescriptor>> {
        let url = request.manifest_url.clone();
        let manifest = match request.manifest_text {
            Some(text) => HlsManifest::new(&url, text),
            None => {
                let mut headers = request.playable.headers.clone();
                headers.extend(request.playable.manifest_headers.clone());
                HlsManifest::fetch(fetcher, &url, &headers).await?
            }
        };

        if manifest.is_drm_protected() {
            return match self.engine_for(Transport::Hls, true) {
                Some(engine) => {
                    info!(url = %url, engine = engine.name(), "encrypted manifest handed to adaptive engine");
                    Ok(vec![self.build_playable_stream(&url, request.playable)])
                }
                None => Err(Error::UnsupportedDrm { url }),
            };
        }

        if self.prefer_native && self.engine_for(Transport::Hls, false).is_some() {
            return Ok(vec![self.build_playable_stream(&url, request.playable)]);
        }

        let options = request.hls.with_url_join(self.url_join);
        let subtitle = request
            .subtitle_language
            .as_deref()
            .map(|lang| manifest.subtitle(Some(lang), &options))
            .filter(|s| !s.is_empty());
        let variants = hls::ranked(manifest.variants(&options));
        info!(url = %url, variants = variants.len(), "expanded HLS manifest");

        Ok(hls::to_streams(variants, &request.playable.headers, subtitle.as_deref()))
    }
}

impl std::fmt::Debug for AdaptiveBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveBridge")
            .field("engine", &self.engine().map(|e| e.name()))
            .field("prefer_native", &self.prefer_native)
            .field("url_join", &self.url_join)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::MemoryFetcher;

    const MASTER_URL: &str = "https://cdn.example/v/master.m3u8";
    const MASTER: &str = "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1204000\nc2.m3u8\n#EXT-X-STREAM-INF:BANDWIDTH=2504000\nc1.m3u8\n";

    fn drm_engine() -> Arc<dyn AdaptiveEngine> {
        Arc::new(DeclaredEngine::new("isa", true, true, true))
    }

    fn clear_engine() -> Arc<dyn AdaptiveEngine> {
        Arc::new(DeclaredEngine::new("isa", true, true, false))
    }

    #[test]
    fn format_license_key_keeps_kid() {
        let mut headers = BTreeMap::new();
        headers.insert("Authorization".to_string(), "Bearer a b".to_string());
        let key = format_license_key(
            "https://lic.example/wv",
            KeyType::Raw,
            Some(&headers),
            Some("TOK{KID}"),
            None,
        )
        .unwrap();
        assert_eq!(key, "https://lic.example/wv|Authorization=Bearer%20a%20b|TOK{KID}|");
        assert!(key.contains("{KID}"));
    }

    #[test]
    fn format_license_key_with_filter() {
        let key = format_license_key("https://lic", KeyType::Base64, None, None, Some("JBlicense")).unwrap();
        assert_eq!(key, "https://lic||B{SSM}|JBlicense");
    }

    #[test]
    fn build_playable_stream_carries_options() {
        let bridge = AdaptiveBridge::new(Some(drm_engine()));
        let license = LicenseDescriptor::new("https://lic", KeyType::Raw, None).unwrap();
        let stream = bridge.build_playable_stream(
            "https://cdn.example/a/manifest.mpd",
            PlayableStreamOptions::default().with_license(license).with_max_bitrate(5000),
        );
        assert_eq!(stream.transport, Transport::Dash);
        let adaptive = stream.adaptive.as_ref().unwrap();
        assert_eq!(adaptive.engine, "isa");
        assert_eq!(adaptive.max_bitrate_kbps, Some(5000));
        assert!(stream.license.is_some());
    }

    #[tokio::test]
    async fn drm_without_engine_fails_fast() {
        let fetcher = MemoryFetcher::new().with_response(MASTER_URL, 200, MASTER);
        for bridge in [AdaptiveBridge::new(None), AdaptiveBridge::new(Some(clear_engine()))] {
            let err = bridge
                .resolve_streams(&fetcher, ResolveRequest::new(MASTER_URL).drm_required(true))
                .await
                .unwrap_err();
            assert!(matches!(err, Error::UnsupportedDrm { .. }));
        }
        // never fell back to fetching the manifest
        assert!(fetcher.fetch_log().is_empty());
    }

    #[tokio::test]
    async fn encrypted_manifest_needs_drm_engine() {
        let text = "#EXTM3U\n#EXT-X-SESSION-KEY:METHOD=SAMPLE-AES,URI=\"skd://x\"\n#EXT-X-STREAM-INF:BANDWIDTH=1000\na.m3u8\n";
        let fetcher = MemoryFetcher::new().with_response(MASTER_URL, 200, text);

        let err = AdaptiveBridge::new(None)
            .resolve_streams(&fetcher, ResolveRequest::new(MASTER_URL))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedDrm { .. }));

        let streams = AdaptiveBridge::new(Some(drm_engine()))
            .resolve_streams(&fetcher, ResolveRequest::new(MASTER_URL))
            .await
            .unwrap();
        assert_eq!(streams.len(), 1);
        assert!(streams[0].is_adaptive());
    }

    #[tokio::test]
    async fn aes_128_manifest_expands_without_engine() {
        let text = "#EXTM3U\n#EXT-X-SESSION-KEY:METHOD=AES-128,URI=\"https://keys.example/k\"\n\
            #EXT-X-STREAM-INF:BANDWIDTH=800000\nlo.m3u8\n\
            #EXT-X-STREAM-INF:BANDWIDTH=2400000\nhi.m3u8\n";
        let fetcher = MemoryFetcher::new().with_response(MASTER_URL, 200, text);

        let streams = AdaptiveBridge::new(None)
            .resolve_streams(&fetcher, ResolveRequest::new(MASTER_URL))
            .await
            .unwrap();
        assert_eq!(streams.len(), 2);
        assert_eq!(streams[0].bitrate_kbps, 2400);
        assert!(!streams[0].is_adaptive());
    }

    #[tokio::test]
    async fn drm_with_engine_goes_native() {
        let fetcher = MemoryFetcher::new();
        let streams = AdaptiveBridge::new(Some(drm_engine()))
            .resolve_streams(&fetcher, ResolveRequest::new(MASTER_URL).drm_required(true))
            .await
            .unwrap();
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].url, MASTER_URL);
    }

    #[tokio::test]
    async fn clear_hls_expands_ranked() {
        let fetcher = MemoryFetcher::new().with_response(MASTER_URL, 200, MASTER);
        let streams = AdaptiveBridge::new(None)
            .resolve_streams(&fetcher, ResolveRequest::new(MASTER_URL))
            .await
            .unwrap();
        let got: Vec<(&str, u32)> = streams.iter().map(|s| (s.url.as_str(), s.bitrate_kbps)).collect();
        assert_eq!(
            got,
            vec![
                ("https://cdn.example/v/c1.m3u8", 2504),
                ("https://cdn.example/v/c2.m3u8", 1204)
            ]
        );
        assert!(streams.iter().all(|s| s.transport == Transport::Hls && !s.is_adaptive()));
    }

    #[tokio::test]
    async fn prefer_native_skips_expansion() {
        let fetcher = MemoryFetcher::new();
        let bridge = AdaptiveBridge::new(Some(clear_engine())).with_prefer_native(true);
        let streams = bridge
            .resolve_streams(&fetcher, ResolveRequest::new(MASTER_URL))
            .await
            .unwrap();
        assert_eq!(streams.len(), 1);
        assert!(streams[0].is_adaptive());
        assert!(fetcher.fetch_log().is_empty());
    }

    #[tokio::test]
    async fn dash_without_engine_is_an_error() {
        let fetcher = MemoryFetcher::new();
        let err = AdaptiveBridge::new(None)
            .resolve_streams(&fetcher, ResolveRequest::new("https://cdn.example/a.mpd"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoAdaptiveEngine { .. }));
    }

    #[tokio::test]
    async fn empty_manifest_yields_no_streams() {
        let fetcher = MemoryFetcher::new();
        let streams = AdaptiveBridge::new(None)
            .resolve_streams(&fetcher, ResolveRequest::new(MASTER_URL).with_text("#EXTM3U\n"))
            .await
            .unwrap();
        assert!(streams.is_empty());
    }

    #[tokio::test]
    async fn manifest_http_error_propagates() {
        let fetcher = MemoryFetcher::new().with_response(MASTER_URL, 403, "");
        let err = AdaptiveBridge::new(None)
            .resolve_streams(&fetcher, ResolveRequest::new(MASTER_URL))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::HttpStatus { status: 403, .. }));
    }
}
