//! Playable stream descriptors and license descriptors.
//!
//! A [`StreamDescriptor`] is what a completed leaf node carries: one concrete
//! URL with its bitrate, transport and whatever the player needs to open it
//! (headers, subtitles, DRM license, native adaptive properties).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Delivery mechanism of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Transport {
    /// HLS playlist (`.m3u8`).
    Hls,
    /// MPEG-DASH manifest (`.mpd`).
    Dash,
    /// Single progressive file (mp4, mp3, ...).
    Progressive,
}

impl Transport {
    /// Guess the transport from a manifest or media URL.
    pub fn from_url(url: &str) -> Self {
        let path = url.split(['?', '#']).next().unwrap_or(url).to_ascii_lowercase();
        if path.ends_with(".m3u8") || path.ends_with(".m3u") {
            Self::Hls
        } else if path.ends_with(".mpd") || path.contains(".ism/") || path.ends_with(".ism") {
            Self::Dash
        } else {
            Self::Progressive
        }
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hls => write!(f, "hls"),
            Self::Dash => write!(f, "mpd"),
            Self::Progressive => write!(f, "progressive"),
        }
    }
}

/// How the adaptive engine encodes the server message placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyType {
    /// Raw challenge bytes (`R{SSM}`).
    Raw,
    /// Base64 encoded challenge (`B{SSM}`).
    Base64,
    /// Decimal byte list (`D{SSM}`), template must be supplied explicitly.
    Decimal,
}

impl KeyType {
    /// Prefix the engine uses for this encoding.
    pub fn prefix(self) -> char {
        match self {
            Self::Raw => 'R',
            Self::Base64 => 'B',
            Self::Decimal => 'D',
        }
    }

    /// Server message placeholder for this encoding, e.g. `R{SSM}`.
    pub fn placeholder(self) -> String {
        format!("{}{{SSM}}", self.prefix())
    }
}

/// License acquisition details handed to a native adaptive engine.
///
/// The template is kept verbatim: `{KID}` and `{SSM}` placeholders are
/// substituted by the engine at request time, never here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseDescriptor {
    pub key_url: String,
    pub key_type: KeyType,
    pub headers: BTreeMap<String, String>,
    pub key_value_template: String,
    pub json_filter: Option<String>,
}

impl LicenseDescriptor {
    /// Build a descriptor, applying the default template for `key_type` when
    /// no explicit `key_value` is given.
    pub fn new(key_url: impl Into<String>, key_type: KeyType, key_value: Option<&str>) -> Result<Self> {
        let key_value_template = match (key_type, key_value) {
            (KeyType::Decimal, Some(value)) if value.contains("D{SSM}") => value.to_string(),
            (KeyType::Decimal, Some(value)) => {
                return Err(Error::InvalidLicenseTemplate(format!(
                    "decimal key value '{value}' lacks the D{{SSM}} placeholder"
                )))
            }
            (KeyType::Decimal, None) => {
                return Err(Error::InvalidLicenseTemplate(
                    "decimal key type needs an explicit key value".to_string(),
                ))
            }
            (_, Some(value)) => value.to_string(),
            (kind, None) => kind.placeholder(),
        };

        Ok(Self {
            key_url: key_url.into(),
            key_type,
            headers: BTreeMap::new(),
            key_value_template,
            json_filter: None,
        })
    }

    #[must_use]
    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    #[must_use]
    pub fn with_json_filter(mut self, filter: impl Into<String>) -> Self {
        self.json_filter = Some(filter.into());
        self
    }

    /// Pipe-delimited `key_url|headers|template|json_filter` string.
    pub fn to_key_string(&self) -> String {
        let headers = self
            .headers
            .iter()
            .map(|(k, v)| format!("{k}={}", urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        format!(
            "{}|{}|{}|{}",
            self.key_url,
            headers,
            self.key_value_template,
            self.json_filter.as_deref().unwrap_or_default()
        )
    }
}

/// Properties passed through to a native adaptive engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdaptiveProperties {
    /// Engine identifier (from configuration).
    pub engine: String,
    /// Cap for the engine's bandwidth selection, in kbps.
    pub max_bitrate_kbps: Option<u32>,
    /// Let the engine persist DRM storage between sessions.
    pub persist_storage: bool,
    /// Base64 service certificate for license requests.
    pub service_certificate: Option<String>,
    /// Headers for manifest requests only.
    pub manifest_headers: BTreeMap<String, String>,
    /// Query parameters appended to manifest requests only.
    pub manifest_params: Option<String>,
    /// Query parameters appended to every stream request.
    pub stream_params: Option<String>,
}

/// A concrete playable stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub url: String,
    pub bitrate_kbps: u32,
    pub transport: Transport,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub subtitle: Option<String>,
    #[serde(default)]
    pub license: Option<LicenseDescriptor>,
    /// Separate audio rendition, when the manifest maps one.
    #[serde(default)]
    pub audio_url: Option<String>,
    #[serde(default)]
    pub adaptive: Option<AdaptiveProperties>,
}

impl StreamDescriptor {
    pub fn new(url: impl Into<String>, bitrate_kbps: u32, transport: Transport) -> Self {
        Self {
            url: url.into(),
            bitrate_kbps,
            transport,
            headers: BTreeMap::new(),
            subtitle: None,
            license: None,
            audio_url: None,
            adaptive: None,
        }
    }

    #[must_use]
    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    #[must_use]
    pub fn with_subtitle(mut self, subtitle: Option<String>) -> Self {
        self.subtitle = subtitle.filter(|s| !s.is_empty());
        self
    }

    #[must_use]
    pub fn with_license(mut self, license: LicenseDescriptor) -> Self {
        self.license = Some(license);
        self
    }

    #[must_use]
    pub fn with_audio(mut self, audio_url: Option<String>) -> Self {
        self.audio_url = audio_url;
        self
    }

    /// Whether playback goes through a native adaptive engine.
    pub fn is_adaptive(&self) -> bool {
        self.adaptive.is_some()
    }
}

/// Quality selection strategy over a leaf's streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamQuality {
    /// Highest available bitrate.
    Best,
    /// Lowest available bitrate.
    Worst,
    /// Highest bitrate not above the given kbps, else the lowest one.
    AtMost(u32),
}

impl StreamQuality {
    pub fn select<'a>(&self, streams: &'a [StreamDescriptor]) -> Option<&'a StreamDescriptor> {
        // Adaptive streams have no fixed bitrate and always win.
        if let Some(adaptive) = streams.iter().find(|s| s.is_adaptive()) {
            return Some(adaptive);
        }

        match self {
            Self::Best => streams.iter().max_by_key(|s| s.bitrate_kbps),
            Self::Worst => streams.iter().min_by_key(|s| s.bitrate_kbps),
            Self::AtMost(limit) => streams
                .iter()
                .filter(|s| s.bitrate_kbps <= *limit)
                .max_by_key(|s| s.bitrate_kbps)
                .or_else(|| streams.iter().min_by_key(|s| s.bitrate_kbps)),
        }
    }
}
