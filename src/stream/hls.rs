//! HLS master playlist resolution.
//!
//! Turns an M3U8 master playlist into bitrate-tagged variant URLs, with
//! optional audio-group mapping and subtitle discovery. Parsing is pure:
//! the same text always yields the same variants in the same order.

use std::collections::{BTreeMap, HashMap};

use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::fetch::{FetchRequest, Fetcher};

use super::descriptor::{StreamDescriptor, Transport};

const STREAM_INF: &str = "#EXT-X-STREAM-INF:";
const IFRAME_STREAM_INF: &str = "#EXT-X-I-FRAME-STREAM-INF:";
const MEDIA: &str = "#EXT-X-MEDIA:";
const KEY: &str = "#EXT-X-KEY:";
const SESSION_KEY: &str = "#EXT-X-SESSION-KEY:";
const NULL_QUERY: &str = "?null=";

/// How relative variant URIs are joined to the manifest directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UrlJoin {
    /// RFC 3986 reference resolution.
    #[default]
    Standard,
    /// Plain `base_dir + "/" + uri` concatenation, kept for CDNs that were
    /// only ever tested against it.
    Legacy,
}

/// Options controlling variant extraction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HlsOptions {
    /// Map each variant's `AUDIO` group to its rendition URI.
    pub map_audio: bool,
    /// Propagate the manifest URL's query string to every resolved URI.
    pub append_query_string: bool,
    pub url_join: UrlJoin,
}

impl HlsOptions {
    #[must_use]
    pub fn with_map_audio(mut self, enabled: bool) -> Self {
        self.map_audio = enabled;
        self
    }

    #[must_use]
    pub fn with_query_string(mut self, enabled: bool) -> Self {
        self.append_query_string = enabled;
        self
    }

    #[must_use]
    pub fn with_url_join(mut self, join: UrlJoin) -> Self {
        self.url_join = join;
        self
    }
}

/// One variant stream of a master playlist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variant {
    pub url: String,
    /// `BANDWIDTH / 1000`, truncated.
    pub bitrate_kbps: u32,
    /// Audio rendition for the variant's `AUDIO` group. Always `None` when
    /// audio mapping is off.
    pub audio_url: Option<String>,
}

/// An HLS master playlist and the URL it was loaded from.
#[derive(Debug, Clone)]
pub struct HlsManifest {
    url: String,
    text: String,
}

impl HlsManifest {
    /// Wrap already fetched manifest text.
    pub fn new(url: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            text: text.into(),
        }
    }

    /// Fetch the manifest through the fetch collaborator.
    pub async fn fetch(
        fetcher: &dyn Fetcher,
        url: &str,
        headers: &BTreeMap<String, String>,
    ) -> Result<Self> {
        let request = FetchRequest::get(url).with_headers(headers.clone());
        let response = fetcher.fetch(request).await?;
        if !response.is_success() {
            return Err(Error::HttpStatus {
                url: url.to_string(),
                status: response.status,
            });
        }
        Ok(Self::new(url, response.text()))
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Extract every `#EXT-X-STREAM-INF` variant in document order.
    ///
    /// Trick-play (`#EXT-X-I-FRAME-STREAM-INF`) entries are never returned.
    /// An empty result is valid.
    pub fn variants(&self, options: &HlsOptions) -> Vec<Variant> {
        let audio_groups = if options.map_audio {
            self.audio_groups(options)
        } else {
            HashMap::new()
        };

        let lines: Vec<&str> = self.text.lines().map(str::trim).collect();
        let mut variants = Vec::new();
        let mut i = 0;

        while i < lines.len() {
            let Some(rest) = lines[i].strip_prefix(STREAM_INF) else {
                i += 1;
                continue;
            };
            let attrs = parse_attributes(rest);
            i += 1;

            // The URI is the next line that is neither blank nor a comment.
            while i < lines.len()
                && (lines[i].is_empty()
                    || (lines[i].starts_with('#') && !lines[i].starts_with(STREAM_INF)))
            {
                i += 1;
            }
            let Some(uri) = lines.get(i).filter(|l| !l.starts_with('#')) else {
                continue;
            };
            i += 1;

            let bandwidth: u64 = attrs
                .get("BANDWIDTH")
                .and_then(|b| b.parse().ok())
                .unwrap_or(0);
            let audio_url = if options.map_audio {
                attrs
                    .get("AUDIO")
                    .and_then(|group| audio_groups.get(group))
                    .cloned()
            } else {
                None
            };

            variants.push(Variant {
                url: self.resolve(uri, options),
                bitrate_kbps: u32::try_from(bandwidth / 1000).unwrap_or(u32::MAX),
                audio_url,
            });
        }

        debug!(url = %self.url, count = variants.len(), "parsed HLS variants");
        variants
    }

    /// Subtitle rendition URI, or an empty string when there is none.
    ///
    /// With a `language`, only renditions with that exact `LANGUAGE` count.
    /// The last candidate in document order wins.
    pub fn subtitle(&self, language: Option<&str>, options: &HlsOptions) -> String {
        let mut found = None;
        for line in self.text.lines().map(str::trim) {
            let Some(rest) = line.strip_prefix(MEDIA) else {
                continue;
            };
            let attrs = parse_attributes(rest);
            if attrs.get("TYPE").map(String::as_str) != Some("SUBTITLES") {
                continue;
            }
            if let Some(lang) = language {
                if attrs.get("LANGUAGE").map(String::as_str) != Some(lang) {
                    continue;
                }
            }
            if let Some(uri) = attrs.get("URI") {
                found = Some(uri.clone());
            }
        }

        found.map_or_else(String::new, |uri| self.resolve(&uri, options))
    }

    /// Whether segments are encrypted (`#EXT-X-KEY` / `#EXT-X-SESSION-KEY`
    /// with a method other than `NONE`).
    pub fn is_encrypted(&self) -> bool {
        self.key_attributes().any(|attrs| {
            attrs
                .get("METHOD")
                .is_some_and(|m| !m.eq_ignore_ascii_case("NONE"))
        })
    }

    /// Whether playback needs a DRM system: a `SAMPLE-AES*` method, or a
    /// `KEYFORMAT` other than `identity`. Plain `AES-128` with identity keys
    /// is decrypted by any HLS player and does not count.
    pub fn is_drm_protected(&self) -> bool {
        self.key_attributes().any(|attrs| {
            let Some(method) = attrs.get("METHOD") else {
                return false;
            };
            if method.eq_ignore_ascii_case("NONE") {
                return false;
            }
            let sample_aes = method.to_ascii_uppercase().starts_with("SAMPLE-AES");
            let foreign_format = attrs
                .get("KEYFORMAT")
                .is_some_and(|f| !f.eq_ignore_ascii_case("identity"));
            sample_aes || foreign_format
        })
    }

    fn key_attributes(&self) -> impl Iterator<Item = HashMap<String, String>> + '_ {
        self.text.lines().map(str::trim).filter_map(|line| {
            line.strip_prefix(KEY)
                .or_else(|| line.strip_prefix(SESSION_KEY))
                .map(parse_attributes)
        })
    }

    fn audio_groups(&self, options: &HlsOptions) -> HashMap<String, String> {
        let mut groups = HashMap::new();
        for line in self.text.lines().map(str::trim) {
            let Some(rest) = line.strip_prefix(MEDIA) else {
                continue;
            };
            let attrs = parse_attributes(rest);
            if attrs.get("TYPE").map(String::as_str) != Some("AUDIO") {
                continue;
            }
            let group = attrs.get("GROUP-ID").or_else(|| attrs.get("ID"));
            if let (Some(group), Some(uri)) = (group, attrs.get("URI")) {
                groups.insert(group.clone(), self.resolve(uri, options));
            }
        }
        groups
    }

    fn resolve(&self, uri: &str, options: &HlsOptions) -> String {
        let resolved = if uri.contains("://") {
            uri.to_string()
        } else {
            match options.url_join {
                UrlJoin::Standard => match url::Url::parse(&self.url).and_then(|base| base.join(uri)) {
                    Ok(joined) => joined.into(),
                    Err(e) => {
                        debug!(manifest = %self.url, uri, error = %e, "manifest URL not absolute, using legacy join");
                        legacy_join(&self.url, uri)
                    }
                },
                UrlJoin::Legacy => legacy_join(&self.url, uri),
            }
        };

        if options.append_query_string {
            append_query(resolved, query_of(&self.url))
        } else {
            resolved
        }
    }
}

/// Sort variants by descending bitrate, keeping document order for ties.
pub fn ranked(mut variants: Vec<Variant>) -> Vec<Variant> {
    variants.sort_by(|a, b| b.bitrate_kbps.cmp(&a.bitrate_kbps));
    variants
}

/// One HLS stream descriptor per variant.
pub fn to_streams(
    variants: Vec<Variant>,
    headers: &BTreeMap<String, String>,
    subtitle: Option<&str>,
) -> Vec<StreamDescriptor> {
    variants
        .into_iter()
        .map(|v| {
            StreamDescriptor::new(v.url, v.bitrate_kbps, Transport::Hls)
                .with_headers(headers.clone())
                .with_audio(v.audio_url)
                .with_subtitle(subtitle.map(str::to_string))
        })
        .collect()
}

/// Everything up to (not including) the final `/` of the URL path.
pub fn base_dir(url: &str) -> &str {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    without_query.rsplit_once('/').map_or("", |(base, _)| base)
}

fn legacy_join(manifest_url: &str, uri: &str) -> String {
    format!("{}/{uri}", base_dir(manifest_url))
}

fn query_of(url: &str) -> Option<&str> {
    url.split('#')
        .next()
        .and_then(|u| u.split_once('?'))
        .map(|(_, q)| q)
        .filter(|q| !q.is_empty())
}

fn append_query(mut uri: String, query: Option<&str>) -> String {
    let Some(query) = query else {
        return uri;
    };

    if uri.ends_with(NULL_QUERY) {
        uri.truncate(uri.len() - NULL_QUERY.len());
        uri.push('?');
    } else if uri.contains('?') {
        uri.push('&');
    } else {
        uri.push('?');
    }
    uri.push_str(query);
    uri
}

/// Parse an HLS attribute list (`KEY=value,KEY="quoted, value"`).
pub(crate) fn parse_attributes(attr_str: &str) -> HashMap<String, String> {
    let mut attrs = HashMap::new();
    let mut chars = attr_str.chars().peekable();

    while chars.peek().is_some() {
        let key: String = chars.by_ref().take_while(|&c| c != '=').collect();

        if key.trim().is_empty() {
            break;
        }

        let value = if chars.peek() == Some(&'"') {
            chars.next(); // opening quote
            let v: String = chars.by_ref().take_while(|&c| c != '"').collect();
            // skip anything up to and including the separating comma
            for c in chars.by_ref() {
                if c == ',' {
                    break;
                }
            }
            v
        } else {
            chars.by_ref().take_while(|&c| c != ',').collect()
        };

        attrs.insert(key.trim().to_string(), value.trim().to_string());
    }

    attrs
}
