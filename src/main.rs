//! `channelkit` CLI - inspect HLS manifests and license key descriptors

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use channelkit::config::Config;
use channelkit::fetch::HttpFetcher;
use channelkit::stream::hls::{self, HlsManifest, HlsOptions, UrlJoin};
use channelkit::stream::{format_license_key, KeyType};

#[derive(Parser)]
#[command(name = "channelkit")]
#[command(about = "Inspect HLS manifests and license key descriptors")]
#[command(version)]
struct Cli {
    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the variants of an HLS master playlist, best first
    Hls {
        /// Manifest URL (also the base for relative URIs)
        url: String,

        /// Read the manifest text from a file instead of fetching it
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Map each variant's AUDIO group to its rendition
        #[arg(long)]
        map_audio: bool,

        /// Propagate the manifest URL's query string to every variant
        #[arg(long)]
        append_query: bool,

        /// Also look up a subtitle track in this language
        #[arg(short, long)]
        subtitle: Option<String>,

        /// Join relative URIs by plain concatenation
        #[arg(long)]
        legacy_join: bool,
    },

    /// Format a license key descriptor for an adaptive engine
    LicenseKey {
        /// License server URL
        key_url: String,

        #[arg(short = 't', long, value_enum, default_value = "raw")]
        key_type: KeyTypeArg,

        /// Request header as NAME=VALUE (repeatable)
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,

        /// Key value template ({KID} / {SSM} are kept as-is)
        #[arg(long)]
        value: Option<String>,

        /// JSON filter for the license response
        #[arg(long)]
        filter: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum KeyTypeArg {
    Raw,
    Base64,
    Decimal,
}

impl From<KeyTypeArg> for KeyType {
    fn from(arg: KeyTypeArg) -> Self {
        match arg {
            KeyTypeArg::Raw => KeyType::Raw,
            KeyTypeArg::Base64 => KeyType::Base64,
            KeyTypeArg::Decimal => KeyType::Decimal,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    match cli.command {
        Commands::Hls {
            url,
            file,
            map_audio,
            append_query,
            subtitle,
            legacy_join,
        } => {
            let join = if legacy_join { UrlJoin::Legacy } else { UrlJoin::Standard };
            let options = HlsOptions::default()
                .with_map_audio(map_audio)
                .with_query_string(append_query)
                .with_url_join(join);
            cmd_hls(&url, file, options, subtitle.as_deref()).await?;
        }
        Commands::LicenseKey {
            key_url,
            key_type,
            headers,
            value,
            filter,
        } => {
            cmd_license_key(&key_url, key_type.into(), &headers, value.as_deref(), filter.as_deref())?;
        }
    }

    Ok(())
}

async fn cmd_hls(url: &str, file: Option<PathBuf>, options: HlsOptions, language: Option<&str>) -> Result<()> {
    let manifest = match file {
        Some(path) => {
            let text = std::fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
            HlsManifest::new(url, text)
        }
        None => {
            let config = Config::load()?;
            let fetcher = HttpFetcher::new(&config.fetch)?;
            HlsManifest::fetch(&fetcher, url, &BTreeMap::new()).await?
        }
    };

    let variants = hls::ranked(manifest.variants(&options));
    if variants.is_empty() {
        println!("No variants found");
    }
    for variant in &variants {
        match &variant.audio_url {
            Some(audio) => println!("{:>6} kbps  {}  audio={}", variant.bitrate_kbps, variant.url, audio),
            None => println!("{:>6} kbps  {}", variant.bitrate_kbps, variant.url),
        }
    }

    if language.is_some() {
        let subtitle = manifest.subtitle(language, &options);
        if subtitle.is_empty() {
            println!("No subtitles");
        } else {
            println!("subtitle  {subtitle}");
        }
    }

    if manifest.is_drm_protected() {
        println!("encrypted: playback needs a DRM capable adaptive engine");
    } else if manifest.is_encrypted() {
        println!("encrypted: AES-128 segment keys, no DRM needed");
    }

    Ok(())
}

fn cmd_license_key(
    key_url: &str,
    key_type: KeyType,
    headers: &[String],
    value: Option<&str>,
    filter: Option<&str>,
) -> Result<()> {
    let mut parsed = BTreeMap::new();
    for header in headers {
        let Some((name, value)) = header.split_once('=') else {
            bail!("header '{header}' is not NAME=VALUE");
        };
        parsed.insert(name.trim().to_string(), value.trim().to_string());
    }

    let key = format_license_key(key_url, key_type, Some(&parsed), value, filter)?;
    println!("{key}");
    Ok(())
}
