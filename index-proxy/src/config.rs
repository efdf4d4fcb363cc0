//! CLI/environment configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Caching reverse proxy for a Simple Repository API package index.
#[derive(Parser, Debug)]
pub struct Args {
    /// The primary upstream index URL.
    #[arg(long, env = "PYPI_PROXY_INDEX_URL")]
    pub index_url: String,

    /// Extra upstream index URLs, consulted in order and merged by filename
    /// with the primary index taking precedence.
    #[arg(long, env = "PYPI_PROXY_EXTRA_INDEX_URLS", value_delimiter = ',')]
    pub extra_index_urls: Vec<String>,

    /// Freshness window for the primary index.
    #[arg(long, env = "PYPI_PROXY_INDEX_TTL", default_value = "5m", value_parser = humantime::parse_duration)]
    pub index_ttl: Duration,

    /// Freshness windows for the extra indices, element-wise aligned with
    /// `--extra-index-urls`. When shorter, the primary TTL is reused for the
    /// remaining indices.
    #[arg(long, env = "PYPI_PROXY_EXTRA_INDEX_TTLS", value_delimiter = ',', value_parser = humantime::parse_duration)]
    pub extra_index_ttls: Vec<Duration>,

    /// Hard cap on the sum of cached (Ready) artifact sizes, in bytes.
    #[arg(long, env = "PYPI_PROXY_CACHE_SIZE_BYTES", default_value_t = 10 * 1024 * 1024 * 1024)]
    pub cache_size_bytes: u64,

    /// Directory the filesystem `Storage` back-end shards artifacts under.
    #[arg(long, env = "PYPI_PROXY_CACHE_DIR")]
    pub cache_dir: PathBuf,

    /// Per-artifact upstream download timeout.
    #[arg(long, env = "PYPI_PROXY_DOWNLOAD_TIMEOUT", default_value = "5m", value_parser = humantime::parse_duration)]
    pub download_timeout: Duration,

    /// Upstream TCP connect timeout.
    #[arg(long, env = "PYPI_PROXY_CONNECT_TIMEOUT", default_value = "10s", value_parser = humantime::parse_duration)]
    pub connect_timeout: Duration,

    /// Upstream read timeout (applied per-chunk).
    #[arg(long, env = "PYPI_PROXY_READ_TIMEOUT", default_value = "30s", value_parser = humantime::parse_duration)]
    pub read_timeout: Duration,

    /// Disable TLS certificate verification for upstream requests. Only
    /// intended for talking to a private index behind a self-signed cert.
    #[arg(long, env = "PYPI_PROXY_DISABLE_SSL_VERIFICATION")]
    pub disable_ssl_verification: bool,

    /// Serve every artifact with `Content-Type: application/octet-stream`
    /// regardless of extension inference.
    #[arg(long, env = "PYPI_PROXY_BINARY_FILE_MIME_TYPE")]
    pub binary_file_mime_type: bool,

    /// Serve stale metadata on upstream failure instead of returning the
    /// error.
    #[arg(long, env = "PYPI_PROXY_SERVE_STALE_ON_ERROR")]
    pub serve_stale_on_error: bool,

    /// Address to listen on.
    #[arg(short = 'l', long, env = "PYPI_PROXY_LISTEN", default_value = "127.0.0.1:8080")]
    pub listen: SocketAddr,
}

impl Args {
    /// Per-index TTLs, aligned element-wise with `index_urls()` — the
    /// primary index's TTL followed by one entry per extra index, reusing
    /// the primary TTL when `extra_index_ttls` is shorter (spec §4.3).
    pub fn index_ttls(&self) -> Vec<Duration> {
        let mut ttls = Vec::with_capacity(1 + self.extra_index_urls.len());
        ttls.push(self.index_ttl);
        for i in 0..self.extra_index_urls.len() {
            ttls.push(
                self.extra_index_ttls
                    .get(i)
                    .copied()
                    .unwrap_or(self.index_ttl),
            );
        }
        ttls
    }

    pub fn index_urls(&self) -> Vec<String> {
        let mut urls = Vec::with_capacity(1 + self.extra_index_urls.len());
        urls.push(self.index_url.clone());
        urls.extend(self.extra_index_urls.iter().cloned());
        urls
    }
}
