//! Cache policy classification
//!
//! Maps a site-relative path to the `Cache-Control` and `Content-Type` it is
//! published with. Classification looks at the path only, never at contents.

use serde::{Deserialize, Serialize};

/// Short TTL for HTML documents
pub const DOCUMENT_MAX_AGE: u32 = 300;

/// One year, for fingerprinted assets
pub const IMMUTABLE_MAX_AGE: u32 = 31_536_000;

/// Medium TTL for manifests and anything unrecognized
pub const MANIFEST_MAX_AGE: u32 = 3_600;

/// Paths that must never be cached at the edge
const NO_STORE_EXACT: &[&str] = &["sw.js", "service-worker.js", "serviceworker.js"];

const NO_STORE_PREFIXES: &[&str] = &["api/"];

const MANIFEST_NAMES: &[&str] = &[
    "manifest.json",
    "site.webmanifest",
    "robots.txt",
    "sitemap.xml",
    "browserconfig.xml",
    "feed.xml",
    "rss.xml",
    "atom.xml",
];

const MANIFEST_EXTENSIONS: &[&str] = &["json", "webmanifest", "xml", "txt"];

const ASSET_EXTENSIONS: &[&str] = &[
    // scripts and styles
    "js", "mjs", "cjs", "css", "map", "wasm",
    // images
    "png", "jpg", "jpeg", "gif", "webp", "avif", "svg", "ico", "bmp",
    // fonts
    "woff", "woff2", "ttf", "otf", "eot",
    // media
    "mp4", "webm", "mp3", "ogg", "wav",
];

const DOCUMENT_EXTENSIONS: &[&str] = &["html", "htm"];

/// Cache class assigned to a published file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CacheClass {
    /// HTML documents: short TTL, revalidated
    Document,
    /// Scripts, styles, images and fonts: cached for a year
    ImmutableAsset,
    /// Manifests and well-known files; also the fallback for unknown files
    Manifest,
    /// Service workers and API responses
    NoStore,
}

impl CacheClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheClass::Document => "document",
            CacheClass::ImmutableAsset => "immutableAsset",
            CacheClass::Manifest => "manifest",
            CacheClass::NoStore => "noStore",
        }
    }

    /// The header policy for this class
    pub fn policy(&self) -> CachePolicy {
        match self {
            CacheClass::Document => CachePolicy {
                class: *self,
                cache_control: format!("public, max-age={DOCUMENT_MAX_AGE}, must-revalidate"),
                immutable: false,
                max_age_seconds: DOCUMENT_MAX_AGE,
            },
            CacheClass::ImmutableAsset => CachePolicy {
                class: *self,
                cache_control: format!("public, max-age={IMMUTABLE_MAX_AGE}, immutable"),
                immutable: true,
                max_age_seconds: IMMUTABLE_MAX_AGE,
            },
            CacheClass::Manifest => CachePolicy {
                class: *self,
                cache_control: format!("public, max-age={MANIFEST_MAX_AGE}"),
                immutable: false,
                max_age_seconds: MANIFEST_MAX_AGE,
            },
            CacheClass::NoStore => CachePolicy {
                class: *self,
                cache_control: "no-cache, no-store, must-revalidate".to_string(),
                immutable: false,
                max_age_seconds: 0,
            },
        }
    }
}

impl std::fmt::Display for CacheClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cache headers for one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePolicy {
    pub class: CacheClass,
    pub cache_control: String,
    pub immutable: bool,
    pub max_age_seconds: u32,
}

/// Classify a site-relative path. Total and deterministic.
pub fn classify(path: &str) -> CachePolicy {
    classify_class(path).policy()
}

/// Classify a path to its cache class only
pub fn classify_class(path: &str) -> CacheClass {
    let normalized = normalize(path);
    let file_name = normalized.rsplit('/').next().unwrap_or("");

    if NO_STORE_EXACT.contains(&normalized.as_str())
        || NO_STORE_PREFIXES.iter().any(|p| normalized.starts_with(p))
    {
        return CacheClass::NoStore;
    }

    if MANIFEST_NAMES.contains(&file_name) {
        return CacheClass::Manifest;
    }

    match extension(file_name) {
        Some(ext) if MANIFEST_EXTENSIONS.contains(&ext.as_str()) => CacheClass::Manifest,
        Some(ext) if ASSET_EXTENSIONS.contains(&ext.as_str()) => CacheClass::ImmutableAsset,
        Some(ext) if DOCUMENT_EXTENSIONS.contains(&ext.as_str()) => CacheClass::Document,
        // Extensionless routes (`about`, `blog/`) are served as documents
        None => CacheClass::Document,
        Some(_) => CacheClass::Manifest,
    }
}

/// Content type for a site-relative path
pub fn content_type(path: &str) -> &'static str {
    let normalized = normalize(path);
    let file_name = normalized.rsplit('/').next().unwrap_or("");

    match extension(file_name).as_deref() {
        Some("html") | Some("htm") | None => "text/html; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("js") | Some("mjs") | Some("cjs") => "application/javascript; charset=utf-8",
        Some("json") | Some("map") => "application/json",
        Some("webmanifest") => "application/manifest+json",
        Some("xml") => "application/xml",
        Some("txt") => "text/plain; charset=utf-8",
        Some("wasm") => "application/wasm",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("avif") => "image/avif",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        Some("bmp") => "image/bmp",
        Some("woff") => "font/woff",
        Some("woff2") => "font/woff2",
        Some("ttf") => "font/ttf",
        Some("otf") => "font/otf",
        Some("eot") => "application/vnd.ms-fontobject",
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        Some("mp3") => "audio/mpeg",
        Some("ogg") => "audio/ogg",
        Some("wav") => "audio/wav",
        Some("pdf") => "application/pdf",
        Some(_) => "application/octet-stream",
    }
}

fn normalize(path: &str) -> String {
    path.trim_start_matches('/').to_ascii_lowercase()
}

fn extension(file_name: &str) -> Option<String> {
    match file_name.rsplit_once('.') {
        // Dotfiles such as `.nojekyll` have no extension
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => Some(ext.to_string()),
        _ => None,
    }
}
