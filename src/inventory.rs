use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context as _;
use base64::Engine as _;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;

use crate::{
    content_path::{ContentPathResolver, parse_content_type, stringify_content_type},
    encoding::{compress, decompress},
    formatting::{convert_editable_text, is_text_like},
};

pub const DEFAULT_INVENTORY_DIR: &str = "inventory";
pub const MANIFEST_FILE: &str = "inventory.json";
pub const LEGACY_MANIFEST_FILE: &str = "index.json";

/// Response headers keyed by lower-case name.
pub type Headers = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FormFactor {
    Mobile,
    Desktop,
}

impl FormFactor {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mobile => "mobile",
            Self::Desktop => "desktop",
        }
    }
}

/// One HTTP exchange as seen on the wire.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transaction {
    pub method: String,
    pub url: String,
    pub ttfb_ms: u64,
    pub status_code: Option<u16>,
    pub error_message: Option<String>,
    pub raw_headers: Headers,
    pub content: Option<Bytes>,
    pub duration_ms: Option<f64>,
}

/// Durable form of a [`Transaction`], one entry of the manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub method: String,
    pub url: String,
    #[serde(deserialize_with = "deserialize_millis")]
    pub ttfb_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mbps: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_headers: Option<Headers>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_encoding: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type_mime: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type_charset: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_file_path: Option<String>,
    /// Hand-authored inline body, used when there is no content file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_utf8: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_base64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minify: Option<bool>,
}

/// Hand-written manifests may carry fractional or negative milliseconds.
fn deserialize_millis<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let millis = f64::deserialize(deserializer)?;
    if !millis.is_finite() {
        return Err(serde::de::Error::custom(format!(
            "expected a finite number of milliseconds, got {millis}"
        )));
    }
    Ok(millis.round().max(0.0) as u64)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Inventory {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<FormFactor>,
    #[serde(default)]
    pub resources: Vec<Resource>,
}

#[derive(Debug, Clone)]
pub struct InventoryRepository {
    dir: PathBuf,
    resolver: ContentPathResolver,
}

impl InventoryRepository {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            resolver: ContentPathResolver::from_env(),
        }
    }

    pub fn with_resolver(mut self, resolver: ContentPathResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn save_inventory(&self, inventory: &Inventory) -> anyhow::Result<()> {
        let dir = self.dir.clone();
        let json = serde_json::to_string_pretty(inventory).context("serialize inventory")?;
        tokio::task::spawn_blocking(move || write_manifest_blocking(&dir, &json))
            .await
            .context("join save_inventory task")?
    }

    pub async fn load_inventory(&self) -> anyhow::Result<Inventory> {
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || read_manifest_blocking(&dir))
            .await
            .context("join load_inventory task")?
    }

    /// Persists every transaction body and returns the matching resources in
    /// input order. Items that fail are logged and left out.
    pub async fn save_transactions(
        &self,
        transactions: Vec<Transaction>,
    ) -> anyhow::Result<Vec<Resource>> {
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || fs::create_dir_all(&dir))
            .await
            .context("join create inventory dir task")?
            .with_context(|| format!("create inventory dir {}", self.dir.display()))?;

        let dir = self.dir.clone();
        let resolver = self.resolver.clone();
        Ok(run_batch(transactions, move |transaction| {
            let (method, url) = (transaction.method.clone(), transaction.url.clone());
            save_transaction_blocking(&dir, &resolver, transaction)
                .map_err(|err| {
                    tracing::error!(%method, %url, "failed to save transaction: {err:#}");
                })
                .ok()
        })
        .await)
    }

    /// Rebuilds wire transactions from stored resources, in input order.
    pub async fn load_transactions(&self, resources: Vec<Resource>) -> Vec<Transaction> {
        let dir = self.dir.clone();
        run_batch(resources, move |resource| {
            load_transaction_blocking(&dir, &resource)
                .map_err(|err| {
                    tracing::error!(
                        method = %resource.method,
                        url = %resource.url,
                        "failed to load transaction: {err:#}"
                    );
                })
                .ok()
        })
        .await
    }
}

async fn run_batch<T, R, F>(items: Vec<T>, work: F) -> Vec<R>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Option<R> + Send + Sync + 'static,
{
    let work = Arc::new(work);
    let mut slots: Vec<Option<R>> = items.iter().map(|_| None).collect();
    let mut tasks = JoinSet::new();
    for (index, item) in items.into_iter().enumerate() {
        let work = Arc::clone(&work);
        tasks.spawn_blocking(move || (index, work(item)));
    }
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, output)) => slots[index] = output,
            Err(err) => tracing::error!("inventory worker task failed: {err}"),
        }
    }
    slots.into_iter().flatten().collect()
}

fn write_manifest_blocking(dir: &Path, json: &str) -> anyhow::Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("create inventory dir {}", dir.display()))?;
    let path = dir.join(MANIFEST_FILE);
    let staging = dir.join(format!("{MANIFEST_FILE}.tmp"));
    fs::write(&staging, json).with_context(|| format!("write {}", staging.display()))?;
    fs::rename(&staging, &path).with_context(|| format!("replace {}", path.display()))
}

fn read_manifest_blocking(dir: &Path) -> anyhow::Result<Inventory> {
    let primary = dir.join(MANIFEST_FILE);
    let path = match fs::metadata(&primary) {
        Ok(_) => primary,
        Err(err) if err.kind() == io::ErrorKind::NotFound => dir.join(LEGACY_MANIFEST_FILE),
        Err(err) => {
            return Err(err).with_context(|| format!("stat {}", primary.display()));
        }
    };
    let raw = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))
}

fn save_transaction_blocking(
    dir: &Path,
    resolver: &ContentPathResolver,
    transaction: Transaction,
) -> anyhow::Result<Resource> {
    let headers = transaction.raw_headers;
    let mut resource = Resource {
        method: transaction.method,
        url: transaction.url,
        ttfb_ms: transaction.ttfb_ms,
        status_code: transaction.status_code,
        error_message: transaction.error_message,
        ..Resource::default()
    };

    if let Some(content_type) = headers.get("content-type") {
        let parsed = parse_content_type(content_type);
        resource.content_type_mime = parsed.mime;
        resource.content_type_charset = parsed.charset;
    }
    resource.content_encoding = headers
        .get("content-encoding")
        .filter(|token| !token.trim().is_empty())
        .cloned();
    if !headers.is_empty() {
        resource.raw_headers = Some(headers);
    }

    let Some(content) = transaction.content.filter(|content| !content.is_empty()) else {
        return Ok(resource);
    };

    if let Some(duration_ms) = transaction.duration_ms.filter(|ms| *ms > 0.0) {
        let bits = content.len() as f64 * 8.0;
        resource.mbps = Some(bits / (duration_ms / 1000.0) / (1024.0 * 1024.0));
    }

    let decoded = match resource.content_encoding.as_deref() {
        Some(token) => decompress(token, &content)?,
        None => content.to_vec(),
    };

    let mut stored = decoded;
    if let Some(mime) = resource
        .content_type_mime
        .as_deref()
        .filter(|mime| is_text_like(mime))
    {
        match convert_editable_text(&stored, mime, resource.content_type_charset.as_deref()) {
            Ok(text) => {
                stored = text.into_bytes();
                resource.content_type_charset = Some("utf-8".to_owned());
            }
            Err(err) => {
                tracing::error!(url = %resource.url, %mime, "formatting failed: {err}");
            }
        }
    }

    let relative = resolver.path_for(&resource.method, &resource.url)?;
    let full_path = dir.join(&relative);
    if let Some(parent) = full_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create content dir {}", parent.display()))?;
    }
    fs::write(&full_path, &stored).with_context(|| format!("write {}", full_path.display()))?;
    resource.content_file_path = Some(relative);
    Ok(resource)
}

fn load_transaction_blocking(dir: &Path, resource: &Resource) -> anyhow::Result<Transaction> {
    let mut headers = resource.raw_headers.clone().unwrap_or_default();
    let stored = stored_body(dir, resource)?;

    let (content, duration_ms) = match stored {
        Some(body) => {
            let content = match resource.content_encoding.as_deref() {
                Some(token) => {
                    headers.insert("content-encoding".to_owned(), token.to_owned());
                    compress(token, &body)?
                }
                None => {
                    headers.remove("content-encoding");
                    body.clone()
                }
            };
            headers.insert("content-length".to_owned(), content.len().to_string());
            let duration_ms = match resource.mbps.map(bytes_per_ms).filter(|rate| *rate > 0.0) {
                Some(rate) => body.len() as f64 / rate,
                None => 0.0,
            };
            (Some(Bytes::from(content)), duration_ms)
        }
        None => {
            headers.insert("content-length".to_owned(), "0".to_owned());
            (None, 0.0)
        }
    };

    if let Some(mime) = resource.content_type_mime.as_deref() {
        headers.insert(
            "content-type".to_owned(),
            stringify_content_type(Some(mime), resource.content_type_charset.as_deref(), None),
        );
    }

    Ok(Transaction {
        method: resource.method.clone(),
        url: resource.url.clone(),
        ttfb_ms: resource.ttfb_ms,
        status_code: resource.status_code,
        error_message: resource.error_message.clone(),
        raw_headers: headers,
        content,
        duration_ms: Some(duration_ms),
    })
}

/// Body bytes as stored: the content file when present on disk, else an inline body.
fn stored_body(dir: &Path, resource: &Resource) -> anyhow::Result<Option<Vec<u8>>> {
    if let Some(relative) = resource.content_file_path.as_deref() {
        let full_path = dir.join(relative);
        return match fs::read(&full_path) {
            Ok(body) => Ok(Some(body)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                tracing::warn!(path = %full_path.display(), "content file is missing");
                Ok(None)
            }
            Err(err) => Err(err).with_context(|| format!("read {}", full_path.display())),
        };
    }
    if let Some(text) = resource.content_utf8.as_deref() {
        return Ok(Some(text.as_bytes().to_vec()));
    }
    if let Some(encoded) = resource.content_base64.as_deref() {
        let body = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .context("decode contentBase64")?;
        return Ok(Some(body));
    }
    Ok(None)
}

fn bytes_per_ms(mbps: f64) -> f64 {
    mbps * 1024.0 * 1024.0 / 8.0 / 1000.0
}
