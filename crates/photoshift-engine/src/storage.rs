use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use photoshift_contracts::jobs::ImageRef;
use reqwest::blocking::Client as HttpClient;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageBytes {
    pub bytes: Vec<u8>,
    pub mime_type: Option<String>,
}

/// Resolves image references to bytes. The orchestrator never touches storage
/// any other way.
pub trait ImageStore: Send + Sync {
    /// Cheap existence check used when a request is built.
    fn is_resolvable(&self, reference: &ImageRef) -> bool;
    fn load(&self, reference: &ImageRef) -> Result<ImageBytes>;
}

/// Local files, optionally confined to a root directory, plus `http(s)` URLs.
pub struct FsImageStore {
    root: Option<PathBuf>,
    http: HttpClient,
}

impl FsImageStore {
    pub fn new() -> Self {
        Self {
            root: None,
            http: HttpClient::new(),
        }
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
            http: HttpClient::new(),
        }
    }

    fn local_path(&self, reference: &ImageRef) -> Option<PathBuf> {
        let raw = reference.as_str().trim();
        if raw.is_empty() || reference.is_remote() {
            return None;
        }
        let raw = raw.strip_prefix("file://").unwrap_or(raw);
        let path = Path::new(raw);
        let climbs = path
            .components()
            .any(|component| matches!(component, Component::ParentDir));
        match &self.root {
            Some(_) if climbs => None,
            Some(root) if path.is_relative() => Some(root.join(path)),
            Some(root) => path.starts_with(root).then(|| path.to_path_buf()),
            None => Some(path.to_path_buf()),
        }
    }

    fn download(&self, url: &str) -> Result<ImageBytes> {
        let response = self
            .http
            .get(url)
            .send()
            .with_context(|| format!("failed downloading source image ({url})"))?;
        if !response.status().is_success() {
            bail!(
                "source image download failed ({})",
                response.status().as_u16()
            );
        }
        let mime_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes()
            .context("failed reading source image bytes")?
            .to_vec();
        Ok(ImageBytes { bytes, mime_type })
    }
}

impl Default for FsImageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageStore for FsImageStore {
    fn is_resolvable(&self, reference: &ImageRef) -> bool {
        if reference.is_remote() {
            return reqwest::Url::parse(reference.as_str().trim())
                .map(|url| url.host_str().is_some())
                .unwrap_or(false);
        }
        self.local_path(reference)
            .and_then(|path| fs::metadata(path).ok())
            .map(|meta| meta.is_file())
            .unwrap_or(false)
    }

    fn load(&self, reference: &ImageRef) -> Result<ImageBytes> {
        if reference.is_remote() {
            return self.download(reference.as_str().trim());
        }
        let Some(path) = self.local_path(reference) else {
            bail!("image reference '{}' is outside the store", reference);
        };
        let bytes = fs::read(&path).with_context(|| format!("failed reading {}", path.display()))?;
        Ok(ImageBytes {
            bytes,
            mime_type: mime_for_path(&path).map(str::to_string),
        })
    }
}

pub(crate) fn mime_for_path(path: &Path) -> Option<&'static str> {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())?;
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        "heic" => Some("image/heic"),
        _ => None,
    }
}
