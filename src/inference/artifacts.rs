//! Model artifact acquisition
//!
//! Resolves the files a model needs, downloading them when a URL is known and
//! the local copy is missing. Every artifact reports `initiate`, one or more
//! `progress` updates and `done` through a [`LoadReporter`].

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::inference::backend::LoadReporter;

/// GGUF magic bytes (little-endian: "GGUF")
pub const GGUF_MAGIC: u32 = 0x4655_4747;

/// Errors that can occur while acquiring an artifact
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Download failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Download of {url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("Artifact not found at {0} and no download URL configured")]
    Missing(PathBuf),

    #[error("Not a GGUF file: magic 0x{0:08X}")]
    BadMagic(u32),

    #[error("Unsupported GGUF version: {0}")]
    UnsupportedVersion(u32),

    #[error("File too small to be valid GGUF")]
    Truncated,
}

/// Header fields read from a GGUF file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GgufHeader {
    pub version: u32,
    pub tensor_count: u64,
    pub metadata_kv_count: u64,
}

/// One file a model needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// Identifier used in progress events
    pub file_id: String,
    /// Where the file lives (or will live) on disk
    pub path: PathBuf,
    /// Where to fetch it from when missing
    pub url: Option<String>,
}

impl Artifact {
    pub fn local(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            file_id: file_id_for(&path),
            path,
            url: None,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    fn is_gguf(&self) -> bool {
        self.path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("gguf"))
    }
}

fn file_id_for(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Read and check the fixed-size GGUF header.
pub fn read_gguf_header(path: &Path) -> Result<GgufHeader, ArtifactError> {
    let mut file = File::open(path)?;

    // magic(4) + version(4) + tensor_count(8) + metadata_kv_count(8)
    if file.seek(SeekFrom::End(0))? < 24 {
        return Err(ArtifactError::Truncated);
    }
    file.seek(SeekFrom::Start(0))?;

    let mut header = [0u8; 24];
    file.read_exact(&mut header)?;

    let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    if magic != GGUF_MAGIC {
        return Err(ArtifactError::BadMagic(magic));
    }
    let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if !(2..=3).contains(&version) {
        return Err(ArtifactError::UnsupportedVersion(version));
    }

    let mut count = [0u8; 8];
    count.copy_from_slice(&header[8..16]);
    let tensor_count = u64::from_le_bytes(count);
    count.copy_from_slice(&header[16..24]);
    let metadata_kv_count = u64::from_le_bytes(count);

    Ok(GgufHeader {
        version,
        tensor_count,
        metadata_kv_count,
    })
}

/// Make `artifact` available locally and return its path.
pub fn acquire(
    artifact: &Artifact,
    reporter: &mut dyn LoadReporter,
) -> Result<PathBuf, ArtifactError> {
    if artifact.path.is_file() {
        reporter.initiate(&artifact.file_id);
        if artifact.is_gguf() {
            let header = read_gguf_header(&artifact.path)?;
            tracing::debug!(
                "GGUF v{} with {} tensors at {}",
                header.version,
                header.tensor_count,
                artifact.path.display()
            );
        }
        let total = artifact.path.metadata()?.len();
        reporter.progress(&artifact.file_id, total, total);
        reporter.done(&artifact.file_id);
        return Ok(artifact.path.clone());
    }

    let url = artifact
        .url
        .as_deref()
        .ok_or_else(|| ArtifactError::Missing(artifact.path.clone()))?;

    reporter.initiate(&artifact.file_id);
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(download(url, artifact, reporter))?;

    if artifact.is_gguf() {
        if let Err(e) = read_gguf_header(&artifact.path) {
            let _ = std::fs::remove_file(&artifact.path);
            return Err(e);
        }
    }
    reporter.done(&artifact.file_id);
    Ok(artifact.path.clone())
}

/// Stream `url` into the artifact path, reporting roughly every percent.
async fn download(
    url: &str,
    artifact: &Artifact,
    reporter: &mut dyn LoadReporter,
) -> Result<(), ArtifactError> {
    tracing::info!("Downloading {} from {}", artifact.file_id, url);

    let mut response = reqwest::Client::new().get(url).send().await?;
    if !response.status().is_success() {
        return Err(ArtifactError::Status {
            url: url.to_string(),
            status: response.status().as_u16(),
        });
    }

    if let Some(parent) = artifact.path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let partial = artifact.path.with_extension("part");
    let loaded = match write_body(&mut response, &partial, artifact, reporter).await {
        Ok(loaded) => loaded,
        Err(e) => {
            if let Err(cleanup) = tokio::fs::remove_file(&partial).await {
                tracing::warn!("Failed to remove {}: {}", partial.display(), cleanup);
            }
            return Err(e);
        }
    };
    tokio::fs::rename(&partial, &artifact.path).await?;

    tracing::info!("Downloaded {} ({} bytes)", artifact.file_id, loaded);
    Ok(())
}

/// Write the response body to `partial` and return the byte count.
async fn write_body(
    response: &mut reqwest::Response,
    partial: &Path,
    artifact: &Artifact,
    reporter: &mut dyn LoadReporter,
) -> Result<u64, ArtifactError> {
    let expected = response.content_length();
    let mut file = tokio::fs::File::create(partial).await?;

    let step = expected.map_or(0, |total| total / 100);
    let mut loaded = 0u64;
    let mut reported = 0u64;
    reporter.progress(&artifact.file_id, 0, expected.unwrap_or(0));

    while let Some(chunk) = response.chunk().await? {
        file.write_all(&chunk).await?;
        loaded += chunk.len() as u64;
        if loaded - reported > step {
            // unknown length: report what we have as the running total
            let total = expected.map_or(loaded, |t| t.max(loaded));
            reporter.progress(&artifact.file_id, loaded, total);
            reported = loaded;
        }
    }
    file.flush().await?;
    drop(file);

    if reported != loaded {
        reporter.progress(&artifact.file_id, loaded, expected.map_or(loaded, |t| t.max(loaded)));
    }
    Ok(loaded)
}
