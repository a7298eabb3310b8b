//! Document download and ZIP archive handling for the ANS pipeline.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ans_core::{ensure_non_empty, DocumentRef, EtlError, Result};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{info, info_span, Instrument};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

pub const CRATE_NAME: &str = "ans-storage";

/// Write buffer size used while streaming response bodies to disk.
pub const CHUNK_SIZE: usize = 8192;

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedDocument {
    pub url: String,
    pub path: PathBuf,
    pub bytes: u64,
    pub sha256: String,
}

#[derive(Debug, Clone)]
pub struct DocumentFetcher {
    client: reqwest::Client,
}

impl DocumentFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build()?,
        })
    }

    async fn get_checked(&self, url: &str) -> Result<reqwest::Response> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(EtlError::Network {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }
        Ok(resp)
    }

    /// Fetch a page body as text.
    pub async fn fetch_text(&self, url: &str) -> Result<String> {
        let resp = self.get_checked(url).await?;
        Ok(resp.text().await?)
    }

    /// Stream `doc.url` into `doc.dest`, creating parent directories as needed.
    pub async fn download(&self, doc: &DocumentRef) -> Result<DownloadedDocument> {
        let span = info_span!("download", url = %doc.url, dest = %doc.dest.display());
        async {
            let mut resp = self.get_checked(&doc.url).await?;

            if let Some(parent) = doc.dest.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent).await?;
            }

            let file = fs::File::create(&doc.dest).await?;
            let mut writer = BufWriter::with_capacity(CHUNK_SIZE, file);
            let mut hasher = Sha256::new();
            while let Some(chunk) = resp.chunk().await? {
                hasher.update(&chunk);
                writer.write_all(&chunk).await?;
            }
            writer.flush().await?;
            drop(writer);

            let bytes = ensure_non_empty(&doc.dest, "downloaded file")?;
            let sha256 = hex::encode(hasher.finalize());
            info!(bytes, %sha256, "download complete");

            Ok(DownloadedDocument {
                url: doc.url.clone(),
                path: doc.dest.clone(),
                bytes,
                sha256,
            })
        }
        .instrument(span)
        .await
    }

    /// Download every document in order; the first failure aborts the batch.
    pub async fn download_all(&self, docs: &[DocumentRef]) -> Result<Vec<DownloadedDocument>> {
        let mut out = Vec::with_capacity(docs.len());
        for (idx, doc) in docs.iter().enumerate() {
            info!("downloading {}/{}: {}", idx + 1, docs.len(), doc.url);
            out.push(self.download(doc).await?);
        }
        Ok(out)
    }
}

/// Write `sources` into a deflated ZIP at `archive_path`, each under its base name.
pub fn compress(sources: &[PathBuf], archive_path: &Path) -> Result<PathBuf> {
    let mut members = Vec::with_capacity(sources.len());
    for source in sources {
        if !source.is_file() {
            return Err(EtlError::not_found(format!(
                "file to compress not found: {}",
                source.display()
            )));
        }
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| EtlError::integrity(format!("no file name: {}", source.display())))?;
        members.push((name, source));
    }

    if let Some(parent) = archive_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = ZipWriter::new(File::create(archive_path)?);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for (name, source) in members {
        writer.start_file(name, options)?;
        let mut input = File::open(source)?;
        io::copy(&mut input, &mut writer)?;
    }
    writer.finish()?;

    ensure_non_empty(archive_path, "zip archive")?;
    info!(archive = %archive_path.display(), files = sources.len(), "archive written");
    Ok(archive_path.to_path_buf())
}

/// Expand every member of `archive_path` into `target_dir` and verify none is empty.
pub fn extract(archive_path: &Path, target_dir: &Path) -> Result<PathBuf> {
    if !archive_path.exists() {
        return Err(EtlError::not_found(format!(
            "zip archive not found: {}",
            archive_path.display()
        )));
    }
    std::fs::create_dir_all(target_dir)?;

    let mut archive = ZipArchive::new(File::open(archive_path)?)?;
    let mut extracted = Vec::with_capacity(archive.len());

    for idx in 0..archive.len() {
        let mut member = archive.by_index(idx)?;
        let relative = member.enclosed_name().ok_or_else(|| {
            EtlError::integrity(format!("unsafe member path in archive: {}", member.name()))
        })?;
        let out_path = target_dir.join(relative);

        if member.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&out_path)?;
        io::copy(&mut member, &mut out)?;
        extracted.push(out_path);
    }

    for path in &extracted {
        ensure_non_empty(path, "extracted member")?;
    }

    info!(
        archive = %archive_path.display(),
        target = %target_dir.display(),
        members = extracted.len(),
        "archive extracted"
    );
    Ok(target_dir.to_path_buf())
}
