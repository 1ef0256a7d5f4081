use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::media::download_file;

/// Where finished images are published and fetched back from.
#[allow(async_fn_in_trait)]
pub trait ImageStore {
    async fn upload(&self, path: &Path, name: &str) -> Result<()>;
    async fn fetch(&self, name: &str, dest: &Path) -> Result<()>;
}

/// Image store speaking plain HTTP: `PUT <base>/<name>` and `GET <base>/<name>`.
#[derive(Debug, Clone)]
pub struct HttpImageStore {
    base_url: String,
}

impl HttpImageStore {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn object_url(&self, name: &str) -> String {
        format!("{}/{}", self.base_url, name)
    }
}

impl ImageStore for HttpImageStore {
    async fn upload(&self, path: &Path, name: &str) -> Result<()> {
        let url = self.object_url(name);
        let path: PathBuf = path.to_path_buf();
        tokio::task::spawn_blocking(move || put_file(&url, &path))
            .await
            .context("upload task failed")?
    }

    async fn fetch(&self, name: &str, dest: &Path) -> Result<()> {
        let url = self.object_url(name);
        let dest = dest.to_path_buf();
        let bar = ProgressBar::no_length();
        bar.set_message(name.to_string());
        tokio::task::spawn_blocking(move || download_file(&url, &dest, &bar))
            .await
            .context("download task failed")?
    }
}

fn put_file(url: &str, path: &Path) -> Result<()> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let len = file.metadata()?.len();

    let progress = ProgressBar::new(len);
    progress.set_style(
        ProgressStyle::with_template(
            "{msg} {spinner:.green} {bytes}/{total_bytes} ({percent}%) [{bar:40.cyan/blue}] {eta}",
        )?
        .progress_chars("=>-"),
    );
    progress.set_message(format!("uploading {}", path.display()));

    let client = reqwest::blocking::Client::builder()
        .timeout(None)
        .build()
        .context("Failed to build HTTP client")?;
    let response = client
        .put(url)
        .body(reqwest::blocking::Body::sized(progress.wrap_read(file), len))
        .send()
        .with_context(|| format!("Failed to send upload request to {url}"))?;
    progress.finish_and_clear();

    if !response.status().is_success() {
        return Err(anyhow::anyhow!("Upload to {url} failed: {}", response.status()));
    }
    info!("Upload success: {} -> {url}", path.display());
    Ok(())
}
