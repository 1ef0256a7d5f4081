use anyhow::{Context, Result};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use super::checksum::{extract_checksums, sha256_file, verify_digest};

/// A downloadable file and where it lives locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaArtifact {
    pub name: String,
    pub url: String,
    pub path: PathBuf,
    pub expected_hash: Option<String>,
}

/// Downloads the base image and its checksum list, then verifies the image.
pub struct MediaFetcher {
    release_url: String,
    work_dir: PathBuf,
}

impl MediaFetcher {
    pub fn new(release_url: &str, work_dir: &Path) -> Self {
        Self {
            release_url: release_url.trim_end_matches('/').to_string(),
            work_dir: work_dir.to_path_buf(),
        }
    }

    pub fn artifact(&self, name: &str) -> MediaArtifact {
        MediaArtifact {
            name: name.to_string(),
            url: format!("{}/{}", self.release_url, name),
            path: self.work_dir.join(name),
            expected_hash: None,
        }
    }

    /// Make `target_name` and `checksum_name` available locally and verify the
    /// target against the checksum list.
    ///
    /// Files already present are not fetched again unless `force` is set. The
    /// two downloads run concurrently; the call waits for both and then fails
    /// with the first error. Partially written files stay on disk.
    pub async fn acquire(
        &self,
        target_name: &str,
        checksum_name: &str,
        force: bool,
    ) -> Result<MediaArtifact> {
        let mut target = self.artifact(target_name);
        let sums = self.artifact(checksum_name);

        let fetch_target = force || !target.path.exists();
        let fetch_sums = force || !sums.path.exists();
        if !fetch_target && !fetch_sums {
            info!("{target_name} and {checksum_name} already present, skipping download");
        }

        // Both downloads run to completion before the first error is returned,
        // so nothing keeps writing into the work directory after a failure.
        let progress = MultiProgress::new();
        let (target_result, sums_result) = tokio::join!(
            fetch_if(fetch_target, &target, &progress),
            fetch_if(fetch_sums, &sums, &progress),
        );
        target_result?;
        sums_result?;

        let listing = tokio::fs::read(&sums.path)
            .await
            .with_context(|| format!("failed to read {}", sums.path.display()))?;
        let checksums = extract_checksums(&listing)?;

        let image_path = target.path.clone();
        let actual = tokio::task::spawn_blocking(move || sha256_file(&image_path))
            .await
            .context("hashing task failed")??;
        let expected = verify_digest(target_name, &actual, &checksums)?;
        info!("verified {target_name} (sha256 {expected})");

        target.expected_hash = Some(expected);
        Ok(target)
    }
}

async fn fetch_if(needed: bool, artifact: &MediaArtifact, progress: &MultiProgress) -> Result<()> {
    if !needed {
        return Ok(());
    }
    let url = artifact.url.clone();
    let dest = artifact.path.clone();
    let bar = progress.add(ProgressBar::no_length());
    bar.set_message(artifact.name.clone());
    tokio::task::spawn_blocking(move || download_file(&url, &dest, &bar))
        .await
        .context("download task failed")?
}

/// Stream `url` into `dest`, updating `progress` as bytes arrive.
pub fn download_file(url: &str, dest: &Path, progress: &ProgressBar) -> Result<()> {
    info!("downloading {url}");
    let client = reqwest::blocking::Client::builder()
        .timeout(None)
        .build()
        .context("Failed to build HTTP client")?;
    let mut response = client
        .get(url)
        .send()
        .with_context(|| format!("Failed to send download request for {url}"))?;

    if !response.status().is_success() {
        return Err(anyhow::anyhow!(
            "Download of {url} failed: {}",
            response.status()
        ));
    }

    match response.content_length() {
        Some(total) if total > 0 => {
            progress.set_length(total);
            progress.set_style(
                ProgressStyle::with_template(
                    "{msg} {spinner:.green} {bytes}/{total_bytes} ({percent}%) [{bar:40.cyan/blue}] {eta}",
                )?
                .progress_chars("=>-"),
            );
        }
        _ => {
            progress.set_style(ProgressStyle::with_template(
                "{msg} {spinner:.green} {bytes} downloaded",
            )?);
            progress.enable_steady_tick(std::time::Duration::from_millis(120));
        }
    }

    if let Some(parent) = dest.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    let mut file =
        File::create(dest).with_context(|| format!("Failed to create {}", dest.display()))?;

    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = response
            .read(&mut buffer)
            .with_context(|| format!("Failed to read response body of {url}"))?;
        if read == 0 {
            break;
        }
        file.write_all(&buffer[..read])
            .with_context(|| format!("Failed to write {}", dest.display()))?;
        progress.inc(read as u64);
    }
    file.flush()?;
    progress.finish_and_clear();

    info!("downloaded {} ({} bytes)", dest.display(), progress.position());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::{Duration, Instant};

    const IMAGE: &[u8] = b"slow but complete image body";

    /// Serves two requests: the checksum list fails at once, the image
    /// arrives after `delay`.
    fn serve_slow_image(delay: Duration) -> (String, thread::JoinHandle<()>) {
        let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
        let port = server.server_addr().to_ip().unwrap().port();
        let handle = thread::spawn(move || {
            let mut workers = Vec::new();
            for _ in 0..2 {
                let request = server.recv().unwrap();
                workers.push(thread::spawn(move || {
                    if request.url().ends_with("SHA256SUMS") {
                        request.respond(tiny_http::Response::empty(404)).unwrap();
                    } else {
                        thread::sleep(delay);
                        request
                            .respond(tiny_http::Response::from_data(IMAGE.to_vec()))
                            .unwrap();
                    }
                }));
            }
            for worker in workers {
                worker.join().unwrap();
            }
        });
        (format!("http://127.0.0.1:{port}/releases"), handle)
    }

    #[tokio::test]
    async fn failed_download_waits_for_its_sibling() {
        let delay = Duration::from_millis(400);
        let (base, server) = serve_slow_image(delay);
        let dir = tempfile::tempdir().unwrap();
        let started = Instant::now();

        let err = MediaFetcher::new(&base, dir.path())
            .acquire("base.img.xz", "SHA256SUMS", true)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("404"), "{err:#}");
        assert!(started.elapsed() >= delay);
        assert_eq!(fs::read(dir.path().join("base.img.xz")).unwrap(), IMAGE);
        server.join().unwrap();
    }

    #[test]
    fn artifact_urls_join_release_and_name() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = MediaFetcher::new("https://cdimage.example.com/release/", dir.path())
            .artifact("SHA256SUMS");
        assert_eq!(artifact.url, "https://cdimage.example.com/release/SHA256SUMS");
        assert_eq!(artifact.path, dir.path().join("SHA256SUMS"));
        assert_eq!(artifact.expected_hash, None);
    }
}
