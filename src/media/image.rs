use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Decompress `archive` (`*.xz`) next to itself and return the image path.
///
/// Skipped when the decompressed image already exists. Output goes to a
/// temporary file in the same directory and is renamed into place on success.
pub async fn extract_xz(archive: &Path) -> Result<PathBuf> {
    let image = archive.with_extension("");
    if image == archive {
        anyhow::bail!("{} has no extension to strip", archive.display());
    }
    if image.exists() {
        info!("{} already extracted", image.display());
        return Ok(image);
    }

    let source = archive.to_path_buf();
    let target = image.clone();
    tokio::task::spawn_blocking(move || {
        let input = File::open(&source)
            .with_context(|| format!("Failed to open xz image: {}", source.display()))?;
        let mut decoder = xz2::read::XzDecoder::new(BufReader::new(input));
        write_atomically(&target, |out| {
            io::copy(&mut decoder, out).context("Failed to decompress xz image")?;
            Ok(())
        })
    })
    .await
    .context("extraction task failed")??;

    info!("extracted {} -> {}", archive.display(), image.display());
    Ok(image)
}

/// Name a finished image gets before compression:
/// `<prefix>-<MM-DD-YYYY>-<unix millis>.img`.
pub fn release_image_name<Tz: TimeZone>(prefix: &str, now: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!(
        "{prefix}-{}-{}.img",
        now.format("%m-%d-%Y"),
        now.timestamp_millis()
    )
}

/// Rename `image` to `name` in its directory, then zstd-encode it to
/// `<name>.zst`. Returns the compressed file.
pub async fn compress_image(image: &Path, name: &str, level: i32) -> Result<PathBuf> {
    let renamed = image.with_file_name(name);
    fs::rename(image, &renamed).with_context(|| {
        format!(
            "Failed to rename {} to {}",
            image.display(),
            renamed.display()
        )
    })?;
    let compressed = renamed.with_file_name(format!("{name}.zst"));

    let source = renamed.clone();
    let target = compressed.clone();
    tokio::task::spawn_blocking(move || {
        let input = File::open(&source)
            .with_context(|| format!("Failed to open {}", source.display()))?;
        write_atomically(&target, |out| {
            let mut encoder = zstd::stream::Encoder::new(out, level)?;
            io::copy(&mut BufReader::new(input), &mut encoder)
                .context("Failed to compress image")?;
            encoder.finish()?;
            Ok(())
        })
    })
    .await
    .context("compression task failed")??;

    info!("compressed {} -> {}", renamed.display(), compressed.display());
    Ok(compressed)
}

/// zstd-decode `source` into `dest`. Returns `false` when `dest` already exists.
pub async fn decompress_zstd(source: &Path, dest: &Path) -> Result<bool> {
    if dest.exists() {
        info!("{} already decompressed", dest.display());
        return Ok(false);
    }
    let source = source.to_path_buf();
    let target = dest.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let input = File::open(&source)
            .with_context(|| format!("Failed to open {}", source.display()))?;
        let mut decoder = zstd::stream::Decoder::new(input)?;
        write_atomically(&target, |out| {
            io::copy(&mut decoder, out).context("Failed to decompress image")?;
            Ok(())
        })
    })
    .await
    .context("decompression task failed")??;
    info!("decompressed image to {}", dest.display());
    Ok(true)
}

fn write_atomically<F>(dest: &Path, fill: F) -> Result<()>
where
    F: FnOnce(&mut BufWriter<&File>) -> Result<()>,
{
    let dir = match dest.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
    {
        let mut writer = BufWriter::new(tmp.as_file());
        fill(&mut writer)?;
        writer.flush()?;
    }
    tmp.as_file().sync_all().ok();
    tmp.persist(dest)
        .with_context(|| format!("Failed to persist {}", dest.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn release_name_carries_date_and_millis() {
        let now = Utc.with_ymd_and_hms(2022, 10, 3, 12, 0, 0).unwrap();
        assert_eq!(
            release_image_name("ubuntu-20-04-arm64", &now),
            "ubuntu-20-04-arm64-10-03-2022-1664798400000.img"
        );
    }

    #[tokio::test]
    async fn compress_then_decompress_restores_image() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("work.img");
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        fs::write(&image, &data).unwrap();

        let compressed = compress_image(&image, "node.img", 3).await.unwrap();
        assert_eq!(compressed, dir.path().join("node.img.zst"));
        assert!(!image.exists());
        assert!(dir.path().join("node.img").exists());

        let restored = dir.path().join("flash.img");
        assert!(decompress_zstd(&compressed, &restored).await.unwrap());
        assert_eq!(fs::read(&restored).unwrap(), data);
        assert!(!decompress_zstd(&compressed, &restored).await.unwrap());
    }

    #[tokio::test]
    async fn extraction_skips_existing_image() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("base.img.xz");
        fs::write(&archive, b"not really xz").unwrap();
        fs::write(dir.path().join("base.img"), b"already here").unwrap();

        let image = extract_xz(&archive).await.unwrap();
        assert_eq!(fs::read(image).unwrap(), b"already here");
    }

    #[tokio::test]
    async fn failed_extraction_leaves_no_image() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("base.img.xz");
        fs::write(&archive, b"not really xz").unwrap();

        assert!(extract_xz(&archive).await.is_err());
        assert!(!dir.path().join("base.img").exists());
    }

    #[tokio::test]
    async fn extracts_xz_archive() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("base.img.xz");
        let mut encoder = xz2::write::XzEncoder::new(Vec::new(), 6);
        encoder.write_all(b"boot sector and friends").unwrap();
        fs::write(&archive, encoder.finish().unwrap()).unwrap();

        let image = extract_xz(&archive).await.unwrap();
        assert_eq!(image, dir.path().join("base.img"));
        assert_eq!(fs::read(image).unwrap(), b"boot sector and friends");
    }
}
