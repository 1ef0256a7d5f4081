//! Base image acquisition: download, verification, extraction and the
//! compression round trip used to ship finished images.

mod checksum;
mod download;
mod image;

pub use checksum::{extract_checksums, sha256_bytes, sha256_file, verify_digest, Checksums};
pub use download::{download_file, MediaArtifact, MediaFetcher};
pub use image::{compress_image, decompress_zstd, extract_xz, release_image_name};
