//! gzip-compressed tar packing and extraction for bundle artifacts.
//!
//! Extraction is hostile-input territory: entries with absolute paths
//! or `..` segments are rejected before anything touches disk.

use crate::error::{Error, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

/// Pack a directory into a gzip tar, paths relative to `dir`.
pub fn pack_directory(dir: &Path) -> Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);

    for entry in walkdir::WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::validation(format!("walking {}: {e}", dir.display())))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(dir)
            .map_err(|e| Error::validation(e.to_string()))?;
        builder
            .append_path_with_name(entry.path(), relative)
            .map_err(Error::Io)?;
    }

    let encoder = builder.into_inner().map_err(Error::Io)?;
    encoder.finish().map_err(Error::Io)
}

fn validate_entry_path(path: &Path) -> Result<()> {
    if path.is_absolute() {
        return Err(Error::validation(format!(
            "archive entry '{}' has an absolute path",
            path.display()
        )));
    }
    if path
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(Error::validation(format!(
            "archive entry '{}' contains a parent-directory segment",
            path.display()
        )));
    }
    Ok(())
}

/// Extract a gzip tar into `dest`, rejecting path-traversal entries.
pub fn extract_archive(bytes: &[u8], dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)?;

    let decoder = GzDecoder::new(bytes);
    let mut archive = tar::Archive::new(decoder);

    for entry in archive.entries().map_err(Error::Io)? {
        let mut entry = entry.map_err(Error::Io)?;
        let path = entry.path().map_err(Error::Io)?.into_owned();
        validate_entry_path(&path)?;

        let target = dest.join(&path);
        if entry.header().entry_type().is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents).map_err(Error::Io)?;
        std::fs::write(&target, contents)?;
    }

    Ok(())
}

/// Read and parse `manifest.json` from an extracted bundle directory.
pub fn read_manifest(dir: &Path) -> Result<super::manifest::BundleManifest> {
    let path = dir.join("manifest.json");
    let contents = std::fs::read_to_string(&path).map_err(|e| {
        Error::validation(format!("missing manifest.json in bundle: {e}"))
    })?;
    serde_json::from_str(&contents)
        .map_err(|e| Error::validation(format!("invalid manifest.json: {e}")))
}

/// sha256 over artifact bytes, hex-encoded.
pub fn checksum(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(bytes))
}

pub fn staging_dir(root: &Path, key: &str) -> PathBuf {
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    root.join("__staging").join(format!("{key}-{nonce}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn pack_then_extract_round_trips_files() {
        let src = TempDir::new().unwrap();
        std::fs::write(src.path().join("manifest.json"), "{}").unwrap();
        std::fs::create_dir_all(src.path().join("lib")).unwrap();
        std::fs::write(src.path().join("lib/util.js"), "module.exports = 1;").unwrap();

        let bytes = pack_directory(src.path()).unwrap();

        let dest = TempDir::new().unwrap();
        extract_archive(&bytes, dest.path()).unwrap();

        assert!(dest.path().join("manifest.json").exists());
        assert_eq!(
            std::fs::read_to_string(dest.path().join("lib/util.js")).unwrap(),
            "module.exports = 1;"
        );
    }

    #[test]
    fn rejects_parent_dir_entries() {
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(encoder);

        let data = b"malicious";
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_cksum();
        builder
            .append_data(&mut header, "../escape.txt", data.as_slice())
            .unwrap();
        let bytes = builder.into_inner().unwrap().finish().unwrap();

        let dest = TempDir::new().unwrap();
        let err = extract_archive(&bytes, dest.path()).unwrap_err();
        assert!(err.to_string().contains("parent-directory"));
        assert!(!dest.path().join("../escape.txt").exists());
    }

    #[test]
    fn checksum_is_stable_hex_sha256() {
        let sum = checksum(b"hello");
        assert_eq!(sum.len(), 64);
        assert_eq!(sum, checksum(b"hello"));
        assert_ne!(sum, checksum(b"world"));
    }
}
