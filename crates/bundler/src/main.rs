//! Bundle publisher CLI: packs a bundle directory into a gzip tar,
//! computes its sha256 checksum, and publishes a bundle version record
//! into the record store.
//!
//! Exit codes: 0 success, 1 unrecoverable error, 2 validation failure.

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use weft_core::bundle::archive;
use weft_core::storage::records::RecordStore;
use weft_core::storage::RedbRecordStore;
use weft_core::{BundleArtifactStorage, BundleVersionStatus, Error, JobBundleVersion};

const EXIT_UNRECOVERABLE: i32 = 1;
const EXIT_VALIDATION: i32 = 2;

#[derive(Parser, Debug)]
#[command(name = "weft-bundler")]
#[command(about = "Pack and publish Weft job bundles", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Pack a bundle directory into a gzip tar artifact
    Pack {
        /// Directory containing manifest.json and the handler files
        #[arg(long)]
        bundle_dir: PathBuf,

        /// Output artifact path (defaults to <name>-<version>.tgz)
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Pack, store the artifact under the storage root, and record the
    /// bundle version
    Publish {
        #[arg(long)]
        bundle_dir: PathBuf,

        /// Bundle artifact storage root (local storage)
        #[arg(long, env = "WEFT_BUNDLE_STORAGE_ROOT")]
        storage_root: PathBuf,

        /// Record store file (the server's records.redb)
        #[arg(long)]
        records: PathBuf,

        /// Bundle version number; defaults to latest + 1
        #[arg(long)]
        version: Option<u32>,

        /// Freeze the version: artifact bytes and manifest become
        /// immutable
        #[arg(long)]
        immutable: bool,
    },
}

/// Validate the bundle directory and return its manifest.
fn load_manifest(bundle_dir: &PathBuf) -> Result<weft_core::bundle::BundleManifest, Error> {
    if !bundle_dir.is_dir() {
        return Err(Error::validation(format!(
            "bundle directory '{}' does not exist",
            bundle_dir.display()
        )));
    }
    let manifest = archive::read_manifest(bundle_dir)?;
    if manifest.name.is_empty() {
        return Err(Error::validation("manifest name must not be empty"));
    }
    let entry = bundle_dir.join(&manifest.entry);
    if !entry.is_file() {
        return Err(Error::validation(format!(
            "manifest entry '{}' is not a file in the bundle",
            manifest.entry
        )));
    }
    Ok(manifest)
}

async fn pack(bundle_dir: PathBuf, output: Option<PathBuf>) -> Result<(), Error> {
    let manifest = load_manifest(&bundle_dir)?;
    let bytes = archive::pack_directory(&bundle_dir)?;
    let checksum = archive::checksum(&bytes);

    let output = output.unwrap_or_else(|| {
        PathBuf::from(format!("{}-{}.tgz", manifest.name, manifest.version))
    });
    std::fs::write(&output, &bytes)?;

    println!("packed {} ({} bytes)", output.display(), bytes.len());
    println!("sha256 {checksum}");
    Ok(())
}

async fn publish(
    bundle_dir: PathBuf,
    storage_root: PathBuf,
    records: PathBuf,
    version: Option<u32>,
    immutable: bool,
) -> Result<(), Error> {
    let manifest = load_manifest(&bundle_dir)?;
    let bytes = archive::pack_directory(&bundle_dir)?;
    let checksum = archive::checksum(&bytes);

    let store = RedbRecordStore::new(records)?;
    let slug = manifest.name.clone();
    let version = match version {
        Some(version) => version,
        None => store
            .latest_bundle_version(&slug)
            .await?
            .map(|v| v.version + 1)
            .unwrap_or(1),
    };

    let artifact_path = format!("{slug}/{version}.tgz");
    let target = storage_root.join(&artifact_path);
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&target, &bytes)?;

    let record = store
        .put_bundle_version(JobBundleVersion {
            bundle_slug: slug,
            version,
            manifest,
            checksum: checksum.clone(),
            artifact_storage: BundleArtifactStorage::Local,
            artifact_path,
            immutable,
            status: BundleVersionStatus::Published,
            published_at: Utc::now(),
        })
        .await?;

    println!("published {} ({} bytes)", record.key(), bytes.len());
    println!("sha256 {checksum}");
    Ok(())
}

fn exit_code_for(error: &Error) -> i32 {
    match error {
        Error::Validation(_) => EXIT_VALIDATION,
        _ => EXIT_UNRECOVERABLE,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "weft_bundler=info".into()),
        )
        .with_target(false)
        .init();

    let args = Args::parse();

    let outcome = match args.command {
        Command::Pack { bundle_dir, output } => pack(bundle_dir, output).await,
        Command::Publish {
            bundle_dir,
            storage_root,
            records,
            version,
            immutable,
        } => publish(bundle_dir, storage_root, records, version, immutable).await,
    };

    if let Err(error) = outcome {
        eprintln!("error: {error}");
        std::process::exit(exit_code_for(&error));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_bundle(dir: &TempDir) {
        std::fs::write(
            dir.path().join("manifest.json"),
            r#"{"name":"reporting","version":"1.2.0","entry":"index.js","capabilities":["network"]}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("index.js"), "module.exports.handler = async () => 1;")
            .unwrap();
    }

    #[tokio::test]
    async fn pack_writes_an_artifact() {
        let bundle = TempDir::new().unwrap();
        write_bundle(&bundle);
        let out_dir = TempDir::new().unwrap();
        let output = out_dir.path().join("reporting.tgz");

        pack(bundle.path().to_path_buf(), Some(output.clone()))
            .await
            .unwrap();
        assert!(output.exists());
    }

    #[tokio::test]
    async fn pack_rejects_missing_manifest() {
        let bundle = TempDir::new().unwrap();
        let err = pack(bundle.path().to_path_buf(), None).await.unwrap_err();
        assert_eq!(exit_code_for(&err), EXIT_VALIDATION);
    }

    #[tokio::test]
    async fn publish_records_versions_and_increments() {
        let bundle = TempDir::new().unwrap();
        write_bundle(&bundle);
        let storage = TempDir::new().unwrap();
        let data = TempDir::new().unwrap();
        let records = data.path().join("records.redb");

        publish(
            bundle.path().to_path_buf(),
            storage.path().to_path_buf(),
            records.clone(),
            None,
            true,
        )
        .await
        .unwrap();

        let store = RedbRecordStore::new(records.clone()).unwrap();
        let latest = store.latest_bundle_version("reporting").await.unwrap().unwrap();
        assert_eq!(latest.version, 1);
        assert!(latest.immutable);
        assert!(storage.path().join("reporting/1.tgz").exists());

        // Checksum on record matches the stored artifact bytes.
        let bytes = std::fs::read(storage.path().join("reporting/1.tgz")).unwrap();
        assert_eq!(archive::checksum(&bytes), latest.checksum);
        drop(store);

        // Re-publish bumps to version 2.
        publish(
            bundle.path().to_path_buf(),
            storage.path().to_path_buf(),
            records.clone(),
            None,
            false,
        )
        .await
        .unwrap();
        let store = RedbRecordStore::new(records).unwrap();
        let latest = store.latest_bundle_version("reporting").await.unwrap().unwrap();
        assert_eq!(latest.version, 2);
    }
}
