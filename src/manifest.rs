//! Content-addressed manifest of a static assets directory.
//!
//! Every regular file is recorded under its root-relative, `/`-prefixed path
//! with a truncated SHA-256 of its bytes. Identical files share a hash, which
//! lets the platform skip bytes it already holds from a previous deploy.

use crate::error::{DeployError, DeployResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use walkdir::WalkDir;

/// Hex characters kept from the SHA-256 digest.
pub const ASSET_HASH_LEN: usize = 32;

const FALLBACK_CONTENT_TYPE: &str = "application/null";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetEntry {
    pub hash: String,
    pub size: u64,
}

/// Path -> `{hash, size}`. Ordered so serialisation is stable across runs.
pub type AssetManifest = BTreeMap<String, AssetEntry>;

#[derive(Debug, Clone)]
pub struct AssetBlob {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

/// File contents indexed by content hash.
#[derive(Debug, Clone, Default)]
pub struct AssetBlobs {
    by_hash: HashMap<String, AssetBlob>,
}

impl AssetBlobs {
    /// Index path-keyed file contents through the manifest's hashes.
    pub fn from_files_by_path(
        manifest: &AssetManifest,
        files: HashMap<String, Vec<u8>>,
    ) -> DeployResult<Self> {
        let mut blobs = Self::default();
        for (path, bytes) in files {
            let key = normalize_manifest_path(&path);
            let entry = manifest.get(&key).ok_or_else(|| {
                DeployError::InvalidRequest(format!("file {} is not in the assets manifest", path))
            })?;
            blobs.insert(entry.hash.clone(), &key, bytes);
        }
        Ok(blobs)
    }

    fn insert(&mut self, hash: String, path: &str, bytes: Vec<u8>) {
        self.by_hash.entry(hash).or_insert_with(|| AssetBlob {
            bytes,
            content_type: content_type_for(path),
        });
    }

    pub fn get(&self, hash: &str) -> Option<&AssetBlob> {
        self.by_hash.get(hash)
    }

    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct BuiltAssets {
    pub manifest: AssetManifest,
    pub blobs: AssetBlobs,
    pub skipped: usize,
}

pub fn hash_asset(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = format!("{:x}", hasher.finalize());
    digest[..ASSET_HASH_LEN].to_string()
}

/// MIME type the platform should serve the asset with.
pub fn content_type_for(path: &str) -> String {
    mime_guess::from_path(path)
        .first_raw()
        .unwrap_or(FALLBACK_CONTENT_TYPE)
        .to_string()
}

fn normalize_relative_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn normalize_manifest_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}

fn is_skippable_asset(path: &Path) -> bool {
    let normalized = normalize_relative_path(path);
    normalized
        .split('/')
        .any(|part| part == "__MACOSX" || part == ".DS_Store" || part.starts_with("._"))
}

/// Walk `assets_dir` and hash every regular file.
///
/// An unreadable file aborts the build; no partial manifest is returned.
pub fn build_manifest(assets_dir: &Path) -> DeployResult<BuiltAssets> {
    if !assets_dir.is_dir() {
        return Err(DeployError::InvalidRequest(format!(
            "Assets path is not a directory: {}",
            assets_dir.display()
        )));
    }

    let mut built = BuiltAssets::default();
    for entry in WalkDir::new(assets_dir).follow_links(false) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let relative = entry.path().strip_prefix(assets_dir).map_err(|_| {
            DeployError::InvalidRequest(format!(
                "Failed to resolve relative asset path for {}",
                entry.path().display()
            ))
        })?;
        if is_skippable_asset(relative) {
            built.skipped += 1;
            continue;
        }

        let path = normalize_manifest_path(&normalize_relative_path(relative));
        let bytes = fs::read(entry.path()).map_err(|source| DeployError::AssetRead {
            path: entry.path().to_path_buf(),
            source,
        })?;
        let hash = hash_asset(&bytes);
        built.manifest.insert(
            path.clone(),
            AssetEntry {
                hash: hash.clone(),
                size: bytes.len() as u64,
            },
        );
        built.blobs.insert(hash, &path, bytes);
    }

    if built.skipped > 0 {
        tracing::debug!(
            skipped = built.skipped,
            dir = %assets_dir.display(),
            "skipped metadata files in assets directory"
        );
    }
    Ok(built)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, rel: &str, contents: &[u8]) {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn identical_content_shares_a_hash() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a/logo.txt", b"same bytes");
        write(dir.path(), "b/copy.txt", b"same bytes");
        write(dir.path(), "index.html", b"<html></html>");

        let built = build_manifest(dir.path()).unwrap();
        assert_eq!(built.manifest.len(), 3);
        assert_eq!(
            built.manifest["/a/logo.txt"].hash,
            built.manifest["/b/copy.txt"].hash
        );
        assert_ne!(
            built.manifest["/a/logo.txt"].hash,
            built.manifest["/index.html"].hash
        );
        assert_eq!(built.blobs.len(), 2);
    }

    #[test]
    fn rebuild_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "index.html", b"<h1>hi</h1>");
        write(dir.path(), "assets/app.js", b"console.log(1)");

        let first = serde_json::to_string(&build_manifest(dir.path()).unwrap().manifest).unwrap();
        let second = serde_json::to_string(&build_manifest(dir.path()).unwrap().manifest).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn hashes_are_truncated_sha256() {
        let hash = hash_asset(b"hello");
        assert_eq!(hash.len(), ASSET_HASH_LEN);
        assert_eq!(hash, "2cf24dba5fb0a30e26e83b2ac5b9e29e");
    }

    #[test]
    fn skips_metadata_files() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "index.html", b"ok");
        write(dir.path(), ".DS_Store", b"junk");
        write(dir.path(), "__MACOSX/index.html", b"junk");

        let built = build_manifest(dir.path()).unwrap();
        assert_eq!(built.manifest.keys().collect::<Vec<_>>(), vec!["/index.html"]);
        assert_eq!(built.skipped, 2);
    }

    #[test]
    fn records_size_and_content_type() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "style.css", b"body{}");

        let built = build_manifest(dir.path()).unwrap();
        let entry = &built.manifest["/style.css"];
        assert_eq!(entry.size, 6);
        assert_eq!(built.blobs.get(&entry.hash).unwrap().content_type, "text/css");
    }

    #[test]
    fn missing_directory_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = build_manifest(&dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, DeployError::InvalidRequest(_)));
    }

    #[test]
    fn blobs_from_paths_follow_manifest_hashes() {
        let mut manifest = AssetManifest::new();
        manifest.insert(
            "/index.html".into(),
            AssetEntry {
                hash: "abc".into(),
                size: 2,
            },
        );
        let files = HashMap::from([("index.html".to_string(), b"hi".to_vec())]);

        let blobs = AssetBlobs::from_files_by_path(&manifest, files).unwrap();
        let blob = blobs.get("abc").unwrap();
        assert_eq!(blob.bytes, b"hi");
        assert_eq!(blob.content_type, "text/html");

        let stray = HashMap::from([("/other.js".to_string(), b"x".to_vec())]);
        assert!(AssetBlobs::from_files_by_path(&manifest, stray).is_err());
    }
}
