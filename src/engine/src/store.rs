//! Image store access.
//!
//! The engine talks to an image store through the [`ImageStore`] trait:
//! resolve a reference, read layer history, save an image as a tar
//! stream, and load a finished archive back. [`LocalStore`] is a
//! disk-backed implementation keeping docker-save layouts under a root
//! directory with a persistent reference index.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use docker_squash_core::config::StoreConfig;
use docker_squash_core::error::{Result, SquashError};
use serde::{Deserialize, Serialize};

use crate::archive;
use crate::metadata::{ImageConfig, ImageManifest};

/// Identity of a stored image.
#[derive(Debug, Clone)]
pub struct ImageInfo {
    /// Canonical image id
    pub id: String,
}

/// One entry of an image's layer history, top-most layer first.
#[derive(Debug, Clone)]
pub struct HistoryItem {
    /// Layer id, or `<missing>` when the layer has none of its own
    pub id: String,
    /// Command that produced the layer
    pub created_by: String,
    /// Whether the entry contributed no filesystem content
    pub empty_layer: bool,
}

/// Placeholder id for history entries without a layer of their own.
pub const MISSING_LAYER_ID: &str = "<missing>";

/// The four image store operations the engine consumes.
pub trait ImageStore {
    /// Resolve a reference to a stored image.
    fn inspect(&self, reference: &str) -> Result<ImageInfo>;

    /// Layer history of an image, top-most layer first.
    fn history(&self, id: &str) -> Result<Vec<HistoryItem>>;

    /// Save an image as a tar stream of its on-disk layout.
    fn save(&self, id: &str) -> Result<Box<dyn Read>>;

    /// Load an image archive produced by the assembler.
    fn load(&self, reader: &mut dyn Read) -> Result<()>;
}

/// Persistent index stored as JSON in the store root.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreIndex {
    /// reference (`name:tag`) → image id
    references: HashMap<String, String>,
}

/// Disk-backed image store.
///
/// Layout: one directory per image id under the root, each holding a
/// docker-save layout (`manifest.json`, layer directories, config),
/// plus an `index.json` mapping references to image ids. Operations
/// complete synchronously; the configured timeout is carried for parity
/// with remote stores.
pub struct LocalStore {
    root: PathBuf,
    config: StoreConfig,
}

const INDEX_FILE: &str = "index.json";

impl LocalStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: &Path, config: StoreConfig) -> Result<Self> {
        std::fs::create_dir_all(root)?;
        tracing::debug!(
            root = %root.display(),
            timeout_secs = config.timeout.as_secs(),
            "Opened local image store"
        );
        Ok(Self {
            root: root.to_path_buf(),
            config,
        })
    }

    /// Store operation timeout.
    pub fn timeout(&self) -> std::time::Duration {
        self.config.timeout
    }

    fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE)
    }

    fn load_index(&self) -> Result<StoreIndex> {
        let path = self.index_path();
        if !path.exists() {
            return Ok(StoreIndex::default());
        }
        let data = std::fs::read(&path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    fn save_index(&self, index: &StoreIndex) -> Result<()> {
        let data = serde_json::to_vec(index)?;
        std::fs::write(self.index_path(), data)?;
        Ok(())
    }

    fn image_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    fn read_manifest(&self, id: &str) -> Result<ImageManifest> {
        let path = self.image_dir(id).join("manifest.json");
        let data = std::fs::read(&path)
            .map_err(|e| SquashError::ManifestMissing(format!("{}: {e}", path.display())))?;
        let manifests: Vec<ImageManifest> = serde_json::from_slice(&data)
            .map_err(|e| SquashError::ManifestMissing(format!("{}: {e}", path.display())))?;
        manifests
            .into_iter()
            .next()
            .ok_or_else(|| SquashError::ManifestMissing(format!("{} is empty", path.display())))
    }

    fn read_config(&self, id: &str, manifest: &ImageManifest) -> Result<ImageConfig> {
        let path = self.image_dir(id).join(&manifest.config);
        let data = std::fs::read(&path)
            .map_err(|e| SquashError::ConfigMissing(format!("{}: {e}", path.display())))?;
        serde_json::from_slice(&data)
            .map_err(|e| SquashError::ConfigMissing(format!("{}: {e}", path.display())))
    }
}

impl ImageStore for LocalStore {
    fn inspect(&self, reference: &str) -> Result<ImageInfo> {
        let index = self.load_index()?;
        if let Some(id) = index.references.get(reference) {
            return Ok(ImageInfo { id: id.clone() });
        }

        let bare = reference.strip_prefix("sha256:").unwrap_or(reference);
        if self.image_dir(bare).join("manifest.json").exists() {
            return Ok(ImageInfo {
                id: bare.to_string(),
            });
        }

        // Fall back to an unambiguous id-prefix match over image dirs.
        let mut matched: Option<String> = None;
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.path().is_dir() && name.starts_with(bare) {
                if matched.is_some() {
                    return Err(SquashError::NotFound(format!(
                        "ambiguous reference: {reference}"
                    )));
                }
                matched = Some(name);
            }
        }
        matched
            .map(|id| ImageInfo { id })
            .ok_or_else(|| SquashError::NotFound(reference.to_string()))
    }

    fn history(&self, id: &str) -> Result<Vec<HistoryItem>> {
        let manifest = self.read_manifest(id)?;
        let config = self.read_config(id, &manifest)?;

        let history = config.history.unwrap_or_default();
        let mut cursor = manifest.layers.len();
        let mut items = Vec::with_capacity(history.len());
        for entry in history.iter().rev() {
            let layer_id = if entry.empty_layer {
                MISSING_LAYER_ID.to_string()
            } else if cursor > 0 {
                cursor -= 1;
                let layer = &manifest.layers[cursor];
                layer
                    .split('/')
                    .next()
                    .unwrap_or(layer.as_str())
                    .to_string()
            } else {
                MISSING_LAYER_ID.to_string()
            };
            items.push(HistoryItem {
                id: layer_id,
                created_by: entry.created_by.clone(),
                empty_layer: entry.empty_layer,
            });
        }
        Ok(items)
    }

    fn save(&self, id: &str) -> Result<Box<dyn Read>> {
        let dir = self.image_dir(id);
        if !dir.is_dir() {
            return Err(SquashError::NotFound(id.to_string()));
        }

        let mut file = tempfile::tempfile()?;
        archive::archive_dir(&dir, &mut file)?;
        file.seek(SeekFrom::Start(0))?;
        Ok(Box::new(file))
    }

    fn load(&self, reader: &mut dyn Read) -> Result<()> {
        let staging = tempfile::tempdir_in(&self.root)?;
        archive::unpack_archive(reader, staging.path())?;

        let manifest_path = staging.path().join("manifest.json");
        let data = std::fs::read(&manifest_path)
            .map_err(|e| SquashError::ManifestMissing(format!("{}: {e}", manifest_path.display())))?;
        let manifests: Vec<ImageManifest> = serde_json::from_slice(&data)
            .map_err(|e| SquashError::ManifestMissing(e.to_string()))?;
        let manifest = manifests
            .into_iter()
            .next()
            .ok_or_else(|| SquashError::ManifestMissing("loaded manifest is empty".to_string()))?;

        let image_id = manifest
            .config
            .strip_suffix(".json")
            .unwrap_or(&manifest.config)
            .to_string();
        if image_id.is_empty() {
            return Err(SquashError::ManifestMissing(
                "loaded manifest has no config entry".to_string(),
            ));
        }

        let target = self.image_dir(&image_id);
        if target.exists() {
            std::fs::remove_dir_all(&target)?;
        }
        std::fs::rename(staging.keep(), &target)?;

        let mut index = self.load_index()?;
        for tag in manifest.repo_tags.iter().flatten() {
            index.references.insert(tag.clone(), image_id.clone());
        }
        self.save_index(&index)?;

        tracing::info!(image = %image_id, "Image loaded");
        Ok(())
    }
}
