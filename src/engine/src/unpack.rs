//! Fetches the source image from the store and reads its metadata.

use std::path::Path;

use docker_squash_core::error::{Result, SquashError};

use crate::archive;
use crate::metadata::{ImageConfig, ImageManifest};
use crate::plan::ImageLayout;
use crate::store::ImageStore;

/// Number of attempts to fetch the image from the store.
const SAVE_ATTEMPTS: u32 = 3;

/// Metadata of the unpacked source image.
#[derive(Debug)]
pub struct UnpackedImage {
    pub layout: ImageLayout,
    pub manifest: ImageManifest,
    pub config: ImageConfig,
}

/// Fetch `image_id` from the store and unpack it into `old_dir`.
///
/// The save is attempted up to three times; each attempt unpacks the
/// returned tar stream in place.
pub fn fetch_image(store: &dyn ImageStore, image_id: &str, old_dir: &Path) -> Result<()> {
    for attempt in 1..=SAVE_ATTEMPTS {
        tracing::info!(
            image = image_id,
            dir = %old_dir.display(),
            attempt,
            "Saving image from the store..."
        );

        let stream = match store.save(image_id) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(image = image_id, error = %e, "Fetching the image failed, retrying");
                continue;
            }
        };

        match archive::unpack_archive(stream, old_dir) {
            Ok(()) => {
                tracing::info!("Image saved successfully");
                return Ok(());
            }
            Err(e) => {
                tracing::warn!(image = image_id, error = %e, "Extracting the image failed, retrying");
            }
        }
    }

    Err(SquashError::StoreUnavailable(format!(
        "could not fetch image {image_id} after {SAVE_ATTEMPTS} attempts"
    )))
}

/// Read the manifest and image config of an unpacked image.
///
/// The layout is OCI when `index.json` exists next to `manifest.json`.
pub fn read_metadata(old_dir: &Path) -> Result<UnpackedImage> {
    let layout = if old_dir.join("index.json").exists() {
        ImageLayout::Oci
    } else {
        ImageLayout::Classic
    };

    let manifest_path = old_dir.join("manifest.json");
    let data = std::fs::read(&manifest_path)
        .map_err(|e| SquashError::ManifestMissing(format!("{}: {e}", manifest_path.display())))?;
    let manifests: Vec<ImageManifest> = serde_json::from_slice(&data)
        .map_err(|e| SquashError::ManifestMissing(format!("{}: {e}", manifest_path.display())))?;
    let manifest = manifests
        .into_iter()
        .next()
        .ok_or_else(|| SquashError::ManifestMissing("manifest list is empty".to_string()))?;

    let config_path = old_dir.join(&manifest.config);
    let data = std::fs::read(&config_path)
        .map_err(|e| SquashError::ConfigMissing(format!("{}: {e}", config_path.display())))?;
    let config: ImageConfig = serde_json::from_slice(&data)
        .map_err(|e| SquashError::ConfigMissing(format!("{}: {e}", config_path.display())))?;

    tracing::debug!(layout = ?layout, layers = manifest.layers.len(), "Read image metadata");

    Ok(UnpackedImage {
        layout,
        manifest,
        config,
    })
}
