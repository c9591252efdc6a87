//! Squash planning: which layers move, which merge.

use std::path::{Path, PathBuf};

use docker_squash_core::error::{Result, SquashError};

use crate::metadata::{ImageConfig, ImageManifest};
use crate::store::ImageStore;

/// On-disk image layout, decided once while unpacking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageLayout {
    /// docker-save layout: layer tars at `<id>/layer.tar`
    Classic,
    /// OCI layout: layer tars at their manifest path (`blobs/sha256/<digest>`)
    Oci,
}

impl ImageLayout {
    /// Location of a layer's tar archive relative to the image root.
    ///
    /// Every layer-path computation that differs between the layouts
    /// goes through here.
    pub fn layer_tar_path(&self, layer_path: &str) -> PathBuf {
        match self {
            ImageLayout::Classic => Path::new(layer_path).join("layer.tar"),
            ImageLayout::Oci => PathBuf::from(layer_path),
        }
    }
}

/// The partition of an image's layer stack for one squash run.
#[derive(Debug, Default)]
pub struct SquashPlan {
    /// Preserved prefix, bottom-first (history-level ids)
    pub layers_to_move: Vec<String>,
    /// Merged suffix, bottom-first (history-level ids)
    pub layers_to_squash: Vec<String>,
    /// Manifest paths of preserved layers, bottom-first
    pub layer_paths_to_move: Vec<String>,
    /// Manifest paths of merged layers, bottom-first
    pub layer_paths_to_squash: Vec<String>,
}

/// Resolve the `from-layer` argument into a squash count.
///
/// An integer is taken as the number of layers to squash; anything else
/// is treated as a layer reference, inspected for its canonical id and
/// located in the bottom-first layer list.
pub fn resolve_squash_count(
    store: &dyn ImageStore,
    all_layers: &[String],
    from_layer: &str,
) -> Result<i64> {
    if let Ok(count) = from_layer.parse::<i64>() {
        tracing::debug!(count, "Squashing a number of layers");
        return Ok(count);
    }

    tracing::debug!(layer = from_layer, "Squashing from a layer reference");
    let info = store.inspect(from_layer)?;
    tracing::info!(id = %info.id, "Layer to squash from");

    let index = all_layers
        .iter()
        .position(|layer| *layer == info.id)
        .ok_or_else(|| {
            SquashError::NotFound(format!("layer {from_layer} is not part of the image"))
        })?;

    Ok(all_layers.len() as i64 - index as i64 - 1)
}

/// Validate the squash count against the layer stack.
pub fn validate_squash_count(squash_count: i64, total_layers: usize) -> Result<usize> {
    if squash_count <= 0 {
        return Err(SquashError::InvalidLayerCount(format!(
            "cannot be less or equal 0, provided: {squash_count}"
        )));
    }
    if squash_count as usize > total_layers {
        return Err(SquashError::InvalidLayerCount(format!(
            "cannot squash {squash_count} layers, the image contains only {total_layers} layers"
        )));
    }
    Ok(squash_count as usize)
}

/// Partition the bottom-first layer list at `len - squash_count`.
///
/// A single-layer squash set means there is nothing to merge.
pub fn partition_layers(
    all_layers: &[String],
    squash_count: usize,
) -> Result<(Vec<String>, Vec<String>)> {
    let split = all_layers.len() - squash_count;
    let to_move = all_layers[..split].to_vec();
    let to_squash = all_layers[split..].to_vec();

    if to_squash.len() == 1 {
        return Err(SquashError::SquashUnnecessary);
    }

    tracing::debug!(to_move = ?to_move, to_squash = ?to_squash, "Partitioned layers");
    Ok((to_move, to_squash))
}

/// Map the layer partition onto manifest layer paths.
///
/// Walks the config history bottom-first, advancing a manifest cursor
/// only on non-empty entries; entries below the move boundary contribute
/// their manifest path to the move set, the rest to the squash set.
/// This mapping is the sole bridge between the store's history view and
/// the unpacked layer directories.
pub fn layer_paths(
    config: &ImageConfig,
    manifest: &ImageManifest,
    move_count: usize,
    layout: ImageLayout,
) -> Result<(Vec<String>, Vec<String>)> {
    let mut paths_to_move = Vec::new();
    let mut paths_to_squash = Vec::new();
    let mut cursor = 0usize;

    for (i, entry) in config.history.iter().flatten().enumerate() {
        if entry.empty_layer {
            continue;
        }

        let layer = manifest.layers.get(cursor).ok_or_else(|| {
            SquashError::ManifestMissing(format!(
                "manifest lists {} layers but the history references more",
                manifest.layers.len()
            ))
        })?;
        let layer_id = match layout {
            ImageLayout::Oci => layer.clone(),
            ImageLayout::Classic => layer
                .split('/')
                .next()
                .unwrap_or(layer.as_str())
                .to_string(),
        };

        if move_count > i {
            paths_to_move.push(layer_id);
        } else {
            paths_to_squash.push(layer_id);
        }
        cursor += 1;
    }

    Ok((paths_to_move, paths_to_squash))
}
