//! Assembles the new image: digests, metadata documents, layer layout.
//!
//! Everything content-addressed lives here. The image id is the SHA256
//! of the exact bytes written to the config file, so each document is
//! serialized once and those bytes are both hashed and written.

use std::path::Path;

use docker_squash_core::error::{Result, SquashError};

use crate::digest;
use crate::metadata::{HistoryEntry, ImageConfig, ImageManifest, Rootfs};
use crate::plan::ImageLayout;

/// Compute diff ids for the preserved layers plus the merged layer.
///
/// Preserved layer tars are digested in place under `old_dir`; the
/// merged tar (when present) is appended last.
pub fn generate_diff_ids(
    old_dir: &Path,
    layout: ImageLayout,
    paths_to_move: &[String],
    squashed_tar: Option<&Path>,
) -> Result<Vec<String>> {
    let mut diff_ids = Vec::with_capacity(paths_to_move.len() + 1);
    for path in paths_to_move {
        let tar_path = old_dir.join(layout.layer_tar_path(path));
        diff_ids.push(digest::sha256_file(&tar_path)?);
    }
    if let Some(tar) = squashed_tar {
        diff_ids.push(digest::sha256_file(tar)?);
    }
    Ok(diff_ids)
}

/// Build the new image config.
///
/// Clones the durable parts of the source config, truncates history and
/// rootfs to the preserved prefix, and appends one history entry for
/// the squashed layer (marked empty when nothing was merged).
#[allow(clippy::too_many_arguments)]
pub fn new_image_config(
    old: &ImageConfig,
    move_count: usize,
    paths_to_move_count: usize,
    squashed_diff_id: Option<&str>,
    created: &str,
    created_by: &str,
    comment: &str,
    squash_id: &str,
) -> ImageConfig {
    let mut config = ImageConfig {
        architecture: old.architecture.clone(),
        author: old.author.clone(),
        config: old.config.clone(),
        docker_version: old.docker_version.clone(),
        os: old.os.clone(),
        rootfs: old.rootfs.clone(),
        ..Default::default()
    };
    config.created = created.to_string();

    let mut history = old.history.clone().unwrap_or_default();
    if history.len() > move_count {
        history.truncate(move_count);
    }

    let mut diff_ids = config.rootfs.diff_ids.take().unwrap_or_default();
    if diff_ids.len() > paths_to_move_count {
        diff_ids.truncate(paths_to_move_count);
    }

    let mut entry = HistoryEntry {
        created: created.to_string(),
        created_by: created_by.to_string(),
        comment: comment.to_string(),
        ..Default::default()
    };
    match squashed_diff_id {
        Some(diff_id) => diff_ids.push(format!("sha256:{diff_id}")),
        None => entry.empty_layer = true,
    }
    history.push(entry);

    config.history = Some(history);
    config.rootfs.diff_ids = Some(diff_ids);
    config.config.image = squash_id.to_string();
    config
}

/// Serialize the image config, derive the image id, and write the file.
///
/// The hashed bytes are the compact JSON plus one trailing newline, and
/// those exact bytes land in `new/<image_id>.json`.
pub fn write_image_config(config: &ImageConfig, new_dir: &Path) -> Result<String> {
    let mut bytes = serde_json::to_vec(config)?;
    bytes.push(b'\n');

    let image_id = digest::sha256_bytes(&bytes);
    std::fs::write(new_dir.join(format!("{image_id}.json")), &bytes)?;
    Ok(image_id)
}

/// Derive the directory id of the squashed layer.
///
/// A variant of the source config with history and rootfs nulled out,
/// `layerID` set to the final chain id and `parent` to the last
/// preserved layer, serialized without a trailing newline and hashed.
pub fn squashed_layer_path_id(
    old: &ImageConfig,
    created: &str,
    chain_ids: &[String],
    paths_to_move: &[String],
    paths_to_squash: &[String],
    squash_id: &str,
) -> Result<String> {
    let mut v1 = old.clone();
    v1.created = created.to_string();
    v1.history = None;
    v1.rootfs = Rootfs::default();
    v1.container = String::new();

    if let Some(chain_id) = chain_ids.last() {
        v1.layer_id = format!("sha256:{chain_id}");
    }

    if !paths_to_move.is_empty() {
        let parent = if !paths_to_squash.is_empty() {
            &paths_to_move[paths_to_move.len() - 1]
        } else {
            &paths_to_move[0]
        };
        v1.parent = format!("sha256:{parent}");
    }

    v1.config.image = squash_id.to_string();

    digest::sha256_json(&v1)
}

/// Write the squashed layer's v1 descriptor to `<squashed_dir>/json`.
///
/// The descriptor starts from the on-disk document at
/// `old_dir/<descriptor_path>` (the bottom squashed layer's `json` for
/// classic images, the image config for OCI ones).
pub fn write_squashed_layer_descriptor(
    old_dir: &Path,
    descriptor_path: &str,
    layer_path_id: &str,
    paths_to_move: &[String],
    created: &str,
    squash_id: &str,
    squashed_dir: &Path,
) -> Result<()> {
    let source = old_dir.join(descriptor_path);
    let data = std::fs::read(&source)
        .map_err(|e| SquashError::ConfigMissing(format!("{}: {e}", source.display())))?;
    let mut descriptor: ImageConfig = serde_json::from_slice(&data)
        .map_err(|e| SquashError::ConfigMissing(format!("{}: {e}", source.display())))?;

    descriptor.created = created.to_string();
    if !squash_id.is_empty() {
        descriptor.config.image = squash_id.to_string();
    }
    descriptor.parent = paths_to_move.last().cloned().unwrap_or_default();
    descriptor.id = layer_path_id.to_string();
    descriptor.container = String::new();

    let bytes = serde_json::to_vec(&descriptor)?;
    std::fs::write(squashed_dir.join("json"), bytes)?;
    Ok(())
}

/// Write the layer format version marker.
pub fn write_version_file(dir: &Path) -> Result<()> {
    std::fs::write(dir.join("VERSION"), "1.0")?;
    Ok(())
}

/// Build the new manifest: preserved layer entries plus the squashed
/// layer's `<id>/layer.tar`.
pub fn new_manifest(
    old_manifest: &ImageManifest,
    image_id: &str,
    move_count: usize,
    layer_path_id: Option<&str>,
    image_name: &str,
    image_tag: &str,
) -> ImageManifest {
    let mut layers = old_manifest.layers.clone();
    if layers.len() > move_count {
        layers.truncate(move_count);
    }
    if let Some(id) = layer_path_id {
        layers.push(format!("{id}/layer.tar"));
    }

    let repo_tags = if !image_name.is_empty() && !image_tag.is_empty() {
        Some(vec![format!("{image_name}:{image_tag}")])
    } else {
        None
    };

    ImageManifest {
        config: format!("{image_id}.json"),
        repo_tags,
        layers,
        layer_sources: None,
    }
}

/// Write `manifest.json` as a single-element array with a trailing
/// newline.
pub fn write_manifest(manifest: &ImageManifest, new_dir: &Path) -> Result<()> {
    let mut bytes = serde_json::to_vec(&[manifest])?;
    bytes.push(b'\n');
    std::fs::write(new_dir.join("manifest.json"), bytes)?;
    Ok(())
}

/// Relocate preserved layers from the old layout into the new one.
///
/// The source is the recorded manifest path; the destination is the
/// bare layer id with any `sha256:` or `blobs/sha256/` prefix stripped.
pub fn move_layers(old_dir: &Path, new_dir: &Path, paths_to_move: &[String]) -> Result<()> {
    for path in paths_to_move {
        let stripped = path.strip_prefix("sha256:").unwrap_or(path);
        let leaf = stripped.strip_prefix("blobs/sha256/").unwrap_or(stripped);
        tracing::debug!(layer = leaf, "Moving unmodified layer...");

        let src = old_dir.join(stripped);
        let dest = new_dir.join(leaf);
        std::fs::rename(&src, &dest).map_err(|e| {
            SquashError::Io(std::io::Error::new(
                e.kind(),
                format!("failed to move layer {stripped}: {e}"),
            ))
        })?;
    }
    Ok(())
}

/// Write the `repositories` file mapping `name` → `tag` → layer id.
pub fn write_repositories(
    new_dir: &Path,
    image_name: &str,
    image_tag: &str,
    repo_image_id: &str,
) -> Result<()> {
    if repo_image_id.is_empty() {
        return Err(SquashError::Config(
            "provided repository image id cannot be empty".to_string(),
        ));
    }

    let mut tags = serde_json::Map::new();
    tags.insert(
        image_tag.to_string(),
        serde_json::Value::String(repo_image_id.to_string()),
    );
    let mut repos = serde_json::Map::new();
    repos.insert(image_name.to_string(), serde_json::Value::Object(tags));

    let mut bytes = serde_json::to_vec(&serde_json::Value::Object(repos))?;
    bytes.push(b'\n');
    std::fs::write(new_dir.join("repositories"), bytes)?;
    Ok(())
}
