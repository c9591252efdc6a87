//! The squashing engine.
//!
//! Owns one run end to end: plan the split, fetch and unpack the source
//! image, merge the squash set, assemble the new image, and hand it to
//! the requested sinks. The scratch directory belongs exclusively to
//! one run and is released on every exit path.

use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use docker_squash_core::error::{Result, SquashError};

use crate::plan::{self, ImageLayout, SquashPlan};
use crate::reference;
use crate::store::ImageStore;
use crate::{assemble, digest, merge, package, unpack};

/// Engine options, one set per invocation.
#[derive(Debug, Clone, Default)]
pub struct SquashOptions {
    /// Source image reference (required)
    pub image: String,
    /// Number of layers to squash, or a layer reference to squash from;
    /// defaults to the whole stack
    pub from_layer: Option<String>,
    /// `name[:tag]` for the new image
    pub tag: Option<String>,
    /// Comment for the new history entry
    pub message: String,
    /// Pre-selected scratch directory; must not already exist
    pub tmp_dir: Option<PathBuf>,
    /// Archive destination path
    pub output_path: Option<PathBuf>,
    /// Load the squashed image back into the store
    pub load_image: bool,
    /// Remove the scratch directory on the return path
    pub cleanup: bool,
}

/// Scratch directory layout of one run.
struct Scratch {
    root: PathBuf,
    old_dir: PathBuf,
    new_dir: PathBuf,
    squashed_dir: PathBuf,
}

/// One squash run against an image store.
pub struct Squasher<'a> {
    store: &'a dyn ImageStore,
    options: SquashOptions,
}

impl<'a> Squasher<'a> {
    pub fn new(store: &'a dyn ImageStore, options: SquashOptions) -> Self {
        Self { store, options }
    }

    /// Execute the squash; returns the new image id.
    pub fn run(&self) -> Result<String> {
        if self.options.image.is_empty() {
            return Err(SquashError::Config("image is not provided".to_string()));
        }
        if self.options.output_path.is_none() && !self.options.load_image {
            return Err(SquashError::NoSink);
        }
        if let Some(path) = &self.options.output_path {
            if path.exists() {
                tracing::info!(
                    path = %path.display(),
                    "Output path already exists, it will be overridden"
                );
            }
        }

        let scratch = self.prepare_scratch()?;
        let result = self.squash(&scratch);

        let cleanup =
            self.options.cleanup && self.options.tag.as_deref() != Some(self.options.image.as_str());
        if cleanup {
            tracing::info!(dir = %scratch.root.display(), "Cleaning up temporary directory");
            if let Err(e) = std::fs::remove_dir_all(&scratch.root) {
                tracing::error!(error = %e, "Cleaning up the temporary directory failed");
            }
        } else if result.is_err() {
            tracing::info!(
                dir = %scratch.root.display(),
                "Keeping temporary directory for diagnosis"
            );
        }

        result
    }

    /// Create the scratch layout: `old/`, `new/` and `new/squashed/`.
    fn prepare_scratch(&self) -> Result<Scratch> {
        let root = match &self.options.tmp_dir {
            Some(dir) => {
                if dir.exists() {
                    return Err(SquashError::Config(format!(
                        "the '{}' directory already exists, please remove it before you proceed",
                        dir.display()
                    )));
                }
                std::fs::create_dir_all(dir)?;
                dir.clone()
            }
            None => tempfile::Builder::new()
                .prefix("docker-squash-")
                .tempdir()?
                .keep(),
        };
        tracing::info!(dir = %root.display(), "Using temporary directory");

        let old_dir = root.join("old");
        let new_dir = root.join("new");
        let squashed_dir = new_dir.join("squashed");
        std::fs::create_dir_all(&old_dir)?;
        std::fs::create_dir_all(&new_dir)?;

        Ok(Scratch {
            root,
            old_dir,
            new_dir,
            squashed_dir,
        })
    }

    fn squash(&self, scratch: &Scratch) -> Result<String> {
        let options = &self.options;

        let (image_name, image_tag) = match &options.tag {
            Some(tag) => {
                let parsed = reference::parse_image_name(tag);
                (parsed.name, parsed.tag)
            }
            None => (String::new(), String::new()),
        };

        let old_image_id = self
            .store
            .inspect(&options.image)
            .map_err(|e| {
                tracing::error!(image = %options.image, "Could not resolve the image to squash");
                e
            })?
            .id;
        tracing::info!(image = %options.image, id = %old_image_id, "Squashing image...");

        let history = self.store.history(&old_image_id)?;
        let mut all_layers: Vec<String> = history.iter().map(|item| item.id.clone()).collect();
        all_layers.reverse();
        tracing::info!(layers = all_layers.len(), "Read old image layers");
        tracing::debug!(layers = ?all_layers, "Old layers");

        let from_layer = options
            .from_layer
            .clone()
            .unwrap_or_else(|| all_layers.len().to_string());
        let squash_count = plan::resolve_squash_count(self.store, &all_layers, &from_layer)?;
        let squash_count = plan::validate_squash_count(squash_count, all_layers.len())?;

        tracing::info!("Checking if squashing is necessary...");
        let (layers_to_move, layers_to_squash) = plan::partition_layers(&all_layers, squash_count)?;
        tracing::info!(count = squash_count, "Attempting to squash the last layers...");

        unpack::fetch_image(self.store, &old_image_id, &scratch.old_dir)?;
        let size_before = dir_size(&scratch.old_dir)?;

        let unpacked = unpack::read_metadata(&scratch.old_dir)?;
        let (layer_paths_to_move, layer_paths_to_squash) = plan::layer_paths(
            &unpacked.config,
            &unpacked.manifest,
            layers_to_move.len(),
            unpacked.layout,
        )?;
        let plan = SquashPlan {
            layers_to_move,
            layers_to_squash,
            layer_paths_to_move,
            layer_paths_to_squash,
        };
        tracing::debug!(
            to_move = ?plan.layer_paths_to_move,
            to_squash = ?plan.layer_paths_to_squash,
            "Layer paths"
        );

        let squash_id = plan.layer_paths_to_move.last().cloned().unwrap_or_default();
        let created = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let created_by = unpacked
            .config
            .history
            .iter()
            .flatten()
            .rev()
            .find(|entry| !entry.created_by.is_empty())
            .map(|entry| entry.created_by.clone())
            .unwrap_or_default();

        let squashed_tar = scratch.squashed_dir.join("layer.tar");
        let have_squash_layers = !plan.layer_paths_to_squash.is_empty();
        if have_squash_layers {
            std::fs::create_dir_all(&scratch.squashed_dir)?;
            merge::merge_layers(
                &scratch.old_dir,
                &plan.layer_paths_to_squash,
                unpacked.layout,
                &squashed_tar,
            )?;
        }

        let diff_ids = assemble::generate_diff_ids(
            &scratch.old_dir,
            unpacked.layout,
            &plan.layer_paths_to_move,
            have_squash_layers.then_some(squashed_tar.as_path()),
        )?;
        let chain_ids = digest::chain_ids(&diff_ids);

        let squashed_diff_id = if have_squash_layers {
            diff_ids.last().map(String::as_str)
        } else {
            None
        };
        let new_config = assemble::new_image_config(
            &unpacked.config,
            plan.layers_to_move.len(),
            plan.layer_paths_to_move.len(),
            squashed_diff_id,
            &created,
            &created_by,
            &options.message,
            &squash_id,
        );
        let image_id = assemble::write_image_config(&new_config, &scratch.new_dir)?;

        let mut layer_path_id: Option<String> = None;
        if have_squash_layers {
            let id = assemble::squashed_layer_path_id(
                &unpacked.config,
                &created,
                &chain_ids,
                &plan.layer_paths_to_move,
                &plan.layer_paths_to_squash,
                &squash_id,
            )?;

            let descriptor_path = match unpacked.layout {
                ImageLayout::Oci => unpacked.manifest.config.clone(),
                ImageLayout::Classic => format!("{}/json", plan.layer_paths_to_squash[0]),
            };
            assemble::write_squashed_layer_descriptor(
                &scratch.old_dir,
                &descriptor_path,
                &id,
                &plan.layer_paths_to_move,
                &created,
                &squash_id,
                &scratch.squashed_dir,
            )?;
            assemble::write_version_file(&scratch.squashed_dir)?;

            std::fs::rename(&scratch.squashed_dir, scratch.new_dir.join(&id))?;
            layer_path_id = Some(id);
        }

        let manifest = assemble::new_manifest(
            &unpacked.manifest,
            &image_id,
            plan.layer_paths_to_move.len(),
            layer_path_id.as_deref(),
            &image_name,
            &image_tag,
        );
        assemble::write_manifest(&manifest, &scratch.new_dir)?;

        let repo_image_id = manifest
            .layers
            .last()
            .and_then(|layer| layer.split('/').next())
            .unwrap_or_default()
            .to_string();

        assemble::move_layers(&scratch.old_dir, &scratch.new_dir, &plan.layer_paths_to_move)?;

        if !image_name.is_empty() && !image_tag.is_empty() {
            assemble::write_repositories(&scratch.new_dir, &image_name, &image_tag, &repo_image_id)?;
        }

        self.after_squash(scratch, size_before)?;

        if let Some(path) = &options.output_path {
            package::export_archive(&scratch.new_dir, path)?;
        }
        if options.load_image {
            package::load_image(
                self.store,
                &scratch.new_dir,
                &scratch.root,
                &image_name,
                &image_tag,
            )?;
        }

        tracing::info!(image = %image_id, "Squashing complete");
        Ok(image_id)
    }

    /// Drop the old image directory and report the size change.
    fn after_squash(&self, scratch: &Scratch, size_before: u64) -> Result<()> {
        tracing::info!("Removing from disk already squashed layers...");
        tracing::info!(dir = %scratch.old_dir.display(), "Cleaning up old image directory...");
        if let Err(e) = std::fs::remove_dir_all(&scratch.old_dir) {
            tracing::error!(error = %e, "Cleaning up the old image directory failed");
        }

        let size_after = dir_size(&scratch.new_dir)?;
        let before_mb = size_before as f64 / 1024.0 / 1024.0;
        let after_mb = size_after as f64 / 1024.0 / 1024.0;
        tracing::info!(before_mb, after_mb, "Original and squashed image size");
        if after_mb > before_mb {
            tracing::info!(
                "If the squashed image is larger than the original, there were no meaningful \
                 files to squash and only metadata was added. Are you sure you specified \
                 the correct parameters?"
            );
        } else if before_mb > 0.0 {
            let percent = (before_mb - after_mb) / before_mb * 100.0;
            tracing::info!(percent, "Image size decreased");
        }
        Ok(())
    }
}

/// Total size of all regular files under a directory.
fn dir_size(dir: &Path) -> Result<u64> {
    let mut size = 0u64;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if metadata.is_dir() {
            size += dir_size(&entry.path())?;
        } else if metadata.is_file() {
            size += metadata.len();
        }
    }
    Ok(size)
}
