//! Layer merging with overlay semantics.
//!
//! Walks the squash set bottom-to-top and streams surviving entries
//! into a single layer tar. Each entry passes through a fixed decision
//! pipeline: opaque directories declared by lower layers hide whole
//! subtrees, whiteouts hide their target from the point they appear,
//! and a first-occurrence set deduplicates names, so the bottom-most
//! copy of a path wins.

use std::collections::HashSet;
use std::fs::File;
use std::path::Path;

use docker_squash_core::error::Result;
use tar::{Archive, Builder, EntryType};

use crate::archive;
use crate::plan::ImageLayout;

/// Marker hiding every lower-layer child of its parent directory.
const OPAQUE_MARKER: &str = ".wh..wh..opq";

/// Basename prefix marking the deletion of a sibling path.
const WHITEOUT_PREFIX: &str = ".wh.";

/// How a raw archive entry participates in the merge.
#[derive(Debug, PartialEq, Eq)]
enum EntryKind {
    /// `.wh..wh..opq`; the target is its parent directory
    Opaque { dir: String },
    /// `.wh.<name>`; the target is the sibling without the prefix
    Whiteout { target: String },
    /// Anything else, carried under its normalized name
    Regular { name: String },
}

/// Merge state shared across all layers of one run.
#[derive(Default)]
struct MergeState {
    /// Normalized whiteout targets seen so far
    to_skip: Vec<String>,
    /// Normalized names already written to the output
    squashed_files: HashSet<String>,
    /// Opaque directories declared by layers below the current one
    opaque_dirs: Vec<String>,
}

/// Merge the squash set into a single tar at `output_tar`.
///
/// `layer_paths` are manifest paths relative to `old_dir`, bottom
/// layer first. Any I/O failure aborts the merge; the caller discards
/// the scratch directory.
pub fn merge_layers(
    old_dir: &Path,
    layer_paths: &[String],
    layout: ImageLayout,
    output_tar: &Path,
) -> Result<()> {
    tracing::info!("Starting squashing...");

    let out = File::create(output_tar)?;
    let mut builder = Builder::new(out);
    let mut state = MergeState::default();

    for layer_path in layer_paths {
        let tar_path = old_dir.join(layout.layer_tar_path(layer_path));
        tracing::info!(layer = %tar_path.display(), "Squashing layer...");
        let file = File::open(&tar_path)?;
        let mut layer = Archive::new(file);

        // Opaque dirs declared here only take effect from the next
        // layer up; a layer never hides its own entries.
        let mut layer_opaques: Vec<String> = Vec::new();

        for entry in layer.entries()? {
            let mut entry = entry?;
            let raw_name = entry.path()?.to_string_lossy().into_owned();

            match classify(&raw_name) {
                EntryKind::Opaque { dir } => {
                    let hidden_below = has_prefix(&state.opaque_dirs, &dir);
                    layer_opaques.push(dir);
                    // A lower opaque already hides this subtree; a
                    // nested marker would be redundant.
                    if !hidden_below {
                        archive::copy_entry(&mut entry, &mut builder)?;
                    }
                }
                EntryKind::Whiteout { target } => {
                    tracing::debug!(target = %target, "Recording whiteout");
                    state.to_skip.push(target);
                }
                EntryKind::Regular { name } => {
                    if has_prefix(&state.opaque_dirs, &name) {
                        continue;
                    }
                    if has_prefix(&state.to_skip, &name) {
                        continue;
                    }
                    if state.squashed_files.contains(&name) {
                        continue;
                    }
                    // A hardlink whose target can no longer appear in
                    // the output would dangle; drop it.
                    if entry.header().entry_type() == EntryType::Link {
                        if let Some(target) = entry.link_name()? {
                            let target = normalize(&target.to_string_lossy());
                            let hidden = has_prefix(&state.opaque_dirs, &target)
                                || has_prefix(&state.to_skip, &target);
                            if hidden && !state.squashed_files.contains(&target) {
                                tracing::debug!(
                                    link = %name,
                                    target = %target,
                                    "Dropping hardlink to a whited-out target"
                                );
                                continue;
                            }
                        }
                    }
                    archive::copy_entry(&mut entry, &mut builder)?;
                    state.squashed_files.insert(name);
                }
            }
        }

        state.opaque_dirs.extend(layer_opaques);
    }

    builder.finish()?;
    tracing::info!("Squashing finished");
    Ok(())
}

/// Classify a raw entry name by its basename.
fn classify(raw_name: &str) -> EntryKind {
    let path = Path::new(raw_name);
    let base = path
        .file_name()
        .map(|b| b.to_string_lossy().into_owned())
        .unwrap_or_default();
    let dir = path
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default();

    if base == OPAQUE_MARKER {
        EntryKind::Opaque {
            dir: normalize(&dir),
        }
    } else if let Some(stripped) = base.strip_prefix(WHITEOUT_PREFIX) {
        EntryKind::Whiteout {
            target: normalize(&format!("{dir}/{stripped}")),
        }
    } else {
        EntryKind::Regular {
            name: normalize(raw_name),
        }
    }
}

/// Clean a path and re-root it at `/`.
fn normalize(name: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for comp in name.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            comp => parts.push(comp),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Whether any element of `prefixes` is a prefix of `name`.
fn has_prefix(prefixes: &[String], name: &str) -> bool {
    prefixes.iter().any(|p| name.starts_with(p.as_str()))
}
