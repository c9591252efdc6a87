//! Packages the squashed image for loading or export.

use std::fs::File;
use std::path::Path;

use docker_squash_core::error::Result;

use crate::archive;
use crate::store::ImageStore;

/// Write the new image directory as a tar archive at `output_path`.
pub fn export_archive(new_dir: &Path, output_path: &Path) -> Result<()> {
    let file = File::create(output_path)?;
    archive::archive_dir(new_dir, file)?;
    tracing::info!(path = %output_path.display(), "Image available");
    Ok(())
}

/// Tar up the new image directory and stream it into the store.
///
/// The intermediate archive is staged under the scratch root and
/// removed once the load completes.
pub fn load_image(
    store: &dyn ImageStore,
    new_dir: &Path,
    scratch_dir: &Path,
    image_name: &str,
    image_tag: &str,
) -> Result<()> {
    let tar_path = scratch_dir.join("image.tar");
    {
        let file = File::create(&tar_path)?;
        archive::archive_dir(new_dir, file)?;
    }

    tracing::info!(image = %format!("{image_name}:{image_tag}"), "Loading squashed image...");
    let mut file = File::open(&tar_path)?;
    let result = store.load(&mut file);
    let _ = std::fs::remove_file(&tar_path);
    result?;

    tracing::info!("Image loaded!");
    Ok(())
}
