//! Streaming tar archive support.
//!
//! Thin layer over the `tar` crate: unpacking daemon image archives,
//! re-archiving output directories, and copying single entries between
//! archives without buffering payloads.

use std::io::{Read, Write};
use std::path::Path;

use docker_squash_core::error::{Result, SquashError};
use tar::{Archive, Builder, Entry, EntryType};

/// Unpack an image tar stream into a directory.
///
/// Entry kinds a filesystem can hold (regular files, hardlinks,
/// symlinks, directories, devices, FIFOs) are extracted with
/// permissions, mtimes and xattrs preserved; anything else is logged
/// and skipped.
pub fn unpack_archive<R: Read>(reader: R, dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)?;

    let mut archive = Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_unpack_xattrs(true);

    for entry in archive.entries()? {
        let mut entry = entry?;
        match entry.header().entry_type() {
            EntryType::Regular
            | EntryType::Directory
            | EntryType::Symlink
            | EntryType::Link
            | EntryType::Char
            | EntryType::Block
            | EntryType::Fifo => {
                entry.unpack_in(dir)?;
            }
            other => {
                tracing::warn!(
                    kind = ?other,
                    path = %entry.path()?.display(),
                    "Ignoring unknown entry type"
                );
            }
        }
    }

    Ok(())
}

/// Archive a directory's contents, entries named relative to it.
pub fn archive_dir<W: Write>(dir: &Path, writer: W) -> Result<()> {
    let mut builder = Builder::new(writer);
    builder.append_dir_all(".", dir)?;
    builder.finish()?;
    Ok(())
}

/// Copy one entry (header plus payload) into an output archive.
///
/// The header travels verbatim, so mode, ownership, timestamps and
/// device numbers survive; long names and link targets are re-encoded
/// by the builder, and xattr PAX records are re-attached.
pub fn copy_entry<R: Read, W: Write>(
    entry: &mut Entry<'_, R>,
    builder: &mut Builder<W>,
) -> Result<()> {
    let mut header = entry.header().clone();
    let path = entry.path()?.into_owned();

    if let Some(extensions) = entry.pax_extensions()? {
        let xattrs: Vec<(String, Vec<u8>)> = extensions
            .filter_map(|ext| ext.ok())
            .filter(|ext| {
                ext.key()
                    .map(|k| k.starts_with("SCHILY.xattr."))
                    .unwrap_or(false)
            })
            .filter_map(|ext| {
                ext.key()
                    .ok()
                    .map(|k| (k.to_string(), ext.value_bytes().to_vec()))
            })
            .collect();
        if !xattrs.is_empty() {
            builder.append_pax_extensions(
                xattrs.iter().map(|(k, v)| (k.as_str(), v.as_slice())),
            )?;
        }
    }

    match header.entry_type() {
        EntryType::Link | EntryType::Symlink => {
            let target = entry.link_name()?.ok_or_else(|| {
                SquashError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("link entry {} has no target", path.display()),
                ))
            })?;
            builder.append_link(&mut header, &path, &target)?;
        }
        _ => {
            builder.append_data(&mut header, &path, entry)?;
        }
    }

    Ok(())
}
