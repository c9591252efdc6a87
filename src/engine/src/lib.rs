//! Layer-squashing engine for docker-save image archives.
//!
//! Collapses a contiguous tail of an image's layer stack into a single
//! layer, producing a fresh image whose filesystem content matches the
//! source and whose metadata (manifest, config, history, diff-ids,
//! chain-ids) is consistent with container-runtime expectations.

pub mod archive;
pub mod assemble;
pub mod digest;
pub mod merge;
pub mod metadata;
pub mod package;
pub mod plan;
pub mod reference;
pub mod squash;
pub mod store;
pub mod unpack;

pub use squash::{SquashOptions, Squasher};
pub use store::{ImageStore, LocalStore};
