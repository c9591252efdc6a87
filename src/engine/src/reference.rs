//! Image name parsing.
//!
//! Splits a `name[:tag]` reference into its name and tag parts.

/// Parsed image name and tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageName {
    pub name: String,
    pub tag: String,
}

/// Default tag when none is specified.
const DEFAULT_TAG: &str = "latest";

/// Split `name[:tag]` into name and tag.
///
/// A colon followed by a slash belongs to a registry host
/// (`registry:5000/x`), not a tag separator. A missing tag defaults to
/// `latest`.
pub fn parse_image_name(reference: &str) -> ImageName {
    match reference.rfind(':') {
        Some(idx) if !reference[idx..].contains('/') => ImageName {
            name: reference[..idx].to_string(),
            tag: reference[idx + 1..].to_string(),
        },
        _ => ImageName {
            name: reference.to_string(),
            tag: DEFAULT_TAG.to_string(),
        },
    }
}
