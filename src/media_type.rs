//! Docker manifest media types and `Accept` negotiation.

use serde::{Deserialize, Serialize};

pub const MANIFEST_V1: &str = "application/vnd.docker.distribution.manifest.v1+json";
pub const MANIFEST_V1_SIGNED: &str = "application/vnd.docker.distribution.manifest.v1+prettyjws";
pub const MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const MANIFEST_LIST_V2: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
pub const IMAGE_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
pub const IMAGE_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

/// The three manifest formats a registry can hand out for a tag.
///
/// Ordered by capability: a client that accepts a manifest list is assumed
/// to understand schema 2, and every client understands schema 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManifestKind {
    V1,
    V2,
    List,
}

impl ManifestKind {
    /// The media type a manifest of this kind is served with.
    pub fn media_type(self) -> &'static str {
        match self {
            ManifestKind::V1 => MANIFEST_V1_SIGNED,
            ManifestKind::V2 => MANIFEST_V2,
            ManifestKind::List => MANIFEST_LIST_V2,
        }
    }

    pub fn from_media_type(media_type: &str) -> Option<Self> {
        match essence(media_type) {
            MANIFEST_V1 | MANIFEST_V1_SIGNED => Some(ManifestKind::V1),
            MANIFEST_V2 => Some(ManifestKind::V2),
            MANIFEST_LIST_V2 => Some(ManifestKind::List),
            _ => None,
        }
    }

    /// Picks the most capable kind named in an `Accept` header.
    ///
    /// A missing header, `*/*`, `application/json` or anything unrecognised
    /// is a legacy client and gets schema 1.
    pub fn from_accept(accept: Option<&str>) -> Self {
        accept
            .into_iter()
            .flat_map(|value| value.split(','))
            .filter_map(ManifestKind::from_media_type)
            .max()
            .unwrap_or(ManifestKind::V1)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ManifestKind::V1 => "v1",
            ManifestKind::V2 => "v2",
            ManifestKind::List => "list",
        }
    }
}

impl std::fmt::Display for ManifestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Strips parameters (`; q=0.5`) and surrounding whitespace.
fn essence(media_type: &str) -> &str {
    media_type.split(';').next().unwrap_or_default().trim()
}
