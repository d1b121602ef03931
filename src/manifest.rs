//! Docker image manifest formats.
//!
//! Field names follow the wire format exactly; the structs double as the
//! schemas that published manifests are validated against.

use crate::media_type::{self, ManifestKind};
use serde::{Deserialize, Serialize};

pub const DEFAULT_ARCHITECTURE: &str = "amd64";
pub const DEFAULT_OS: &str = "linux";

/// Image Manifest Version 2, Schema 1 (signed).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestV1 {
    pub schema_version: u32,
    pub name: String,
    pub tag: String,
    pub architecture: String,
    pub fs_layers: Vec<FsLayer>,
    pub history: Vec<V1History>,
    #[serde(default)]
    pub signatures: Vec<Signature>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FsLayer {
    pub blob_sum: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct V1History {
    #[serde(rename = "v1Compatibility")]
    pub v1_compatibility: String,
}

impl V1History {
    /// The v1 image id embedded in the compatibility blob.
    pub fn image_id(&self) -> Option<String> {
        #[derive(Deserialize)]
        struct Compat {
            id: String,
        }

        serde_json::from_str::<Compat>(&self.v1_compatibility)
            .ok()
            .map(|c| c.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signature {
    pub header: SignatureHeader,
    pub protected: String,
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignatureHeader {
    pub jwk: Jwk,
    pub alg: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Jwk {
    pub crv: String,
    pub kid: String,
    pub kty: String,
    pub x: String,
    pub y: String,
}

impl ManifestV1 {
    /// v1 image ids, top layer first.
    pub fn image_ids(&self) -> Vec<String> {
        self.history.iter().filter_map(V1History::image_id).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub size: u64,
    pub digest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urls: Option<Vec<String>>,
}

/// Image Manifest Version 2, Schema 2.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestV2 {
    pub schema_version: u32,
    pub media_type: String,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub os: String,
    #[serde(rename = "os.version", default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(rename = "os.features", default, skip_serializing_if = "Option::is_none")]
    pub os_features: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<Vec<String>>,
}

impl Platform {
    pub fn new(architecture: impl Into<String>, os: impl Into<String>) -> Self {
        Self {
            architecture: architecture.into(),
            os: os.into(),
            ..Default::default()
        }
    }

    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        self.variant = Some(variant.into());
        self
    }

    /// The platform served to clients that cannot read manifest lists.
    pub fn is_default(&self) -> bool {
        self.architecture == DEFAULT_ARCHITECTURE && self.os == DEFAULT_OS
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestListEntry {
    pub media_type: String,
    pub size: u64,
    pub digest: String,
    pub platform: Platform,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestList {
    pub schema_version: u32,
    pub media_type: String,
    pub manifests: Vec<ManifestListEntry>,
}

impl ManifestList {
    /// The `amd64`/`linux` entry, if the list has one. The first match wins.
    pub fn default_platform_entry(&self) -> Option<&ManifestListEntry> {
        self.manifests.iter().find(|m| m.platform.is_default())
    }
}

/// Any manifest a Docker registry can store.
#[derive(Debug, Clone, PartialEq)]
pub enum Manifest {
    V1(ManifestV1),
    V2(ManifestV2),
    List(ManifestList),
}

impl Manifest {
    /// Parses manifest bytes, trusting `content_type` when it names a
    /// manifest media type and sniffing the body otherwise.
    pub fn parse(data: &[u8], content_type: Option<&str>) -> serde_json::Result<Self> {
        let kind = match content_type.and_then(ManifestKind::from_media_type) {
            Some(kind) => kind,
            None => sniff(data)?,
        };

        Ok(match kind {
            ManifestKind::V1 => Manifest::V1(serde_json::from_slice(data)?),
            ManifestKind::V2 => Manifest::V2(serde_json::from_slice(data)?),
            ManifestKind::List => Manifest::List(serde_json::from_slice(data)?),
        })
    }

    pub fn kind(&self) -> ManifestKind {
        match self {
            Manifest::V1(_) => ManifestKind::V1,
            Manifest::V2(_) => ManifestKind::V2,
            Manifest::List(_) => ManifestKind::List,
        }
    }

    /// Blob digests the manifest points at, without duplicates.
    pub fn referenced_blobs(&self) -> Vec<String> {
        let mut digests: Vec<String> = match self {
            Manifest::V1(m) => m.fs_layers.iter().map(|l| l.blob_sum.clone()).collect(),
            Manifest::V2(m) => std::iter::once(&m.config)
                .chain(m.layers.iter())
                .filter(|d| d.urls.is_none())
                .map(|d| d.digest.clone())
                .collect(),
            Manifest::List(_) => Vec::new(),
        };
        let mut seen = std::collections::HashSet::new();
        digests.retain(|d| seen.insert(d.clone()));
        digests
    }

    /// Manifest digests a list points at.
    pub fn referenced_manifests(&self) -> Vec<String> {
        match self {
            Manifest::List(list) => list.manifests.iter().map(|m| m.digest.clone()).collect(),
            _ => Vec::new(),
        }
    }
}

fn sniff(data: &[u8]) -> serde_json::Result<ManifestKind> {
    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Shape {
        schema_version: u32,
        #[serde(default)]
        media_type: Option<String>,
        #[serde(default)]
        manifests: Option<serde_json::Value>,
    }

    let shape: Shape = serde_json::from_slice(data)?;
    if shape.schema_version == 1 {
        return Ok(ManifestKind::V1);
    }
    let listed = shape.media_type.as_deref() == Some(media_type::MANIFEST_LIST_V2);
    if listed || shape.manifests.is_some() {
        Ok(ManifestKind::List)
    } else {
        Ok(ManifestKind::V2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn list_of(platforms: &[(&str, &str)]) -> ManifestList {
        ManifestList {
            schema_version: 2,
            media_type: media_type::MANIFEST_LIST_V2.to_string(),
            manifests: platforms
                .iter()
                .enumerate()
                .map(|(i, (arch, os))| ManifestListEntry {
                    media_type: media_type::MANIFEST_V2.to_string(),
                    size: 100,
                    digest: format!("sha256:{:064x}", i),
                    platform: Platform::new(*arch, *os),
                })
                .collect(),
        }
    }

    #[test]
    fn default_platform_entry_is_amd64_linux() {
        let list = list_of(&[("arm", "linux"), ("amd64", "windows"), ("amd64", "linux")]);
        let entry = list.default_platform_entry().unwrap();
        assert_eq!(entry.digest, format!("sha256:{:064x}", 2));
    }

    #[test]
    fn no_default_platform_entry() {
        let list = list_of(&[("arm", "linux"), ("arm64", "linux"), ("amd64", "windows")]);
        assert!(list.default_platform_entry().is_none());
    }

    #[test]
    fn platform_keys_use_dotted_names() {
        let mut platform = Platform::new("amd64", "windows");
        platform.os_version = Some("10.0.14393.1066".to_string());
        platform.os_features = Some(vec!["win32k".to_string()]);
        let value = serde_json::to_value(&platform).unwrap();
        assert_eq!(value["os.version"], "10.0.14393.1066");
        assert_eq!(value["os.features"], json!(["win32k"]));
        assert!(value.get("variant").is_none());
    }

    #[test]
    fn parse_sniffs_kind_without_content_type() {
        let list = serde_json::to_vec(&list_of(&[("arm", "linux")])).unwrap();
        assert_eq!(Manifest::parse(&list, None).unwrap().kind(), ManifestKind::List);

        let v2 = json!({
            "schemaVersion": 2,
            "mediaType": media_type::MANIFEST_V2,
            "config": {"mediaType": media_type::IMAGE_CONFIG, "size": 2, "digest": "sha256:aa"},
            "layers": [],
        });
        let v2 = serde_json::to_vec(&v2).unwrap();
        assert_eq!(Manifest::parse(&v2, Some("text/plain")).unwrap().kind(), ManifestKind::V2);
    }

    #[test]
    fn referenced_blobs_skip_foreign_layers_and_duplicates() {
        let manifest = Manifest::V2(ManifestV2 {
            schema_version: 2,
            media_type: media_type::MANIFEST_V2.to_string(),
            config: Descriptor {
                media_type: media_type::IMAGE_CONFIG.to_string(),
                size: 2,
                digest: "sha256:c".to_string(),
                urls: None,
            },
            layers: vec![
                Descriptor {
                    media_type: media_type::IMAGE_LAYER.to_string(),
                    size: 1,
                    digest: "sha256:l".to_string(),
                    urls: None,
                },
                Descriptor {
                    media_type: media_type::IMAGE_LAYER.to_string(),
                    size: 1,
                    digest: "sha256:l".to_string(),
                    urls: None,
                },
                Descriptor {
                    media_type: "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip"
                        .to_string(),
                    size: 1,
                    digest: "sha256:f".to_string(),
                    urls: Some(vec!["https://example.com/f".to_string()]),
                },
            ],
        });
        assert_eq!(manifest.referenced_blobs(), vec!["sha256:c", "sha256:l"]);
    }

    #[test]
    fn history_image_ids() {
        let manifest = ManifestV1 {
            schema_version: 1,
            name: "library/busybox".to_string(),
            tag: "latest".to_string(),
            architecture: "amd64".to_string(),
            fs_layers: vec![],
            history: vec![
                V1History {
                    v1_compatibility: r#"{"id":"top","parent":"base"}"#.to_string(),
                },
                V1History {
                    v1_compatibility: "not json".to_string(),
                },
                V1History {
                    v1_compatibility: r#"{"id":"base"}"#.to_string(),
                },
            ],
            signatures: vec![],
        };
        assert_eq!(manifest.image_ids(), vec!["top", "base"]);
    }
}
