//! Selects the manifest a client gets for a tag.
//!
//! Clients that understand manifest lists get the list. Clients that ask for
//! a single manifest while the tag holds a list get the `amd64`/`linux`
//! entry, or nothing at all: no other platform is served implicitly.

use crate::manifest::ManifestList;
use crate::media_type::ManifestKind;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Digests of the manifests stored for one tag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema1: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema2: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list: Option<String>,
}

impl TagContent {
    pub fn is_empty(&self) -> bool {
        self.schema1.is_none() && self.schema2.is_none() && self.list.is_none()
    }

    pub fn has_v2(&self) -> bool {
        self.schema2.is_some() || self.list.is_some()
    }

    pub fn digests(&self) -> impl Iterator<Item = &String> {
        self.schema1
            .iter()
            .chain(self.schema2.iter())
            .chain(self.list.iter())
    }
}

/// The manifest chosen for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selected {
    pub digest: String,
    pub kind: ManifestKind,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Unresolved {
    #[error("manifest list has no amd64/linux entry")]
    NoDefaultPlatform,

    #[error("no {0} manifest stored for tag")]
    Missing(ManifestKind),
}

/// Resolves `requested` against a tag.
///
/// `list` must be the parsed body of `tag.list`; it is ignored when the tag
/// has no list.
pub fn resolve(
    tag: &TagContent,
    list: Option<&ManifestList>,
    requested: ManifestKind,
) -> Result<Selected, Unresolved> {
    let listed = tag.list.as_deref().zip(list);

    match requested {
        ManifestKind::List => {
            if let Some((digest, _)) = listed {
                return Ok(selected(digest, ManifestKind::List));
            }
            tag.schema2
                .as_deref()
                .map(|digest| selected(digest, ManifestKind::V2))
                .ok_or(Unresolved::Missing(ManifestKind::List))
        }
        ManifestKind::V2 => match listed {
            Some((_, list)) => {
                let entry = list
                    .default_platform_entry()
                    .ok_or(Unresolved::NoDefaultPlatform)?;
                let kind =
                    ManifestKind::from_media_type(&entry.media_type).unwrap_or(ManifestKind::V2);
                Ok(selected(&entry.digest, kind))
            }
            None => tag
                .schema2
                .as_deref()
                .map(|digest| selected(digest, ManifestKind::V2))
                .or_else(|| {
                    tag.schema1
                        .as_deref()
                        .map(|digest| selected(digest, ManifestKind::V1))
                })
                .ok_or(Unresolved::Missing(ManifestKind::V2)),
        },
        ManifestKind::V1 => {
            if let Some((_, list)) = listed {
                list.default_platform_entry()
                    .ok_or(Unresolved::NoDefaultPlatform)?;
            }
            tag.schema1
                .as_deref()
                .map(|digest| selected(digest, ManifestKind::V1))
                .ok_or(Unresolved::Missing(ManifestKind::V1))
        }
    }
}

fn selected(digest: &str, kind: ManifestKind) -> Selected {
    Selected {
        digest: digest.to_string(),
        kind,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{ManifestListEntry, Platform};
    use crate::media_type::{MANIFEST_LIST_V2, MANIFEST_V2};
    use rstest::rstest;

    const LIST: &str = "sha256:11";
    const SCHEMA1: &str = "sha256:22";
    const SCHEMA2: &str = "sha256:33";

    fn list_of(platforms: &[(&str, &str)]) -> ManifestList {
        ManifestList {
            schema_version: 2,
            media_type: MANIFEST_LIST_V2.to_string(),
            manifests: platforms
                .iter()
                .map(|(arch, os)| ManifestListEntry {
                    media_type: MANIFEST_V2.to_string(),
                    size: 10,
                    digest: format!("sha256:{arch}-{os}"),
                    platform: Platform::new(*arch, *os),
                })
                .collect(),
        }
    }

    fn listed_tag(schema1: bool) -> TagContent {
        TagContent {
            schema1: schema1.then(|| SCHEMA1.to_string()),
            schema2: None,
            list: Some(LIST.to_string()),
        }
    }

    #[test]
    fn list_request_gets_list() {
        let list = list_of(&[("arm", "linux")]);
        let got = resolve(&listed_tag(false), Some(&list), ManifestKind::List).unwrap();
        assert_eq!(got, selected(LIST, ManifestKind::List));
    }

    #[test]
    fn v2_request_gets_default_platform_entry() {
        let list = list_of(&[("arm", "linux"), ("amd64", "linux"), ("arm64", "linux")]);
        let got = resolve(&listed_tag(true), Some(&list), ManifestKind::V2).unwrap();
        assert_eq!(got, selected("sha256:amd64-linux", ManifestKind::V2));
    }

    #[rstest]
    #[case(ManifestKind::V1)]
    #[case(ManifestKind::V2)]
    fn legacy_request_without_default_platform_is_unresolved(#[case] requested: ManifestKind) {
        let list = list_of(&[("arm", "linux"), ("amd64", "windows"), ("arm64", "linux")]);
        let got = resolve(&listed_tag(true), Some(&list), requested);
        assert_eq!(got, Err(Unresolved::NoDefaultPlatform));
    }

    #[test]
    fn v1_request_with_default_platform_gets_schema1() {
        let list = list_of(&[("amd64", "linux")]);
        let got = resolve(&listed_tag(true), Some(&list), ManifestKind::V1).unwrap();
        assert_eq!(got, selected(SCHEMA1, ManifestKind::V1));
    }

    #[test]
    fn v1_request_is_never_converted_from_v2() {
        let list = list_of(&[("amd64", "linux")]);
        let got = resolve(&listed_tag(false), Some(&list), ManifestKind::V1);
        assert_eq!(got, Err(Unresolved::Missing(ManifestKind::V1)));
    }

    #[test]
    fn list_request_without_list_falls_back_to_v2() {
        let tag = TagContent {
            schema1: Some(SCHEMA1.to_string()),
            schema2: Some(SCHEMA2.to_string()),
            list: None,
        };
        let got = resolve(&tag, None, ManifestKind::List).unwrap();
        assert_eq!(got, selected(SCHEMA2, ManifestKind::V2));
    }

    #[test]
    fn plain_tags() {
        let tag = TagContent {
            schema1: Some(SCHEMA1.to_string()),
            schema2: Some(SCHEMA2.to_string()),
            list: None,
        };
        assert_eq!(
            resolve(&tag, None, ManifestKind::V2).unwrap(),
            selected(SCHEMA2, ManifestKind::V2)
        );
        assert_eq!(
            resolve(&tag, None, ManifestKind::V1).unwrap(),
            selected(SCHEMA1, ManifestKind::V1)
        );

        let schema1_only = TagContent {
            schema1: Some(SCHEMA1.to_string()),
            ..Default::default()
        };
        assert_eq!(
            resolve(&schema1_only, None, ManifestKind::V2).unwrap(),
            selected(SCHEMA1, ManifestKind::V1)
        );
        assert_eq!(
            resolve(&schema1_only, None, ManifestKind::List),
            Err(Unresolved::Missing(ManifestKind::List))
        );
    }

    #[test]
    fn empty_tag() {
        let tag = TagContent::default();
        assert!(tag.is_empty());
        assert_eq!(
            resolve(&tag, None, ManifestKind::V1),
            Err(Unresolved::Missing(ManifestKind::V1))
        );
    }
}
