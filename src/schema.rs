//! Shape checks for manifest bodies returned by a registry.
//!
//! A body is valid when it deserializes into the matching typed manifest and
//! declares the expected schema version.

use crate::manifest::{ManifestList, ManifestV1, ManifestV2};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("{title}: {source}")]
    Shape {
        title: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("{title}: expected schemaVersion {expected}, found {found}")]
    SchemaVersion {
        title: &'static str,
        expected: u32,
        found: u32,
    },
}

const MANIFEST_V1_TITLE: &str = "Image Manifest Version 2, Schema 1";
const MANIFEST_V2_TITLE: &str = "Image Manifest Version 2, Schema 2";
const MANIFEST_LIST_TITLE: &str = "Image Manifest List";

fn shaped<T: DeserializeOwned>(title: &'static str, body: &Value) -> Result<T, SchemaError> {
    T::deserialize(body).map_err(|source| SchemaError::Shape { title, source })
}

fn check_version(title: &'static str, expected: u32, found: u32) -> Result<(), SchemaError> {
    if expected == found {
        Ok(())
    } else {
        Err(SchemaError::SchemaVersion {
            title,
            expected,
            found,
        })
    }
}

pub fn validate_manifest_v1(body: &Value) -> Result<ManifestV1, SchemaError> {
    let manifest: ManifestV1 = shaped(MANIFEST_V1_TITLE, body)?;
    check_version(MANIFEST_V1_TITLE, 1, manifest.schema_version)?;
    Ok(manifest)
}

pub fn validate_manifest_v2(body: &Value) -> Result<ManifestV2, SchemaError> {
    let manifest: ManifestV2 = shaped(MANIFEST_V2_TITLE, body)?;
    check_version(MANIFEST_V2_TITLE, 2, manifest.schema_version)?;
    Ok(manifest)
}

pub fn validate_manifest_list(body: &Value) -> Result<ManifestList, SchemaError> {
    let list: ManifestList = shaped(MANIFEST_LIST_TITLE, body)?;
    check_version(MANIFEST_LIST_TITLE, 2, list.schema_version)?;
    Ok(list)
}
