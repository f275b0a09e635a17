//! Image configuration stored next to the squashfs file (`<image>.meta`).

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::utils;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMetadata {
    #[serde(rename = "Cmd", default, deserialize_with = "nullable")]
    pub cmd: Option<Vec<String>>,
    #[serde(rename = "Entrypoint", default, deserialize_with = "nullable")]
    pub entry: Option<Vec<String>>,
    #[serde(rename = "WorkingDir", default, deserialize_with = "non_empty")]
    pub workdir: Option<String>,
    #[serde(rename = "Env", default)]
    pub env: Vec<String>,
    #[serde(rename = "Labels", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

fn nullable<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Option::<Vec<String>>::deserialize(deserializer)
}

fn non_empty<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let workdir = Option::<String>::deserialize(deserializer)?;
    Ok(workdir.filter(|w| !w.is_empty()))
}

impl ImageMetadata {
    pub fn load(path: &Path) -> Result<Self> {
        log::info!("creating image metadata from file {:?}", path);
        let reader = utils::open(path)?;
        serde_json::from_reader(reader)
            .with_context(|| format!("Error creating image metadata from file {:?}", path))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        utils::write_file(path, json)
    }
}
