use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::backends::{Snapshot, SnapshotSource};

/// Prefix kopia stores user supplied tags under.
const TAG_PREFIX: &str = "tag:";

/// Snapshot manifest as printed by `kopia snapshot list --json`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Manifest {
    id: String,
    source: Source,
    #[serde(default)]
    description: String,
    start_time: DateTime<Utc>,
    #[serde(default)]
    end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    stats: Stats,
    #[serde(default)]
    root_entry: Option<RootEntry>,
    #[serde(default)]
    tags: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Source {
    host: String,
    user_name: String,
    path: PathBuf,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Stats {
    #[serde(default)]
    total_size: u64,
}

#[derive(Debug, Deserialize)]
struct RootEntry {
    #[serde(default)]
    obj: Option<String>,
    #[serde(default)]
    summ: Option<Summary>,
}

#[derive(Debug, Deserialize)]
struct Summary {
    #[serde(default)]
    size: u64,
}

impl From<Manifest> for Snapshot {
    fn from(manifest: Manifest) -> Self {
        let (root, summary) = match manifest.root_entry {
            Some(entry) => (entry.obj, entry.summ),
            None => (None, None),
        };
        let size = summary.map(|summ| summ.size).unwrap_or(manifest.stats.total_size);

        let tags = manifest
            .tags
            .into_iter()
            .map(|(key, value)| match key.strip_prefix(TAG_PREFIX) {
                Some(stripped) => (stripped.to_string(), value),
                None => (key, value),
            })
            .collect();

        Snapshot {
            id: manifest.id,
            root,
            source: SnapshotSource {
                host: manifest.source.host,
                user: manifest.source.user_name,
                path: manifest.source.path,
            },
            description: Some(manifest.description).filter(|d| !d.is_empty()),
            start_time: manifest.start_time,
            end_time: manifest.end_time,
            size,
            tags,
        }
    }
}

/// Parses the output of `kopia snapshot list --json`.
pub(super) fn parse_list(json: &str) -> Result<Vec<Snapshot>, serde_json::Error> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }

    let manifests: Vec<Manifest> = serde_json::from_str(json)?;
    Ok(manifests.into_iter().map(Snapshot::from).collect())
}

/// Parses the output of `kopia snapshot create --json`.
///
/// Depending on the kopia version a single manifest or a list is printed.
pub(super) fn parse_created(json: &str) -> Result<Snapshot, serde_json::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Created {
        One(Manifest),
        Many(Vec<Manifest>),
    }

    match serde_json::from_str(json)? {
        Created::One(manifest) => Ok(manifest.into()),
        Created::Many(manifests) => manifests
            .into_iter()
            .map(Snapshot::from)
            .max_by_key(|snapshot| snapshot.start_time)
            .ok_or_else(|| serde::de::Error::custom("no snapshot manifest in output")),
    }
}
