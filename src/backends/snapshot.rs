use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use derive_more::{Display, Error};
use regex::Regex;

static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([A-Za-z0-9_.\-]+):(.+)$").expect("tag regex is valid"));

/// A `key:value` label attached to a snapshot on creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Tag {
    key: String,
    value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.key, self.value)
    }
}

/// Tag is not of the form `key:value`.
#[derive(Debug, Display, Error)]
#[display("Invalid tag '{_0}', expected key:value")]
pub struct InvalidTag(#[error(ignore)] String);

impl FromStr for Tag {
    type Err = InvalidTag;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let captures = TAG_RE.captures(s.trim()).ok_or_else(|| InvalidTag(s.to_string()))?;
        Ok(Self::new(&captures[1], &captures[2]))
    }
}

impl TryFrom<String> for Tag {
    type Error = InvalidTag;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Tag> for String {
    fn from(tag: Tag) -> Self {
        tag.to_string()
    }
}

/// The host/user/path triple the repository groups snapshot history by.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct SnapshotSource {
    pub host: String,
    pub user: String,
    pub path: PathBuf,
}

impl fmt::Display for SnapshotSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.path.display())
    }
}

/// An immutable capture of a directory tree held by the repository.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Snapshot {
    /// Repository assigned identifier.
    pub id: String,
    /// Object id of the root directory, accepted in place of `id`.
    pub root: Option<String>,
    pub source: SnapshotSource,
    pub description: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// Total size of the captured files in bytes.
    pub size: u64,
    pub tags: BTreeMap<String, String>,
}

impl Snapshot {
    pub fn has_tag(&self, tag: &Tag) -> bool {
        self.tags.get(tag.key()).is_some_and(|value| value == tag.value())
    }

    /// Matches the full identifier or root object id, or a prefix of either.
    pub fn matches_id(&self, id: &str) -> bool {
        !id.is_empty()
            && (self.id.starts_with(id) || self.root.as_deref().is_some_and(|root| root.starts_with(id)))
    }

    /// Whether `id` is exactly the identifier or the root object id.
    pub fn is_id(&self, id: &str) -> bool {
        self.id == id || self.root.as_deref() == Some(id)
    }
}

/// Selection of snapshots to list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotQuery {
    /// Only snapshots carrying all of these tags.
    pub tags: Vec<Tag>,
    /// Include snapshots of every host and user, not only the connected one.
    pub all_sources: bool,
    /// Restrict to the history of a single source path.
    pub source: Option<PathBuf>,
    pub max_results: Option<usize>,
}

impl SnapshotQuery {
    pub fn matches(&self, snapshot: &Snapshot) -> bool {
        self.tags.iter().all(|tag| snapshot.has_tag(tag))
            && self
                .source
                .as_ref()
                .is_none_or(|source| source == &snapshot.source.path)
    }

    /// Orders newest-first, drops non-matching snapshots and truncates to
    /// `max_results`.
    pub fn select(&self, mut snapshots: Vec<Snapshot>) -> Vec<Snapshot> {
        snapshots.retain(|snapshot| self.matches(snapshot));
        snapshots.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        if let Some(max) = self.max_results {
            snapshots.truncate(max);
        }
        snapshots
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use chrono::TimeZone;

    use super::*;

    pub(crate) fn snapshot(id: &str, hour: u32, tags: &[(&str, &str)]) -> Snapshot {
        Snapshot {
            id: id.to_string(),
            root: Some(format!("r{id}")),
            source: SnapshotSource {
                host: "odoo".into(),
                user: "odoo".into(),
                path: PathBuf::from("/var/lib/odoo"),
            },
            description: None,
            start_time: Utc.with_ymd_and_hms(2025, 3, 1, hour, 0, 0).unwrap(),
            end_time: None,
            size: 1024,
            tags: tags
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn parses_tags() {
        let tag: Tag = "env:prod".parse().unwrap();
        assert_eq!(tag.key(), "env");
        assert_eq!(tag.value(), "prod");
        assert_eq!(tag.to_string(), "env:prod");

        let tag: Tag = "release:2025:03".parse().unwrap();
        assert_eq!(tag.value(), "2025:03");

        assert!("missing-colon".parse::<Tag>().is_err());
        assert!(":value".parse::<Tag>().is_err());
        assert!("key:".parse::<Tag>().is_err());
    }

    #[test]
    fn select_filters_orders_and_truncates() {
        let snapshots = vec![
            snapshot("a", 1, &[("env", "prod")]),
            snapshot("b", 5, &[("env", "dev")]),
            snapshot("c", 3, &[("env", "prod")]),
            snapshot("d", 4, &[("env", "prod"), ("kind", "manual")]),
        ];
        let query = SnapshotQuery {
            tags: vec!["env:prod".parse().unwrap()],
            max_results: Some(2),
            ..Default::default()
        };

        let ids: Vec<_> = query
            .select(snapshots)
            .into_iter()
            .map(|snapshot| snapshot.id)
            .collect();
        assert_eq!(ids, ["d", "c"]);
    }

    #[test]
    fn select_restricts_to_source() {
        let mut other = snapshot("other", 9, &[]);
        other.source.path = PathBuf::from("/srv/other");
        let query = SnapshotQuery {
            source: Some(PathBuf::from("/var/lib/odoo")),
            ..Default::default()
        };

        let selected = query.select(vec![other, snapshot("mine", 1, &[])]);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].id, "mine");
    }

    #[test]
    fn id_prefix_matches() {
        let snapshot = snapshot("k4f2a9", 1, &[]);
        assert!(snapshot.matches_id("k4f2a9"));
        assert!(snapshot.matches_id("k4f"));
        assert!(!snapshot.matches_id("k5"));
        assert!(!snapshot.matches_id(""));
    }

    #[test]
    fn root_object_id_matches() {
        let mut snapshot = snapshot("k4f2a9", 1, &[]);
        snapshot.root = Some("kd91c07".into());
        assert!(snapshot.matches_id("kd91c07"));
        assert!(snapshot.matches_id("kd9"));
        assert!(snapshot.is_id("kd91c07"));
        assert!(snapshot.is_id("k4f2a9"));
        assert!(!snapshot.is_id("kd9"));

        snapshot.root = None;
        assert!(!snapshot.matches_id("kd9"));
    }
}
