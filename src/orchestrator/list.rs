use std::io::{self, Write};

use clap::ValueEnum;

use crate::backends::{Repository, RepositoryError, Snapshot, SnapshotQuery, SnapshotReader};

/// Rendering of a snapshot listing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum ListFormat {
    #[default]
    Table,
    Json,
}

/// Lists snapshots over a read-only connection.
pub fn list_snapshots<R: Repository>(
    repository: &R,
    query: &SnapshotQuery,
) -> Result<Vec<Snapshot>, RepositoryError> {
    let session = repository.connect_read_only()?;
    log::info!(target: "orchestrator::list", "Listing snapshots...");
    session.list_snapshots(query)
}

/// Writes `snapshots` to `out`, nothing else is written to it.
pub fn render(snapshots: &[Snapshot], format: ListFormat, out: &mut impl Write) -> io::Result<()> {
    match format {
        ListFormat::Json => {
            serde_json::to_writer_pretty(&mut *out, snapshots)?;
            writeln!(out)
        }
        ListFormat::Table => {
            writeln!(
                out,
                "{:<20} {:<20} {:>10}  {:<30} TAGS",
                "ID", "START", "SIZE", "SOURCE"
            )?;
            for snapshot in snapshots {
                let tags: Vec<_> = snapshot
                    .tags
                    .iter()
                    .map(|(key, value)| format!("{key}:{value}"))
                    .collect();
                writeln!(
                    out,
                    "{:<20} {:<20} {:>10}  {:<30} {}",
                    snapshot.id,
                    snapshot.start_time.format("%Y-%m-%d %H:%M:%S"),
                    human_size(snapshot.size),
                    snapshot.source.to_string(),
                    tags.join(" ")
                )?;
            }
            Ok(())
        }
    }
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];

    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{size:.1} {}", UNITS[unit])
    }
}
