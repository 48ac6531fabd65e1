/// Configure retention of snapshots.
///
/// Each count keeps the newest snapshot of that many distinct periods. The
/// windows overlap: a snapshot is kept if any window selects it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct RetentionPolicy {
    /// Defines how many of the most recent snapshots to keep.
    pub latest: u32,

    /// Defines how many hourly snapshots to keep.
    pub hourly: u32,

    /// Defines how many daily snapshots to keep.
    pub daily: u32,

    /// Defines how many weekly snapshots to keep.
    pub weekly: u32,

    /// Defines how many monthly snapshots to keep.
    pub monthly: u32,

    /// Defines how many annual snapshots to keep.
    pub annual: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            latest: 42,
            hourly: 0,
            daily: 14,
            weekly: 8,
            monthly: 6,
            annual: 2,
        }
    }
}

impl RetentionPolicy {
    /// No window keeps anything.
    pub fn is_empty(&self) -> bool {
        let Self {
            latest,
            hourly,
            daily,
            weekly,
            monthly,
            annual,
        } = *self;

        [latest, hourly, daily, weekly, monthly, annual]
            .into_iter()
            .all(|keep| keep == 0)
    }

    /// The policy handed to the repository.
    ///
    /// `latest` is raised to at least one, so the newest snapshot (the one
    /// just created) is never pruned.
    pub fn effective(&self) -> Self {
        if self.latest == 0 {
            log::warn!(
                target: "retention",
                "keep-latest of 0 would allow pruning the snapshot just created; keeping the latest snapshot"
            );
        }

        Self {
            latest: self.latest.max(1),
            ..*self
        }
    }

    /// Named keep-counts in a stable order.
    pub fn windows(&self) -> [(&'static str, u32); 6] {
        [
            ("latest", self.latest),
            ("hourly", self.hourly),
            ("daily", self.daily),
            ("weekly", self.weekly),
            ("monthly", self.monthly),
            ("annual", self.annual),
        ]
    }
}

/// Per-window overrides, e.g. from command line flags.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RetentionOverrides {
    pub latest: Option<u32>,
    pub hourly: Option<u32>,
    pub daily: Option<u32>,
    pub weekly: Option<u32>,
    pub monthly: Option<u32>,
    pub annual: Option<u32>,
}

impl RetentionOverrides {
    pub fn apply(&self, policy: RetentionPolicy) -> RetentionPolicy {
        RetentionPolicy {
            latest: self.latest.unwrap_or(policy.latest),
            hourly: self.hourly.unwrap_or(policy.hourly),
            daily: self.daily.unwrap_or(policy.daily),
            weekly: self.weekly.unwrap_or(policy.weekly),
            monthly: self.monthly.unwrap_or(policy.monthly),
            annual: self.annual.unwrap_or(policy.annual),
        }
    }
}
