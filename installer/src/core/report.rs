//! Per-host outcomes collected over one orchestration run.

/// How one host's workflow ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostOutcome {
    Success,
    /// The workflow never started (e.g. host not answering on the SSH port).
    Skipped(String),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostReport {
    pub section: String,
    pub host: String,
    pub outcome: HostOutcome,
}

/// Outcomes in processing order. Only used for the end-of-run summary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub hosts: Vec<HostReport>,
}

impl RunReport {
    pub fn record(&mut self, section: &str, host: &str, outcome: HostOutcome) {
        self.hosts.push(HostReport {
            section: section.to_string(),
            host: host.to_string(),
            outcome,
        });
    }

    pub fn extend(&mut self, other: RunReport) {
        self.hosts.extend(other.hosts);
    }

    pub fn failures(&self) -> impl Iterator<Item = &HostReport> {
        self.hosts
            .iter()
            .filter(|h| matches!(h.outcome, HostOutcome::Failed(_)))
    }

    pub fn skipped(&self) -> impl Iterator<Item = &HostReport> {
        self.hosts
            .iter()
            .filter(|h| matches!(h.outcome, HostOutcome::Skipped(_)))
    }

    pub fn succeeded(&self) -> usize {
        self.hosts
            .iter()
            .filter(|h| h.outcome == HostOutcome::Success)
            .count()
    }

    /// Outcome of the first report for `host`.
    pub fn outcome_for(&self, host: &str) -> Option<&HostOutcome> {
        self.hosts
            .iter()
            .find(|h| h.host == host)
            .map(|h| &h.outcome)
    }

    /// One-line summary, e.g. `hosts=3 succeeded=2 skipped=0 failed=1`.
    pub fn summary(&self) -> String {
        format!(
            "hosts={} succeeded={} skipped={} failed={}",
            self.hosts.len(),
            self.succeeded(),
            self.skipped().count(),
            self.failures().count()
        )
    }
}
