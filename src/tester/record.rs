//! Probe bookkeeping for a reconciliation run.

use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::common::error::TesterError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProbeStatus {
    Pending,
    Reconciled,
    Expired,
    /// Seen on the return queue without matching any probe of this run.
    Rejected,
}

impl ProbeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Reconciled => "RECONCILED",
            Self::Expired => "EXPIRED",
            Self::Rejected => "REJECTED",
        }
    }
}

impl fmt::Display for ProbeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One probe, or one foreign message, as tracked by the ledger.
#[derive(Debug, Clone)]
pub struct ReconciliationRecord {
    pub id: String,
    /// 1-based send order. Zero for foreign messages.
    pub seq: usize,
    pub sent_at: Option<DateTime<Utc>>,
    pub received_at: Option<DateTime<Utc>>,
    pub latency: Option<Duration>,
    pub status: ProbeStatus,
    sent: Option<Instant>,
}

/// What an incoming message turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    Matched(Duration),
    /// Another return of an already reconciled probe.
    Duplicate,
    /// No probe of this run has this id. `repeat` is set when the same
    /// foreign id was seen before.
    Foreign { repeat: bool },
}

#[derive(Debug, Default)]
pub struct Ledger {
    expected: usize,
    probes: Vec<ReconciliationRecord>,
    index: HashMap<String, usize>,
    foreign: Vec<ReconciliationRecord>,
    foreign_index: HashMap<String, usize>,
    duplicates: usize,
    finished: bool,
}

impl Ledger {
    pub fn new(expected: usize) -> Self {
        Self {
            expected,
            ..Self::default()
        }
    }

    /// Track a probe before it is published.
    pub fn register(&mut self, id: &str, sent_at: DateTime<Utc>, sent: Instant) {
        let seq = self.probes.len() + 1;
        self.index.insert(id.to_string(), self.probes.len());
        self.probes.push(ReconciliationRecord {
            id: id.to_string(),
            seq,
            sent_at: Some(sent_at),
            received_at: None,
            latency: None,
            status: ProbeStatus::Pending,
            sent: Some(sent),
        });
    }

    pub fn observe(&mut self, id: &str, received_at: DateTime<Utc>, now: Instant) -> Observation {
        if let Some(&slot) = self.index.get(id) {
            let record = &mut self.probes[slot];
            return match record.status {
                ProbeStatus::Pending => {
                    let latency = record.sent.map(|sent| now - sent).unwrap_or_default();
                    record.received_at = Some(received_at);
                    record.latency = Some(latency);
                    record.status = ProbeStatus::Reconciled;
                    Observation::Matched(latency)
                }
                _ => {
                    self.duplicates += 1;
                    Observation::Duplicate
                }
            };
        }

        if self.foreign_index.contains_key(id) {
            return Observation::Foreign { repeat: true };
        }
        self.foreign_index.insert(id.to_string(), self.foreign.len());
        self.foreign.push(ReconciliationRecord {
            id: id.to_string(),
            seq: 0,
            sent_at: None,
            received_at: Some(received_at),
            latency: None,
            status: ProbeStatus::Rejected,
            sent: None,
        });
        Observation::Foreign { repeat: false }
    }

    /// Expire every probe still pending.
    pub fn finalize(&mut self) {
        for record in &mut self.probes {
            if record.status == ProbeStatus::Pending {
                record.status = ProbeStatus::Expired;
            }
        }
        self.finished = true;
    }

    pub fn all_reconciled(&self) -> bool {
        self.probes.len() == self.expected
            && self
                .probes
                .iter()
                .all(|r| r.status == ProbeStatus::Reconciled)
    }

    pub fn report(&self) -> ReconciliationReport {
        ReconciliationReport {
            expected: self.expected,
            records: self.probes.clone(),
            rejected: self.foreign.clone(),
            duplicates: self.duplicates,
            finished: self.finished,
        }
    }
}

/// Snapshot of a run.
#[derive(Debug, Clone, Default)]
pub struct ReconciliationReport {
    /// Probes the run intends to send.
    pub expected: usize,
    /// Probes sent so far, in send order.
    pub records: Vec<ReconciliationRecord>,
    pub rejected: Vec<ReconciliationRecord>,
    pub duplicates: usize,
    pub finished: bool,
}

impl ReconciliationReport {
    pub fn get(&self, id: &str) -> Option<&ReconciliationRecord> {
        self.records
            .iter()
            .chain(self.rejected.iter())
            .find(|r| r.id == id)
    }

    pub fn count(&self, status: ProbeStatus) -> usize {
        match status {
            ProbeStatus::Rejected => self.rejected.len(),
            _ => self.records.iter().filter(|r| r.status == status).count(),
        }
    }

    pub fn reconciled_count(&self) -> usize {
        self.count(ProbeStatus::Reconciled)
    }

    pub fn unreconciled(&self) -> impl Iterator<Item = &ReconciliationRecord> {
        self.records
            .iter()
            .filter(|r| r.status != ProbeStatus::Reconciled)
    }

    pub fn summary_line(&self) -> String {
        format!(
            "Number of messages reconciled: {} of {}",
            self.reconciled_count(),
            self.expected
        )
    }

    /// Write one unreconciled probe id per line.
    pub fn write_unreconciled(&self, path: &Path) -> Result<(), TesterError> {
        let report_error = |source| TesterError::Report {
            path: path.display().to_string(),
            source,
        };

        let mut out = std::io::BufWriter::new(std::fs::File::create(path).map_err(report_error)?);
        for record in self.unreconciled() {
            writeln!(out, "{}", record.id).map_err(report_error)?;
        }
        out.flush().map_err(report_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger_with(ids: &[&str], expected: usize) -> (Ledger, Instant) {
        let start = Instant::now();
        let mut ledger = Ledger::new(expected);
        for id in ids {
            ledger.register(id, Utc::now(), start);
        }
        (ledger, start)
    }

    #[test]
    fn test_match_records_latency() {
        let (mut ledger, start) = ledger_with(&["a-0001", "a-0002"], 2);

        let seen = ledger.observe("a-0002", Utc::now(), start + Duration::from_millis(250));
        assert_eq!(seen, Observation::Matched(Duration::from_millis(250)));

        let report = ledger.report();
        let record = report.get("a-0002").unwrap();
        assert_eq!(record.status, ProbeStatus::Reconciled);
        assert_eq!(record.seq, 2);
        assert_eq!(record.latency, Some(Duration::from_millis(250)));
        assert!(record.received_at.is_some());
        assert_eq!(report.get("a-0001").unwrap().status, ProbeStatus::Pending);
    }

    #[test]
    fn test_duplicate_and_foreign() {
        let (mut ledger, start) = ledger_with(&["a-0001"], 1);

        assert!(matches!(ledger.observe("a-0001", Utc::now(), start), Observation::Matched(_)));
        assert_eq!(ledger.observe("a-0001", Utc::now(), start), Observation::Duplicate);
        assert_eq!(
            ledger.observe("stale", Utc::now(), start),
            Observation::Foreign { repeat: false }
        );
        assert_eq!(
            ledger.observe("stale", Utc::now(), start),
            Observation::Foreign { repeat: true }
        );

        let report = ledger.report();
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.count(ProbeStatus::Rejected), 1);
        assert_eq!(report.get("stale").unwrap().status, ProbeStatus::Rejected);
        assert_eq!(report.reconciled_count(), 1);
    }

    #[test]
    fn test_finalize_expires_pending() {
        let (mut ledger, start) = ledger_with(&["a-0001", "a-0002", "a-0003"], 3);
        ledger.observe("a-0003", Utc::now(), start);
        assert!(!ledger.all_reconciled());

        ledger.finalize();
        let report = ledger.report();
        assert!(report.finished);
        assert_eq!(report.count(ProbeStatus::Expired), 2);
        assert_eq!(report.count(ProbeStatus::Pending), 0);
        let unreconciled: Vec<_> = report.unreconciled().map(|r| r.id.as_str()).collect();
        assert_eq!(unreconciled, vec!["a-0001", "a-0002"]);
        assert_eq!(report.summary_line(), "Number of messages reconciled: 1 of 3");
    }

    #[test]
    fn test_all_reconciled_needs_every_probe_sent() {
        let (mut ledger, start) = ledger_with(&["a-0001"], 2);
        ledger.observe("a-0001", Utc::now(), start);
        assert!(!ledger.all_reconciled());

        ledger.register("a-0002", Utc::now(), start);
        ledger.observe("a-0002", Utc::now(), start);
        assert!(ledger.all_reconciled());
    }

    #[test]
    fn test_write_unreconciled_report() {
        let (mut ledger, start) = ledger_with(&["a-0001", "a-0002"], 2);
        ledger.observe("a-0001", Utc::now(), start);
        ledger.finalize();

        let path = std::env::temp_dir().join(format!("mqws-report-{}.txt", uuid::Uuid::new_v4()));
        ledger.report().write_unreconciled(&path).unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(written, "a-0002\n");
    }

    #[test]
    fn test_report_path_error() {
        let report = Ledger::new(0).report();
        let err = report
            .write_unreconciled(Path::new("/nonexistent-dir/report.txt"))
            .unwrap_err();
        assert!(matches!(err, TesterError::Report { .. }));
    }
}
