//! Text renderings of a [`ReconciliationReport`] for the tester's visual modes.

use std::fmt::Write;
use std::time::Duration;

use crate::tester::record::ReconciliationReport;

const COL_MESSAGE: usize = 30;
const COL_TIME: usize = 15;
const PLACEHOLDER: &str = "---";

/// `HH:MM:SS.ffffff`
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!(
        "{:02}:{:02}:{:02}.{:06}",
        secs / 3600,
        (secs / 60) % 60,
        secs % 60,
        elapsed.subsec_micros()
    )
}

fn counts(report: &ReconciliationReport) -> String {
    format!("[Msgs: {} of {}]", report.reconciled_count(), report.records.len())
}

/// Table of the most recent `max_rows` probes.
pub fn render_table(report: &ReconciliationReport, max_rows: usize) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<msg$}{:<t$}{:<t$}{:<t$}{}",
        "Message",
        "Sent At",
        "Received At",
        "Elapsed",
        counts(report),
        msg = COL_MESSAGE,
        t = COL_TIME,
    );

    let skip = report.records.len().saturating_sub(max_rows);
    for record in report.records.iter().skip(skip) {
        let sent = record
            .sent_at
            .map(|t| t.format("%H:%M:%S").to_string())
            .unwrap_or_else(|| PLACEHOLDER.to_string());
        let received = record
            .received_at
            .map(|t| t.format("%H:%M:%S").to_string())
            .unwrap_or_else(|| PLACEHOLDER.to_string());
        let elapsed = record
            .latency
            .map(format_elapsed)
            .unwrap_or_else(|| PLACEHOLDER.to_string());

        let _ = writeln!(
            out,
            "{:<msg$}{:<t$}{:<t$}{}",
            record.id,
            sent,
            received,
            elapsed,
            msg = COL_MESSAGE,
            t = COL_TIME,
        );
    }
    out
}

/// One cell per probe: `o` returned, `.` sent, blank not yet sent. Rows are
/// `width` cells wide; only the last `max_rows` rows are kept.
pub fn render_graph(report: &ReconciliationReport, width: usize, max_rows: usize) -> String {
    let width = width.max(1);
    let total = report.expected.max(report.records.len());

    let cells: Vec<char> = (0..total)
        .map(|i| match report.records.get(i) {
            Some(record) if record.received_at.is_some() => 'o',
            Some(_) => '.',
            None => ' ',
        })
        .collect();

    let rows: Vec<String> = cells
        .chunks(width)
        .map(|row| row.iter().collect::<String>().trim_end().to_string())
        .collect();
    let skip = rows.len().saturating_sub(max_rows);

    let mut out = format!("[Msgs: {} of {}]\n", report.reconciled_count(), total);
    for row in rows.iter().skip(skip) {
        out.push_str(row);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tester::record::Ledger;
    use chrono::Utc;
    use tokio::time::Instant;

    fn report(sent: usize, received: &[usize], expected: usize) -> ReconciliationReport {
        let start = Instant::now();
        let mut ledger = Ledger::new(expected);
        for seq in 1..=sent {
            ledger.register(&format!("r-{:04}", seq), Utc::now(), start);
        }
        for seq in received {
            ledger.observe(
                &format!("r-{:04}", seq),
                Utc::now(),
                start + Duration::from_millis(1500),
            );
        }
        ledger.report()
    }

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(Duration::from_micros(1_500_250)), "00:00:01.500250");
        assert_eq!(format_elapsed(Duration::from_secs(3723)), "01:02:03.000000");
    }

    #[test]
    fn test_table_layout() {
        let table = render_table(&report(2, &[1], 2), 10);
        let lines: Vec<&str> = table.lines().collect();

        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("Message"));
        assert!(lines[0].ends_with("[Msgs: 1 of 2]"));
        assert_eq!(&lines[0][30..37], "Sent At");
        assert!(lines[1].starts_with("r-0001"));
        assert!(lines[1].ends_with("00:00:01.500000"));
        assert!(lines[2].starts_with("r-0002"));
        assert!(lines[2].ends_with(PLACEHOLDER));
    }

    #[test]
    fn test_table_keeps_latest_rows() {
        let table = render_table(&report(5, &[], 5), 2);
        let lines: Vec<&str> = table.lines().collect();

        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("r-0004"));
        assert!(lines[2].starts_with("r-0005"));
    }

    #[test]
    fn test_graph_cells() {
        let graph = render_graph(&report(4, &[1, 3], 6), 3, 10);
        let lines: Vec<&str> = graph.lines().collect();

        assert_eq!(lines[0], "[Msgs: 2 of 6]");
        assert_eq!(lines[1], "o.o");
        assert_eq!(lines[2], ".");
    }

    #[test]
    fn test_graph_scrolls_to_last_rows() {
        let graph = render_graph(&report(6, &[6], 6), 2, 1);
        assert_eq!(graph, "[Msgs: 1 of 6]\n.o\n");
    }
}
