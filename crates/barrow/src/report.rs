//! Run report, as mailed to the operators.

use gridtext::{Justify, Table};

use crate::journal::RunSummary;
use crate::model::DumpState;

/// A rendered report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    /// Three characters, `!` or `-`, for errors, warnings and strange lines.
    pub errmark: String,
    pub title: String,
    pub body: String,
}

/// `999B`, `1.50K`, `12.00M`, `3.20G`.
pub fn human_size(size: u64) -> String {
    const UNITS: [&str; 4] = ["B", "K", "M", "G"];
    let mut unit = 0;
    while unit < UNITS.len() - 1 && size >= 1000 * 1024u64.pow(unit as u32) {
        unit += 1;
    }
    if unit == 0 {
        format!("{size}B")
    } else {
        format!(
            "{:.2}{}",
            size as f64 / 1024f64.powi(unit as i32),
            UNITS[unit]
        )
    }
}

fn ratio(comp: u64, raw: u64) -> String {
    let ratio = if raw > 0 {
        comp as f64 * 100.0 / raw as f64
    } else {
        0.0
    };
    format!("{ratio:.2}%")
}

fn size_cell(size: Option<u64>) -> String {
    size.map(human_size).unwrap_or_else(|| "-".into())
}

impl Report {
    /// Build the report for `summary`.
    ///
    /// While a run is still going (`running`), problems such as a missing
    /// end date are notes rather than errors.
    pub fn build(summary: &RunSummary, host: Option<&str>, running: bool) -> Self {
        let mut errors = summary.errors.clone();
        let mut notes = summary.notes.clone();

        let mut problems = Vec::new();
        if summary.start_hrs.is_none() {
            problems.push("no starting date (dump not started?)".to_string());
        }
        if summary.end_hrs.is_none() {
            problems.push("no ending date (dump still running or interrupted)".to_string());
        }
        if summary.dumps.is_empty() {
            problems.push("no dump found".to_string());
        } else {
            let failed = summary
                .dumps
                .iter()
                .filter(|d| d.state != DumpState::Ok)
                .count();
            if failed > 0 {
                problems.push(format!("{failed} dumps did not finish properly"));
            }
        }
        let target = if running { &mut notes } else { &mut errors };
        problems.append(target);
        *target = problems;

        let mark = |flag: bool| if flag { '!' } else { '-' };
        let errmark: String = [
            mark(!errors.is_empty()),
            mark(!summary.warnings.is_empty()),
            mark(!summary.strange_lines.is_empty()),
        ]
        .into_iter()
        .collect();

        let config = summary.config.as_deref().unwrap_or("?");
        let date = summary
            .start_hrs
            .map(|h| h.to_date())
            .unwrap_or_else(|| "?".into());
        let title = format!("{errmark} BARROW '{config}' REPORT [{date}]");

        let runid = summary
            .runid
            .map(|r| format!("{r:04}"))
            .unwrap_or_else(|| "?".into());
        let ended = summary
            .end_hrs
            .map(|h| h.to_date())
            .unwrap_or_else(|| "?".into());
        let mut body = format!(
            "host:     {}\nconfig:   {config}\nrun:      {runid}\nstarted:  {date}\nended:    {ended}\n",
            host.unwrap_or("?")
        );

        if !summary.dumps.is_empty() {
            body.push('\n');
            for line in dump_table(summary) {
                body.push_str(&line);
                body.push('\n');
            }
        }

        section(&mut body, "ERRORS", errors.iter().map(String::as_str));
        section(
            &mut body,
            "WARNINGS",
            summary.warnings.iter().map(String::as_str),
        );
        let strange: Vec<String> = summary
            .strange_lines
            .iter()
            .map(|(source, line)| format!("[{source}] {line}"))
            .collect();
        section(&mut body, "STRANGE LINES", strange.iter().map(String::as_str));
        section(&mut body, "NOTES", notes.iter().map(String::as_str));
        let messages: Vec<String> = summary
            .user_messages
            .iter()
            .map(|(level, message)| format!("[{level}] {message}"))
            .collect();
        section(&mut body, "MESSAGES", messages.iter().map(String::as_str));

        Self {
            errmark,
            title,
            body,
        }
    }
}

fn dump_table(summary: &RunSummary) -> Vec<String> {
    let caption = match summary.runid {
        Some(runid) => format!("DUMP RUN {runid:04}"),
        None => "DUMP RUN ????".into(),
    };
    let mut table = Table::new()
        .caption(caption)
        .column("DISK", Justify::Left)
        .column("STATE", Justify::Center)
        .column("RAW SIZE", Justify::Right)
        .column("COMP SIZE", Justify::Right)
        .column("RATIO", Justify::Right)
        .column("FILES", Justify::Right);

    let (mut raw_total, mut comp_total, mut files_total) = (0, 0, 0);
    for dump in &summary.dumps {
        raw_total += dump.raw_bytes.unwrap_or(0);
        comp_total += dump.comp_bytes.unwrap_or(0);
        files_total += dump.file_count.unwrap_or(0);
        let ratio_cell = match (dump.comp_bytes, dump.raw_bytes) {
            (Some(comp), Some(raw)) => ratio(comp, raw),
            _ => "-".into(),
        };
        table.row([
            dump.disk.clone(),
            dump.state.to_string(),
            size_cell(dump.raw_bytes),
            size_cell(dump.comp_bytes),
            ratio_cell,
            dump.file_count
                .map(|n| n.to_string())
                .unwrap_or_else(|| "-".into()),
        ]);
    }

    if summary.dumps.len() > 1 {
        table.separator();
        table.row([
            String::new(),
            String::new(),
            human_size(raw_total),
            human_size(comp_total),
            ratio(comp_total, raw_total),
            files_total.to_string(),
        ]);
    }

    table.render()
}

fn section<'a>(body: &mut String, title: &str, lines: impl ExactSizeIterator<Item = &'a str>) {
    if lines.len() == 0 {
        return;
    }
    body.push_str(&format!("\n{title} ({}):\n", lines.len()));
    for line in lines {
        body.push_str(&format!("  - {line}\n"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::DumpInfo;

    #[test]
    fn test_human_size() {
        assert_eq!(human_size(0), "0B");
        assert_eq!(human_size(999), "999B");
        assert_eq!(human_size(1000), "0.98K");
        assert_eq!(human_size(1536), "1.50K");
        assert_eq!(human_size(5 * 1024 * 1024), "5.00M");
        assert_eq!(human_size(3 * 1024 * 1024 * 1024), "3.00G");
        assert_eq!(human_size(5000 * 1024 * 1024 * 1024), "5000.00G");
    }

    fn dump(disk: &str, state: DumpState, raw: u64, comp: u64) -> DumpInfo {
        DumpInfo {
            disk: disk.into(),
            state,
            fname: Some(format!("{disk}.part")),
            baseline: Some(0),
            raw_bytes: Some(raw),
            comp_bytes: Some(comp),
            file_count: Some(3),
            hash: None,
            nfixes: 0,
            abort_reason: None,
        }
    }

    fn summary() -> RunSummary {
        RunSummary {
            config: Some("daily".into()),
            runid: Some(42),
            start_hrs: Some("20240305070809".parse().unwrap()),
            end_hrs: Some("20240305071500".parse().unwrap()),
            dumps: vec![
                dump("home", DumpState::Ok, 2048, 1024),
                dump("etc", DumpState::Ok, 1000, 100),
            ],
            ..RunSummary::default()
        }
    }

    #[test]
    fn test_clean_report() {
        let report = Report::build(&summary(), Some("backup1"), false);
        assert_eq!(report.errmark, "---");
        assert_eq!(report.title, "--- BARROW 'daily' REPORT [2024/03/05 07:08:09]");
        assert!(report.body.contains("host:     backup1"));
        assert!(report.body.contains("DUMP RUN 0042"));
        assert!(report.body.contains("50.00%"));
        assert!(!report.body.contains("ERRORS"));

        // Totals row: 3048 raw bytes, 1124 compressed.
        assert!(report.body.contains("2.98K"));
        assert!(report.body.contains("1.10K"));
    }

    #[test]
    fn test_problems_become_errors() {
        let mut summary = summary();
        summary.end_hrs = None;
        summary.dumps[1].state = DumpState::Failed;
        summary.warnings.push("slow disk".into());
        summary
            .strange_lines
            .push(("create:tar".into(), "what".into()));

        let report = Report::build(&summary, None, false);
        assert_eq!(report.errmark, "!!!");
        assert!(report.body.contains("ERRORS (2)"));
        assert!(report.body.contains("no ending date"));
        assert!(report.body.contains("1 dumps did not finish properly"));
        assert!(report.body.contains("[create:tar] what"));
    }

    #[test]
    fn test_running_report_uses_notes() {
        let mut summary = summary();
        summary.end_hrs = None;
        let report = Report::build(&summary, None, true);
        assert_eq!(report.errmark, "---");
        assert!(report.body.contains("NOTES (1)"));
    }

    #[test]
    fn test_empty_summary() {
        let report = Report::build(&RunSummary::default(), None, false);
        assert_eq!(report.errmark, "!--");
        assert_eq!(report.title, "!-- BARROW '?' REPORT [?]");
        assert!(report.body.contains("no dump found"));
        assert!(report.body.contains("no starting date"));
    }
}
