use std::io::{self, Write};

use serde::Serialize;

use crate::domain::FileRef;
use crate::ledger::Outcome;
use crate::pipeline::PipelineReport;

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Human,
    Json,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_report(report: &PipelineReport) -> io::Result<()> {
        Self::print_json(report)
    }

    pub fn print_expired(removed: &[FileRef]) -> io::Result<()> {
        Self::print_json(&removed)
    }

    pub fn print_paths<T: Serialize>(paths: &[T]) -> io::Result<()> {
        Self::print_json(&paths)
    }

    fn print_json<T: Serialize + ?Sized>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

pub fn print_summary(report: &PipelineReport) {
    let green = "\x1b[32m";
    let red = "\x1b[31m";
    let cyan = "\x1b[36m";
    let reset = "\x1b[0m";

    println!(
        "{cyan}kira-pl {} @ {}{reset}",
        report.pipeline, report.timestamp
    );
    for record in &report.records {
        let (label, color) = match record.outcome {
            Outcome::Success => ("ok", green),
            Outcome::Failed => ("failed", red),
        };
        println!(
            "{color}{label:>6} {} processed={} outputs={} logs={}{reset}",
            record.stage,
            record.processed,
            record.outputs.len(),
            record.logs.len()
        );
        for output in &record.outputs {
            println!("         {output}");
        }
    }
    for failure in &report.failures {
        println!(
            "{red}failed {} at {}: {}{reset}",
            failure.stage, failure.timestamp, failure.error
        );
        for log in &failure.logs {
            println!("         log {log}");
        }
    }
}
