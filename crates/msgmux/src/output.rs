use std::io::IsTerminal;

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

/// Outcome of one `loopback` run.
#[derive(Debug, Serialize)]
pub struct LoopbackReport {
    pub messages: u32,
    pub message_size: usize,
    pub writers: u32,
    pub window: u32,
    pub fragment_size: usize,
    pub max_outbound_messages: u32,
    pub bytes: u64,
    pub elapsed_ms: u64,
    pub throughput_mib_s: f64,
    pub corrupted: u32,
    pub verified: bool,
}

pub fn print_loopback(report: &LoopbackReport, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string(report).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["FIELD", "VALUE"]);
            for (field, value) in loopback_rows(report) {
                table.add_row(vec![field.to_string(), value]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty => {
            let line: Vec<String> = loopback_rows(report)
                .into_iter()
                .map(|(field, value)| format!("{field}={value}"))
                .collect();
            println!("{}", line.join(" "));
        }
    }
}

fn loopback_rows(report: &LoopbackReport) -> Vec<(&'static str, String)> {
    vec![
        ("messages", report.messages.to_string()),
        ("message_size", report.message_size.to_string()),
        ("writers", report.writers.to_string()),
        ("window", report.window.to_string()),
        ("fragment_size", report.fragment_size.to_string()),
        ("max_outbound", report.max_outbound_messages.to_string()),
        ("bytes", report.bytes.to_string()),
        ("elapsed_ms", report.elapsed_ms.to_string()),
        ("throughput_mib_s", format!("{:.2}", report.throughput_mib_s)),
        ("corrupted", report.corrupted.to_string()),
        ("verified", report.verified.to_string()),
    ]
}
