use std::io::{IsTerminal, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
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

/// One payload the CLI received, either an inbound message or a reply.
#[derive(Debug, Serialize)]
pub struct MessageOutput<'a> {
    pub kind: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub payload_size: usize,
    pub payload: String,
    pub timestamp: String,
}

impl<'a> MessageOutput<'a> {
    pub fn new(kind: &'a str, id: Option<String>, payload: &[u8]) -> Self {
        Self {
            kind,
            id,
            payload_size: payload.len(),
            payload: payload_preview(payload),
            timestamp: now_unix_seconds(),
        }
    }
}

pub fn print_message(message: &MessageOutput<'_>, raw: &[u8], format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string(message).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["KIND", "ID", "SIZE", "PAYLOAD"])
                .add_row(vec![
                    message.kind.to_string(),
                    message.id.clone().unwrap_or_else(|| "-".to_string()),
                    message.payload_size.to_string(),
                    message.payload.clone(),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "kind={} id={} size={} payload={}",
                message.kind,
                message.id.as_deref().unwrap_or("-"),
                message.payload_size,
                message.payload
            );
        }
        OutputFormat::Raw => print_raw(raw),
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn payload_preview(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<binary {} bytes>", payload.len()),
    }
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_payloads_are_summarized() {
        let out = MessageOutput::new("message", None, &[0xff, 0xfe, 0x00]);
        assert_eq!(out.payload, "<binary 3 bytes>");
        assert_eq!(out.payload_size, 3);
    }

    #[test]
    fn json_omits_missing_id() {
        let out = MessageOutput::new("reply", None, b"pong");
        let value = serde_json::to_value(&out).expect("output should serialize");
        assert_eq!(value["kind"], "reply");
        assert_eq!(value["payload"], "pong");
        assert!(value.get("id").is_none());
    }
}
