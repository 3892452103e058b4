use std::io::{IsTerminal, Write};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use framebridge_client::{BridgeStatus, ReceivedFrame};
use serde::Serialize;

#[derive(Clone, Debug, Copy, PartialEq, Eq, ValueEnum)]
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

#[derive(Serialize)]
struct FrameOutput<'a> {
    event: &'static str,
    frame_id: u64,
    width: u32,
    height: u32,
    stride: u32,
    transport: &'a str,
    shm_slot: Option<u32>,
    wire_bytes: usize,
    pixel_bytes: usize,
    timestamp_ms: u64,
}

impl<'a> FrameOutput<'a> {
    fn from_frame(frame: &'a ReceivedFrame) -> Self {
        Self {
            event: "frame",
            frame_id: frame.meta.frame_id,
            width: frame.meta.width,
            height: frame.meta.height,
            stride: frame.meta.stride,
            transport: &frame.meta.transport,
            shm_slot: frame.meta.shm_slot,
            wire_bytes: frame.wire_len,
            pixel_bytes: frame.pixels.len(),
            timestamp_ms: frame.meta.timestamp_ms,
        }
    }
}

pub fn print_frame(frame: &ReceivedFrame, format: OutputFormat) {
    let out = FrameOutput::from_frame(frame);
    match format {
        OutputFormat::Json => print_json(&out),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["FRAME", "SIZE", "TRANSPORT", "WIRE", "PIXELS"])
                .add_row(vec![
                    out.frame_id.to_string(),
                    format!("{}x{}", out.width, out.height),
                    transport_label(&out),
                    out.wire_bytes.to_string(),
                    out.pixel_bytes.to_string(),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "frame={} size={}x{} stride={} transport={} wire={} pixels={}",
                out.frame_id,
                out.width,
                out.height,
                out.stride,
                transport_label(&out),
                out.wire_bytes,
                out.pixel_bytes
            );
        }
        OutputFormat::Raw => print_raw(&frame.pixels),
    }
}

fn transport_label(out: &FrameOutput<'_>) -> String {
    match out.shm_slot {
        Some(slot) => format!("{} (slot {slot})", out.transport),
        None => out.transport.to_string(),
    }
}

pub fn print_status(status: &BridgeStatus, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(status),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["FIELD", "VALUE"]);
            for (field, value) in status_rows(status) {
                table.add_row(vec![field.to_string(), value]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty => {
            for (field, value) in status_rows(status) {
                println!("{field:<22} {value}");
            }
        }
        OutputFormat::Raw => println!("{}", status.state),
    }
}

fn status_rows(status: &BridgeStatus) -> Vec<(&'static str, String)> {
    let opt = |v: Option<String>| v.unwrap_or_else(|| "-".to_string());
    let dim = |v: Option<u32>| v.map_or_else(|| "-".to_string(), |v| v.to_string());
    vec![
        ("state", status.state.to_string()),
        ("enabled", status.enabled.to_string()),
        ("port", status.port.to_string()),
        ("transport", opt(status.transport.clone())),
        ("degraded", status.degraded.to_string()),
        ("session_id", opt(status.session_id.map(|id| id.to_string()))),
        (
            "inflight_frames",
            format!("{}/{}", status.inflight_frames, status.max_inflight_frames),
        ),
        (
            "target_stream_size",
            match (status.target_stream_width, status.target_stream_height) {
                (None, None) => "-".to_string(),
                (w, h) => format!("{}x{}", dim(w), dim(h)),
            },
        ),
        (
            "last_error",
            opt(status
                .last_error
                .as_ref()
                .map(|e| format!("{}: {}", e.code, e.message))),
        ),
    ]
}

pub fn print_json<T: Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}
