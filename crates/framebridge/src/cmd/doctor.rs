use serde::Serialize;

use framebridge_client::{default_compressor, FileDumpSink};
use framebridge_protocol::DEFAULT_PORT;
use framebridge_transport::{port_available, slot_size_for, ShmRing};

use crate::cmd::version::active_features;
use crate::cmd::DoctorArgs;
use crate::exit::{CliResult, HEALTH_CHECK_FAILED, SUCCESS};
use crate::output::{print_json, OutputFormat};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum CheckStatus {
    Pass,
    Fail,
    Warn,
    Info,
}

#[derive(Debug, Serialize)]
struct CheckResult {
    name: &'static str,
    status: CheckStatus,
    detail: String,
}

impl CheckResult {
    fn new(name: &'static str, status: CheckStatus, detail: impl Into<String>) -> Self {
        Self {
            name,
            status,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct DoctorOutput {
    checks: Vec<CheckResult>,
    overall: &'static str,
}

pub fn run(_args: DoctorArgs, format: OutputFormat) -> CliResult<i32> {
    let checks = vec![
        shared_memory_check(),
        default_port_check(),
        dump_dir_check(),
        compression_check(),
        CheckResult::new("compiled_features", CheckStatus::Info, active_features().join(", ")),
    ];

    let has_fail = checks.iter().any(|c| c.status == CheckStatus::Fail);
    let output = DoctorOutput {
        checks,
        overall: if has_fail { "fail" } else { "pass" },
    };

    print_doctor(&output, format);

    if has_fail {
        Ok(HEALTH_CHECK_FAILED)
    } else {
        Ok(SUCCESS)
    }
}

fn print_doctor(output: &DoctorOutput, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(output),
        OutputFormat::Table | OutputFormat::Pretty => {
            println!("framebridge doctor\n");
            for c in &output.checks {
                println!(
                    "  [{:>4}] {:<18} {}",
                    status_text(c.status),
                    c.name,
                    c.detail
                );
            }
            if output.overall == "pass" {
                println!("\n  Result: all checks passed");
            } else {
                println!("\n  Result: one or more checks failed");
            }
        }
        OutputFormat::Raw => println!("{}", output.overall),
    }
}

fn status_text(status: CheckStatus) -> &'static str {
    match status {
        CheckStatus::Pass => "PASS",
        CheckStatus::Fail => "FAIL",
        CheckStatus::Warn => "WARN",
        CheckStatus::Info => "INFO",
    }
}

/// Create a small ring, write and read one slot, then unlink it.
fn shared_memory_check() -> CheckResult {
    const NAME: &str = "shared_memory";
    let ring_name = format!("framebridge_doctor_{}", std::process::id());
    let payload = [0x5Au8; 64];

    let mut ring = match ShmRing::create(&ring_name, 1, slot_size_for(payload.len())) {
        Ok(ring) => ring,
        Err(err) => {
            let status = if cfg!(unix) {
                CheckStatus::Fail
            } else {
                CheckStatus::Warn
            };
            return CheckResult::new(NAME, status, format!("ring create failed: {err}"));
        }
    };

    let result = ring
        .write_next(&payload, 1, 0)
        .and_then(|slot| ring.read_slot(slot));
    ring.close(true);

    match result {
        Ok(Some(read)) if read.payload[..] == payload[..] => {
            CheckResult::new(NAME, CheckStatus::Pass, "ring create, write, read, unlink ok")
        }
        Ok(_) => CheckResult::new(NAME, CheckStatus::Fail, "ring slot read back wrong data"),
        Err(err) => CheckResult::new(NAME, CheckStatus::Fail, format!("ring I/O failed: {err}")),
    }
}

fn default_port_check() -> CheckResult {
    if port_available(DEFAULT_PORT) {
        CheckResult::new(
            "default_port",
            CheckStatus::Pass,
            format!("127.0.0.1:{DEFAULT_PORT} is free"),
        )
    } else {
        CheckResult::new(
            "default_port",
            CheckStatus::Warn,
            format!("127.0.0.1:{DEFAULT_PORT} is in use (a consumer may already be running)"),
        )
    }
}

fn dump_dir_check() -> CheckResult {
    let root = FileDumpSink::default_root();
    let marker = root.join(format!(".doctor-{}", std::process::id()));
    let result = std::fs::create_dir_all(&root)
        .and_then(|()| std::fs::write(&marker, b"ok"))
        .and_then(|()| std::fs::remove_file(&marker));

    match result {
        Ok(()) => CheckResult::new(
            "dump_dir",
            CheckStatus::Pass,
            format!("{} is writable", root.display()),
        ),
        Err(err) => CheckResult::new(
            "dump_dir",
            CheckStatus::Warn,
            format!("{} is not writable: {err}", root.display()),
        ),
    }
}

fn compression_check() -> CheckResult {
    let compressor = default_compressor();
    if compressor.is_degraded() {
        return CheckResult::new(
            "compression",
            CheckStatus::Warn,
            "lz4 not compiled in; tcp_lz4 sends raw bytes",
        );
    }
    let sample = vec![7u8; 4096];
    match compressor.compress(&sample) {
        Ok(chunk) => CheckResult::new(
            "compression",
            CheckStatus::Pass,
            format!("{}: 4096 -> {} bytes", compressor.name(), chunk.len()),
        ),
        Err(err) => CheckResult::new("compression", CheckStatus::Fail, err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doctor_output_has_overall_status() {
        let output = DoctorOutput {
            checks: vec![CheckResult::new("x", CheckStatus::Pass, "ok")],
            overall: "pass",
        };
        let json = serde_json::to_string(&output).expect("doctor output should serialize");
        assert!(json.contains("\"overall\":\"pass\""));
        assert!(json.contains("\"status\":\"pass\""));
    }

    #[cfg(unix)]
    #[test]
    fn shared_memory_check_passes_on_unix() {
        assert_eq!(shared_memory_check().status, CheckStatus::Pass);
    }
}
