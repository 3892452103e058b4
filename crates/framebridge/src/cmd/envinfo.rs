use std::collections::BTreeMap;

use framebridge_client::settings::{
    ENV_CONNECT_NOW, ENV_DUMP, ENV_DUMP_DIR, ENV_DUMP_MAX_FRAMES, ENV_ENABLE, ENV_PORT,
};
use framebridge_client::BridgeSettings;
use framebridge_protocol::{
    DEFAULT_CAPABILITIES, DEFAULT_PORT, MAX_BINARY_FRAME_BYTES, MAX_CONTROL_MESSAGE_BYTES,
    PROTOCOL_MAGIC, PROTOCOL_VERSION,
};
use serde::Serialize;

use crate::cmd::version::active_features;
use crate::cmd::EnvinfoArgs;
use crate::exit::{CliResult, SUCCESS};
use crate::output::{print_json, OutputFormat};

#[derive(Serialize)]
struct PlatformInfo {
    os: String,
    arch: String,
}

#[derive(Serialize)]
struct ProtocolInfo {
    magic: &'static str,
    version: i64,
    default_port: u16,
    capabilities: Vec<&'static str>,
    max_control_bytes: usize,
    max_binary_bytes: usize,
}

#[derive(Serialize)]
struct EnvInfoOutput {
    version: String,
    target: String,
    platform: PlatformInfo,
    features: Vec<&'static str>,
    protocol: ProtocolInfo,
    environment: BTreeMap<&'static str, Option<String>>,
    /// Effective settings, or why the environment could not be parsed.
    settings: Result<BridgeSettings, String>,
}

pub fn run(_args: EnvinfoArgs, format: OutputFormat) -> CliResult<i32> {
    let environment = [
        ENV_PORT,
        ENV_ENABLE,
        ENV_CONNECT_NOW,
        ENV_DUMP,
        ENV_DUMP_DIR,
        ENV_DUMP_MAX_FRAMES,
    ]
    .into_iter()
    .map(|key| (key, std::env::var(key).ok()))
    .collect();

    let output = EnvInfoOutput {
        version: env!("CARGO_PKG_VERSION").to_string(),
        target: target_triple(),
        platform: PlatformInfo {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        },
        features: active_features(),
        protocol: ProtocolInfo {
            magic: PROTOCOL_MAGIC,
            version: PROTOCOL_VERSION,
            default_port: DEFAULT_PORT,
            capabilities: DEFAULT_CAPABILITIES.to_vec(),
            max_control_bytes: MAX_CONTROL_MESSAGE_BYTES,
            max_binary_bytes: MAX_BINARY_FRAME_BYTES,
        },
        environment,
        settings: BridgeSettings::from_env().map_err(|err| err.to_string()),
    };

    print_envinfo(&output, format);
    Ok(SUCCESS)
}

pub(crate) fn target_triple() -> String {
    if let Some(target) = option_env!("FRAMEBRIDGE_BUILD_TARGET") {
        return target.to_string();
    }

    match (std::env::consts::ARCH, std::env::consts::OS) {
        ("aarch64", "macos") => "aarch64-apple-darwin".to_string(),
        ("x86_64", "macos") => "x86_64-apple-darwin".to_string(),
        ("aarch64", "linux") => "aarch64-unknown-linux-gnu".to_string(),
        ("x86_64", "linux") => "x86_64-unknown-linux-gnu".to_string(),
        (arch, os) => format!("{arch}-unknown-{os}"),
    }
}

fn print_envinfo(output: &EnvInfoOutput, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(output),
        OutputFormat::Table | OutputFormat::Pretty => {
            println!("framebridge environment\n");
            println!("  Version:    {}", output.version);
            println!("  Target:     {}", output.target);
            println!(
                "  Platform:   {} ({})",
                output.platform.os, output.platform.arch
            );
            println!("  Features:   {}", output.features.join(", "));
            println!(
                "  Protocol:   {} v{} (default port {})",
                output.protocol.magic, output.protocol.version, output.protocol.default_port
            );
            println!("\n  Environment:");
            for (k, v) in &output.environment {
                println!("    {:<28} {}", k, v.as_deref().unwrap_or("(not set)"));
            }
            match &output.settings {
                Ok(settings) => println!(
                    "\n  Settings:   port={} enable={} connect_now={} dump={}",
                    settings.port, settings.enable, settings.connect_now, settings.dump.enabled
                ),
                Err(err) => println!("\n  Settings:   invalid ({err})"),
            }
        }
        OutputFormat::Raw => println!("{}", output.version),
    }
}
