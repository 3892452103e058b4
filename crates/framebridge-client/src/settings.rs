//! Environment-driven settings for a [`BridgeContext`](crate::context::BridgeContext).

use std::env;
use std::path::PathBuf;

use framebridge_protocol::DEFAULT_PORT;
use serde::Serialize;

use crate::error::{ClientError, Result};
use crate::sender::DEFAULT_RING_SLOTS;

pub const ENV_PORT: &str = "FRAMEBRIDGE_PORT";
pub const ENV_ENABLE: &str = "FRAMEBRIDGE_ENABLE";
pub const ENV_CONNECT_NOW: &str = "FRAMEBRIDGE_CONNECT_NOW";
pub const ENV_DUMP: &str = "FRAMEBRIDGE_DUMP";
pub const ENV_DUMP_DIR: &str = "FRAMEBRIDGE_DUMP_DIR";
pub const ENV_DUMP_MAX_FRAMES: &str = "FRAMEBRIDGE_DUMP_MAX_FRAMES";

const DEFAULT_DUMP_FRAMES: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DumpSettings {
    pub enabled: bool,
    /// Root for session directories; `None` uses the temp dir.
    pub dir: Option<PathBuf>,
    pub max_frames: usize,
}

impl Default for DumpSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: None,
            max_frames: DEFAULT_DUMP_FRAMES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BridgeSettings {
    /// Kept wide so out-of-range values reach `configure` and are reported.
    pub port: u32,
    pub enable: bool,
    /// Start connecting as soon as the context starts.
    pub connect_now: bool,
    pub ring_slots: usize,
    pub dump: DumpSettings,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            port: u32::from(DEFAULT_PORT),
            enable: false,
            connect_now: false,
            ring_slots: DEFAULT_RING_SLOTS,
            dump: DumpSettings::default(),
        }
    }
}

impl BridgeSettings {
    /// Defaults overridden by `FRAMEBRIDGE_*` variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(raw) = get(ENV_PORT) {
            settings.port = raw
                .parse()
                .map_err(|_| invalid(ENV_PORT, &raw, "an integer port"))?;
        }
        if let Some(raw) = get(ENV_ENABLE) {
            settings.enable = parse_bool(ENV_ENABLE, &raw)?;
        }
        if let Some(raw) = get(ENV_CONNECT_NOW) {
            settings.connect_now = parse_bool(ENV_CONNECT_NOW, &raw)?;
        }
        if let Some(raw) = get(ENV_DUMP) {
            settings.dump.enabled = parse_bool(ENV_DUMP, &raw)?;
        }
        if let Some(raw) = get(ENV_DUMP_DIR) {
            settings.dump.dir = Some(PathBuf::from(raw));
        }
        if let Some(raw) = get(ENV_DUMP_MAX_FRAMES) {
            settings.dump.max_frames = raw
                .parse()
                .map_err(|_| invalid(ENV_DUMP_MAX_FRAMES, &raw, "a frame count"))?;
        }
        Ok(settings)
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, raw, "a boolean")),
    }
}

fn invalid(key: &str, raw: &str, expected: &str) -> ClientError {
    ClientError::InvalidArgument(format!("{key}={raw:?} is not {expected}"))
}
