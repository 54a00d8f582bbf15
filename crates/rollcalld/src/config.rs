use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file read before environment overrides, unless `ROLLCALL_CONFIG` names another.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/rollcall/rollcall.toml";

/// Daemon configuration: optional TOML file, then `ROLLCALL_*` environment overrides.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Directory containing `face_detector.onnx` and `face_descriptor.onnx`.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Euclidean distance below which a face matches.
    pub match_threshold: f32,
    pub scan_interval_ms: u64,
    /// Per-student client-side cooldown.
    pub cooldown_secs: u64,
    /// Window in which the attendance log rejects a repeat mark.
    pub recent_window_secs: u64,
    pub write_timeout_secs: u64,
    pub frames_per_enroll: usize,
    /// Serve on the system bus instead of the session bus.
    pub system_bus: bool,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = data_dir();
        Self {
            camera_device: "/dev/video0".to_string(),
            model_dir: data_dir.join("models"),
            db_path: data_dir.join("rollcall.db"),
            match_threshold: rollcall_core::DEFAULT_MATCH_THRESHOLD,
            scan_interval_ms: 2000,
            cooldown_secs: 300,
            recent_window_secs: 300,
            write_timeout_secs: 5,
            frames_per_enroll: 5,
            system_bus: false,
        }
    }
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

impl Config {
    /// Load the config file (if present) and apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = std::env::var("ROLLCALL_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        let mut config = Self::from_file(&path)?;
        config.apply_env_with(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML config file; a missing file yields the defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config at {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Override fields from variables returned by `get`. Unparseable values are ignored.
    pub fn apply_env_with(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(v) = get("ROLLCALL_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = get("ROLLCALL_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = get("ROLLCALL_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        override_parsed(&get, "ROLLCALL_MATCH_THRESHOLD", &mut self.match_threshold);
        override_parsed(&get, "ROLLCALL_SCAN_INTERVAL_MS", &mut self.scan_interval_ms);
        override_parsed(&get, "ROLLCALL_COOLDOWN_SECS", &mut self.cooldown_secs);
        override_parsed(&get, "ROLLCALL_RECENT_WINDOW_SECS", &mut self.recent_window_secs);
        override_parsed(&get, "ROLLCALL_WRITE_TIMEOUT_SECS", &mut self.write_timeout_secs);
        override_parsed(&get, "ROLLCALL_FRAMES_PER_ENROLL", &mut self.frames_per_enroll);
        if let Some(v) = get("ROLLCALL_SYSTEM_BUS") {
            self.system_bus = v == "1" || v.eq_ignore_ascii_case("true");
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.match_threshold.is_finite() || self.match_threshold <= 0.0 {
            anyhow::bail!("match_threshold must be a positive number, got {}", self.match_threshold);
        }
        if self.scan_interval_ms == 0 {
            anyhow::bail!("scan_interval_ms must be greater than zero");
        }
        if self.frames_per_enroll == 0 {
            anyhow::bail!("frames_per_enroll must be greater than zero");
        }
        Ok(())
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cooldown_secs as i64)
    }

    pub fn recent_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.recent_window_secs as i64)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}

fn override_parsed<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    field: &mut T,
) {
    if let Some(raw) = get(key) {
        match raw.trim().parse() {
            Ok(value) => *field = value,
            Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable config override"),
        }
    }
}
