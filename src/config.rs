//! Monitor configuration
//!
//! Read once at startup from a JSON file. Every section and field has a
//! default, so an empty object (or no file at all) gives a working setup
//! against a local Icecast server.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::audio::levels::MAX_READ_SECONDS;
use crate::audio::StreamParams;
use crate::models::StationTarget;
use crate::player::{OwnershipMode, SupervisorConfig};

const APP_DIR: &str = "stream-monitor";
const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub station: StationSettings,
    pub player: PlayerSettings,
    pub capture: CaptureSettings,
    pub icecast: IcecastSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StationSettings {
    #[serde(default = "default_station_name")]
    pub name: String,

    /// Explicit stream address; derived from the icecast section when absent
    #[serde(default)]
    pub stream_uri: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PlayerSettings {
    #[serde(default = "default_executable")]
    pub executable: String,

    #[serde(default = "default_cache_kb")]
    pub cache_kb: u32,

    #[serde(default = "default_extra_args")]
    pub extra_args: Vec<String>,

    #[serde(default = "default_max_runtime_secs")]
    pub max_runtime_secs: u64,

    #[serde(default)]
    pub ownership: OwnershipMode,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CaptureSettings {
    /// Substring of the capture device name
    #[serde(default)]
    pub device: String,

    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    #[serde(default = "default_channels")]
    pub channels: u16,

    #[serde(default = "default_buffer_frames")]
    pub buffer_frames: u32,

    #[serde(default = "default_read_seconds")]
    pub read_seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct IcecastSettings {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default = "default_server")]
    pub server: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_mount")]
    pub mount: String,

    #[serde(default = "default_user")]
    pub user: String,

    #[serde(default = "default_password")]
    pub password: String,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Stats older than this are flagged on screen
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct LoggingSettings {
    #[serde(default)]
    pub debug: bool,

    /// Append log lines here instead of stderr, which shares the display terminal
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Config {
    /// `$XDG_CONFIG_HOME/stream-monitor/config.json`, if a config dir exists
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_DIR).join(CONFIG_FILE))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` when given, otherwise the default path if that file exists,
    /// otherwise built-in defaults
    ///
    /// Also returns the file that was read, `None` for defaults. Runs before
    /// logging is set up, so the caller reports which one was used.
    pub fn resolve(path: Option<&Path>) -> Result<(Self, Option<PathBuf>), ConfigError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match Self::default_path() {
                Some(path) if path.exists() => path,
                _ => return Ok((Self::default(), None)),
            },
        };
        let config = Self::load(&path)?;
        Ok((config, Some(path)))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let capture = &self.capture;
        if capture.sample_rate == 0 {
            return Err(ConfigError::Invalid("capture.sample_rate must be positive".into()));
        }
        if capture.channels == 0 || capture.channels > 2 {
            return Err(ConfigError::Invalid(format!(
                "capture.channels must be 1 or 2, got {}",
                capture.channels
            )));
        }
        if capture.buffer_frames == 0 {
            return Err(ConfigError::Invalid("capture.buffer_frames must be positive".into()));
        }
        if !(capture.read_seconds > 0.0 && capture.read_seconds <= MAX_READ_SECONDS) {
            return Err(ConfigError::Invalid(format!(
                "capture.read_seconds must be in (0, {}], got {}",
                MAX_READ_SECONDS, capture.read_seconds
            )));
        }
        if self.player.executable.trim().is_empty() {
            return Err(ConfigError::Invalid("player.executable is empty".into()));
        }
        Ok(())
    }

    pub fn station_target(&self) -> StationTarget {
        let uri = self.station.stream_uri.clone().unwrap_or_else(|| {
            format!(
                "http://{}:{}{}",
                self.icecast.server,
                self.icecast.port,
                self.icecast.mount_path()
            )
        });
        StationTarget::new(self.station.name.clone(), uri)
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            executable: self.player.executable.clone(),
            max_runtime: Duration::from_secs(self.player.max_runtime_secs),
            ..SupervisorConfig::default()
        }
    }

    pub fn stream_params(&self) -> StreamParams {
        StreamParams {
            sample_rate: self.capture.sample_rate,
            channels: self.capture.channels,
            buffer_frames: self.capture.buffer_frames,
            device: self.capture.device.clone(),
        }
    }
}

impl IcecastSettings {
    /// Mount with exactly one leading slash
    pub fn mount_path(&self) -> String {
        format!("/{}", self.mount.trim_start_matches('/'))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

impl Default for StationSettings {
    fn default() -> Self {
        Self {
            name: default_station_name(),
            stream_uri: None,
        }
    }
}

impl Default for PlayerSettings {
    fn default() -> Self {
        Self {
            executable: default_executable(),
            cache_kb: default_cache_kb(),
            extra_args: default_extra_args(),
            max_runtime_secs: default_max_runtime_secs(),
            ownership: OwnershipMode::default(),
        }
    }
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            device: String::new(),
            sample_rate: default_sample_rate(),
            channels: default_channels(),
            buffer_frames: default_buffer_frames(),
            read_seconds: default_read_seconds(),
        }
    }
}

impl Default for IcecastSettings {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            server: default_server(),
            port: default_port(),
            mount: default_mount(),
            user: default_user(),
            password: default_password(),
            timeout_secs: default_timeout_secs(),
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

// Default values
fn default_station_name() -> String {
    "Live Stream".to_string()
}

fn default_executable() -> String {
    "mplayer".to_string()
}

fn default_cache_kb() -> u32 {
    320
}

fn default_extra_args() -> Vec<String> {
    vec!["-ao".to_string(), "alsa".to_string()]
}

fn default_max_runtime_secs() -> u64 {
    3600
}

fn default_sample_rate() -> u32 {
    44100
}

fn default_channels() -> u16 {
    2
}

fn default_buffer_frames() -> u32 {
    4096
}

fn default_read_seconds() -> f64 {
    0.2
}

fn default_enabled() -> bool {
    true
}

fn default_server() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_mount() -> String {
    "live".to_string()
}

fn default_user() -> String {
    "admin".to_string()
}

fn default_password() -> String {
    "hackme".to_string()
}

fn default_timeout_secs() -> u64 {
    2
}

fn default_stale_after_secs() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(json: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_empty_object_gives_defaults() {
        let file = write_config("{}");
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.player.cache_kb, 320);
        assert_eq!(config.player.extra_args, vec!["-ao", "alsa"]);
        assert_eq!(config.player.ownership, OwnershipMode::Tag);
        assert_eq!(config.capture.buffer_frames, 4096);
        assert!(config.icecast.enabled);
    }

    #[test]
    fn test_partial_sections_keep_defaults() {
        let file = write_config(
            r#"{
                "station": {"name": "KXYZ"},
                "player": {"cache_kb": 512, "ownership": "name"},
                "capture": {"device": "Loopback", "channels": 1},
                "icecast": {"server": "radio.example.org", "mount": "/studio"}
            }"#,
        );
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.player.cache_kb, 512);
        assert_eq!(config.player.executable, "mplayer");
        assert_eq!(config.player.ownership, OwnershipMode::Name);
        assert_eq!(config.capture.channels, 1);
        assert_eq!(config.capture.sample_rate, 44100);
        assert_eq!(config.icecast.port, 8000);

        let target = config.station_target();
        assert_eq!(target.name, "KXYZ");
        assert_eq!(target.stream_uri, "http://radio.example.org:8000/studio");
    }

    #[test]
    fn test_explicit_stream_uri_wins() {
        let file = write_config(r#"{"station": {"stream_uri": "http://relay:9000/hq"}}"#);
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.station_target().stream_uri, "http://relay:9000/hq");
    }

    #[test]
    fn test_invalid_values_rejected() {
        for json in [
            r#"{"capture": {"sample_rate": 0}}"#,
            r#"{"capture": {"channels": 0}}"#,
            r#"{"capture": {"channels": 6}}"#,
            r#"{"capture": {"buffer_frames": 0}}"#,
            r#"{"capture": {"read_seconds": 0.0}}"#,
            r#"{"capture": {"read_seconds": -1.5}}"#,
            r#"{"capture": {"read_seconds": 10.5}}"#,
            r#"{"capture": {"read_seconds": 5e18}}"#,
            r#"{"player": {"executable": "  "}}"#,
        ] {
            let file = write_config(json);
            assert!(
                matches!(Config::load(file.path()), Err(ConfigError::Invalid(_))),
                "{json} should be rejected"
            );
        }
    }

    #[test]
    fn test_malformed_and_missing_files() {
        let file = write_config("{ not json");
        assert!(matches!(
            Config::load(file.path()),
            Err(ConfigError::Parse { .. })
        ));

        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Config::load(&dir.path().join("absent.json")),
            Err(ConfigError::Read { .. })
        ));
        assert!(Config::resolve(Some(&dir.path().join("absent.json"))).is_err());
    }

    #[test]
    fn test_log_file_setting() {
        let file = write_config(r#"{"logging": {"file": "/var/log/monitor.log"}}"#);
        let config = Config::load(file.path()).unwrap();
        assert!(!config.logging.debug);
        assert_eq!(
            config.logging.file.as_deref(),
            Some(Path::new("/var/log/monitor.log"))
        );
        assert!(Config::default().logging.file.is_none());
    }

    #[test]
    fn test_resolve_reports_source() {
        let file = write_config(r#"{"station": {"name": "KXYZ"}}"#);
        let (config, source) = Config::resolve(Some(file.path())).unwrap();
        assert_eq!(config.station.name, "KXYZ");
        assert_eq!(source.as_deref(), Some(file.path()));
    }

    #[test]
    fn test_derived_settings() {
        let mut config = Config::default();
        config.player.max_runtime_secs = 600;
        config.capture.device = "Monitor".into();

        let supervisor = config.supervisor_config();
        assert_eq!(supervisor.max_runtime, Duration::from_secs(600));
        assert_eq!(supervisor.spin_up, Duration::from_secs(2));

        let params = config.stream_params();
        assert_eq!(params.device, "Monitor");
        assert_eq!(params.sample_rate, 44100);

        assert_eq!(config.icecast.mount_path(), "/live");
        assert_eq!(config.station_target().stream_uri, "http://127.0.0.1:8000/live");
    }
}
