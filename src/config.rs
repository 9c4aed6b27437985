use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::engine::{
    ControllerSettings, MonitorSettings, ReadinessCheck, RecoverySettings, StartupOptions,
};
use crate::machine::validate_checkpoint_name;

const ENV_PREFIX: &str = "WARDEN_";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Libvirt domain to watch.
    pub vm_name: String,
    pub snapshot_name: String,

    pub heartbeat_timeout: f64,
    pub heartbeat_check_interval: f64,
    /// Wait after a revert before heartbeats are expected again.
    pub settle_delay: f64,

    /// Any single `virsh` call taking longer than this is killed.
    pub virsh_timeout: f64,
    pub guest_agent_check: bool,
    pub guest_agent_timeout: f64,
    pub startup_wait_interval: f64,
    pub startup_max_attempts: u32,

    pub auto_revert_enabled: bool,
    pub revert_on_startup: bool,
    pub manual_start_reverts: bool,

    pub api_host: String,
    pub api_port: u16,
    pub log_level: String,

    pub hooks_dir: String,
    /// Guest signal events that count as a guest-reported failure.
    pub error_events: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            vm_name: String::new(),
            snapshot_name: "ready".to_string(),
            heartbeat_timeout: 15.0,
            heartbeat_check_interval: 0.5,
            settle_delay: 10.0,
            virsh_timeout: 30.0,
            guest_agent_check: false,
            guest_agent_timeout: 5.0,
            startup_wait_interval: 10.0,
            startup_max_attempts: 30,
            auto_revert_enabled: true,
            revert_on_startup: true,
            manual_start_reverts: true,
            api_host: "0.0.0.0".to_string(),
            api_port: 8000,
            log_level: "info".to_string(),
            hooks_dir: "hooks".to_string(),
            error_events: vec!["guest-error".to_string()],
        }
    }
}

impl Config {
    /// Reads the file (if any) and applies `WARDEN_*` overrides. Call
    /// [`validate`](Self::validate) once the command line has had its say.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let config = match extension.as_str() {
            "yaml" | "yml" => serde_yaml::from_str(&contents)
                .with_context(|| format!("Invalid YAML in {}", path.display()))?,
            "toml" => toml::from_str(&contents)
                .with_context(|| format!("Invalid TOML in {}", path.display()))?,
            other => bail!("Unsupported config format '{}' for {}", other, path.display()),
        };
        Ok(config)
    }

    /// Overrides fields from `WARDEN_<FIELD>` variables found through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        if let Some(v) = var("VM_NAME") {
            self.vm_name = v;
        }
        if let Some(v) = var("SNAPSHOT_NAME") {
            self.snapshot_name = v;
        }
        override_parsed(&mut self.heartbeat_timeout, &var, "HEARTBEAT_TIMEOUT")?;
        override_parsed(&mut self.heartbeat_check_interval, &var, "HEARTBEAT_CHECK_INTERVAL")?;
        override_parsed(&mut self.settle_delay, &var, "SETTLE_DELAY")?;
        override_parsed(&mut self.virsh_timeout, &var, "VIRSH_TIMEOUT")?;
        override_parsed(&mut self.guest_agent_check, &var, "GUEST_AGENT_CHECK")?;
        override_parsed(&mut self.guest_agent_timeout, &var, "GUEST_AGENT_TIMEOUT")?;
        override_parsed(&mut self.startup_wait_interval, &var, "STARTUP_WAIT_INTERVAL")?;
        override_parsed(&mut self.startup_max_attempts, &var, "STARTUP_MAX_ATTEMPTS")?;
        override_parsed(&mut self.auto_revert_enabled, &var, "AUTO_REVERT_ENABLED")?;
        override_parsed(&mut self.revert_on_startup, &var, "REVERT_ON_STARTUP")?;
        override_parsed(&mut self.manual_start_reverts, &var, "MANUAL_START_REVERTS")?;
        if let Some(v) = var("API_HOST") {
            self.api_host = v;
        }
        override_parsed(&mut self.api_port, &var, "API_PORT")?;
        if let Some(v) = var("LOG_LEVEL") {
            self.log_level = v;
        }
        if let Some(v) = var("HOOKS_DIR") {
            self.hooks_dir = v;
        }
        if let Some(v) = var("ERROR_EVENTS") {
            self.error_events = v
                .split(',')
                .map(str::trim)
                .filter(|event| !event.is_empty())
                .map(str::to_string)
                .collect();
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.vm_name.trim().is_empty() {
            bail!("vm_name is required");
        }
        validate_checkpoint_name(&self.snapshot_name)
            .with_context(|| format!("snapshot_name '{}' is not usable", self.snapshot_name))?;

        for (name, value) in [
            ("heartbeat_timeout", self.heartbeat_timeout),
            ("heartbeat_check_interval", self.heartbeat_check_interval),
            ("virsh_timeout", self.virsh_timeout),
            ("guest_agent_timeout", self.guest_agent_timeout),
            ("startup_wait_interval", self.startup_wait_interval),
        ] {
            if !(value.is_finite() && value > 0.0) {
                bail!("{} must be greater than 0 (got {})", name, value);
            }
        }
        if !(self.settle_delay.is_finite() && self.settle_delay >= 0.0) {
            bail!("settle_delay must not be negative (got {})", self.settle_delay);
        }
        if self.startup_max_attempts == 0 {
            bail!("startup_max_attempts must be at least 1");
        }
        if self.api_port == 0 {
            bail!("api_port must be between 1 and 65535");
        }
        Ok(())
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        let readiness = self.guest_agent_check.then(|| ReadinessCheck {
            interval: Duration::from_secs_f64(self.startup_wait_interval),
            max_attempts: self.startup_max_attempts,
        });

        ControllerSettings {
            heartbeat_timeout: self.heartbeat_timeout,
            recovery: RecoverySettings {
                settle_delay: Duration::from_secs_f64(self.settle_delay),
                readiness,
            },
            monitor: MonitorSettings {
                check_interval: Duration::from_secs_f64(self.heartbeat_check_interval),
            },
            manual_start_reverts: self.manual_start_reverts,
        }
    }

    pub fn startup_options(&self) -> StartupOptions {
        StartupOptions {
            revert_on_startup: self.revert_on_startup,
            monitoring_enabled: self.auto_revert_enabled,
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.api_host, self.api_port)
    }

    /// Key values for the startup log.
    pub fn summary(&self) -> Vec<(&'static str, String)> {
        vec![
            ("VM", self.vm_name.clone()),
            ("Snapshot", self.snapshot_name.clone()),
            ("Heartbeat timeout", format!("{}s", self.heartbeat_timeout)),
            ("Check interval", format!("{}s", self.heartbeat_check_interval)),
            ("Settle delay", format!("{}s", self.settle_delay)),
            ("virsh timeout", format!("{}s", self.virsh_timeout)),
            ("Auto revert", self.auto_revert_enabled.to_string()),
            ("Revert on startup", self.revert_on_startup.to_string()),
            ("Guest agent check", self.guest_agent_check.to_string()),
            ("API", self.bind_address()),
        ]
    }
}

fn override_parsed<T>(
    field: &mut T,
    var: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<()>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = var(name) {
        *field = raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid {}{}='{}': {}", ENV_PREFIX, name, raw, e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn write_config(suffix: &str, contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.snapshot_name, "ready");
        assert_eq!(config.heartbeat_timeout, 15.0);
        assert_eq!(config.api_port, 8000);
        assert_eq!(config.error_events, vec!["guest-error".to_string()]);
        // vm_name has no sensible default.
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_yaml() {
        let file = write_config(
            ".yaml",
            "vm_name: kiosk\nheartbeat_timeout: 30\nauto_revert_enabled: false\n",
        );
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.vm_name, "kiosk");
        assert_eq!(config.heartbeat_timeout, 30.0);
        assert!(!config.auto_revert_enabled);
        assert_eq!(config.snapshot_name, "ready");
        config.validate().unwrap();
    }

    #[test]
    fn test_load_toml() {
        let file = write_config(
            ".toml",
            "vm_name = \"kiosk\"\nsnapshot_name = \"clean-boot\"\napi_port = 9000\n",
        );
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.snapshot_name, "clean-boot");
        assert_eq!(config.bind_address(), "0.0.0.0:9000");
    }

    #[test]
    fn test_unknown_extension_is_rejected() {
        let file = write_config(".ini", "vm_name=kiosk");
        assert!(Config::from_file(file.path()).is_err());
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("WARDEN_VM_NAME", "lobby"),
            ("WARDEN_HEARTBEAT_TIMEOUT", "20.5"),
            ("WARDEN_GUEST_AGENT_CHECK", "true"),
            ("WARDEN_VIRSH_TIMEOUT", "12"),
            ("WARDEN_ERROR_EVENTS", "crash, panic"),
        ]);
        let mut config = Config::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.vm_name, "lobby");
        assert_eq!(config.heartbeat_timeout, 20.5);
        assert!(config.guest_agent_check);
        assert_eq!(config.virsh_timeout, 12.0);
        assert_eq!(config.error_events, vec!["crash", "panic"]);
    }

    #[test]
    fn test_bad_override_is_an_error() {
        let mut config = Config::default();
        let err = config
            .apply_overrides(|key| (key == "WARDEN_API_PORT").then(|| "eighty".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("WARDEN_API_PORT"));
    }

    #[test]
    fn test_validation() {
        let mut config = Config {
            vm_name: "kiosk".to_string(),
            ..Config::default()
        };
        config.validate().unwrap();

        config.heartbeat_timeout = 0.0;
        assert!(config.validate().is_err());

        config.heartbeat_timeout = 15.0;
        config.virsh_timeout = -1.0;
        assert!(config.validate().is_err());

        config.virsh_timeout = 30.0;
        config.snapshot_name = "bad name".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_controller_settings() {
        let config = Config {
            vm_name: "kiosk".to_string(),
            guest_agent_check: true,
            startup_max_attempts: 3,
            ..Config::default()
        };
        let settings = config.controller_settings();
        assert_eq!(settings.recovery.settle_delay, Duration::from_secs(10));
        assert_eq!(settings.monitor.check_interval, Duration::from_millis(500));
        assert_eq!(settings.recovery.readiness.unwrap().max_attempts, 3);
    }
}
