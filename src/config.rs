use std::{
    env,
    ffi::OsStr,
    fs,
    path::{Component, Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use anyhow::Context as _;
use serde::Deserialize;

use crate::{
    content_path::ContentPathResolver,
    inventory::{DEFAULT_INVENTORY_DIR, InventoryRepository},
    proxy::ProxyOptions,
    throttle::{DEFAULT_FLUSH_INTERVAL, DEFAULT_RETRY_INTERVAL, ThrottleSettings},
};

/// Optional TOML configuration. Every section and key may be omitted.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub inventory: InventoryConfig,
    pub throttling: Option<ThrottlingConfig>,
    pub logging: Option<LoggingConfig>,
}

impl Config {
    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let toml =
            fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml_str(&toml).with_context(|| format!("load config {}", path.display()))
    }

    pub fn from_toml_str(toml: &str) -> anyhow::Result<Self> {
        toml.parse()
    }

    /// Proxy options with `~` expanded; `throttling` replaces the configured
    /// throttle when given.
    pub fn proxy_options(
        &self,
        throttling: Option<ThrottleSettings>,
    ) -> anyhow::Result<ProxyOptions> {
        let ca_dir = self
            .proxy
            .ca_dir
            .as_deref()
            .map(expand_tilde_path)
            .transpose()?;
        Ok(ProxyOptions {
            port: self.proxy.port.filter(|port| *port != 0),
            ca_dir,
            throttling: throttling
                .or_else(|| self.throttling.as_ref().map(ThrottlingConfig::settings)),
        })
    }

    pub fn inventory_repository(
        &self,
        dir_override: Option<&Path>,
    ) -> anyhow::Result<InventoryRepository> {
        let dir = match dir_override.or(self.inventory.dir.as_deref()) {
            Some(dir) => expand_tilde_path(dir)?,
            None => PathBuf::from(DEFAULT_INVENTORY_DIR),
        };
        let resolver = match self.inventory.ignore_params.as_ref() {
            Some(params) => ContentPathResolver::with_ignore_params(params),
            None => ContentPathResolver::from_env(),
        };
        Ok(InventoryRepository::new(dir).with_resolver(resolver))
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s).context("parse config TOML")
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    /// `0` or absent defers to `PORT`, then to an OS-assigned port.
    pub port: Option<u16>,
    pub ca_dir: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InventoryConfig {
    pub dir: Option<PathBuf>,
    pub ignore_params: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThrottlingConfig {
    pub mbps: f64,
    pub flush_interval_ms: Option<u64>,
    pub retry_interval_ms: Option<u64>,
}

impl ThrottlingConfig {
    pub fn settings(&self) -> ThrottleSettings {
        ThrottleSettings {
            mbps: self.mbps,
            flush_interval: self
                .flush_interval_ms
                .map_or(DEFAULT_FLUSH_INTERVAL, Duration::from_millis),
            retry_interval: self
                .retry_interval_ms
                .map_or(DEFAULT_RETRY_INTERVAL, Duration::from_millis),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub format: Option<LogFormat>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

fn expand_tilde_path(path: &Path) -> anyhow::Result<PathBuf> {
    let mut components = path.components();
    match components.next() {
        Some(Component::Normal(component)) if component == OsStr::new("~") => {
            let home = env::var_os("HOME").ok_or_else(|| {
                anyhow::anyhow!("cannot expand `~` in {}: HOME is not set", path.display())
            })?;
            let mut expanded = PathBuf::from(home);
            for component in components {
                expanded.push(component.as_os_str());
            }
            Ok(expanded)
        }
        _ => Ok(path.to_path_buf()),
    }
}

#[cfg(test)]
mod tests {
    use std::{path::Path, time::Duration};

    use super::{Config, LogFormat};

    #[test]
    fn empty_config_uses_defaults() {
        let config = Config::from_toml_str("").expect("empty config should parse");
        let options = config.proxy_options(None).unwrap();
        assert_eq!(options.port, None);
        assert_eq!(options.ca_dir, None);
        assert!(options.throttling.is_none());

        let repository = config.inventory_repository(None).unwrap();
        assert_eq!(repository.dir(), Path::new("inventory"));
    }

    #[test]
    fn full_config_parses_every_section() {
        let config = Config::from_toml_str(
            r#"
[proxy]
port = 8080
ca_dir = "/tmp/pagespeed-ca"

[inventory]
dir = "captures/home"
ignore_params = ["ts", "cb"]

[throttling]
mbps = 1.6
flush_interval_ms = 50

[logging]
level = "debug"
format = "pretty"
"#,
        )
        .expect("config should parse");

        let options = config.proxy_options(None).unwrap();
        assert_eq!(options.port, Some(8080));
        assert_eq!(options.ca_dir.as_deref(), Some(Path::new("/tmp/pagespeed-ca")));
        let throttling = options.throttling.expect("throttling configured");
        assert_eq!(throttling.mbps, 1.6);
        assert_eq!(throttling.flush_interval, Duration::from_millis(50));
        assert_eq!(throttling.retry_interval, Duration::from_millis(10));

        let repository = config.inventory_repository(None).unwrap();
        assert_eq!(repository.dir(), Path::new("captures/home"));
        let logging = config.logging.as_ref().unwrap();
        assert_eq!(logging.level.as_deref(), Some("debug"));
        assert_eq!(logging.format, Some(LogFormat::Pretty));
    }

    #[test]
    fn zero_port_defers_to_environment() {
        let config = Config::from_toml_str("[proxy]\nport = 0\n").unwrap();
        assert_eq!(config.proxy_options(None).unwrap().port, None);
    }

    #[test]
    fn explicit_throttle_and_inventory_dir_override_config() {
        let config = Config::from_toml_str(
            r#"
[inventory]
dir = "configured"

[throttling]
mbps = 10.0
"#,
        )
        .unwrap();

        let options = config
            .proxy_options(Some(crate::throttle::ThrottleSettings::from_mbps(1.6)))
            .unwrap();
        assert_eq!(options.throttling.unwrap().mbps, 1.6);
        let repository = config
            .inventory_repository(Some(Path::new("override")))
            .unwrap();
        assert_eq!(repository.dir(), Path::new("override"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = Config::from_toml_str("[proxy]\nlisten = \"127.0.0.1:0\"\n").unwrap_err();
        assert!(
            format!("{err:#}").contains("unknown field `listen`"),
            "unexpected error: {err:#}"
        );
    }

    #[test]
    fn from_path_reports_missing_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let missing = temp_dir.path().join("missing.toml");
        let err = Config::from_path(&missing).unwrap_err();
        assert!(err.to_string().contains("read config"), "unexpected error: {err}");
    }

    #[test]
    fn from_path_loads_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("pagespeed-quest.toml");
        std::fs::write(&path, "[logging]\nformat = \"json\"\n").unwrap();
        let config = Config::from_path(&path).unwrap();
        assert_eq!(
            config.logging.and_then(|logging| logging.format),
            Some(LogFormat::Json)
        );
    }
}
