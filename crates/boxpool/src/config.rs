//! Pool configuration.
//!
//! Defaults match a five-slot pool on ports 8081..=8085. Every value can be
//! overridden through `BOXPOOL_*` environment variables (see [`PoolConfig::from_env`]).

use std::net::UdpSocket;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::slot::SlotId;

pub(crate) const ENV_PREFIX: &str = "BOXPOOL_";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?} ({reason})")]
    Invalid {
        var: String,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(var: &str, value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            var: format!("{ENV_PREFIX}{var}"),
            value: value.into(),
            reason: reason.into(),
        }
    }
}

/// Ping cadence and acknowledgement timeout for liveness channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    pub ping_interval: Duration,
    /// Measured from the last pong, or from channel open if none arrived yet.
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(15),
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub pool_size: u32,
    /// Slot `n` listens on `base_port + n`.
    pub base_port: u16,
    pub artifacts_root: PathBuf,
    pub database_path: PathBuf,
    pub launcher: PathBuf,
    /// Run as `<cmd> --instance-id <id>` on every reclaim.
    pub cleanup_command: Option<PathBuf>,
    /// Host used in access URLs. Detected from the default route when unset.
    pub public_host: Option<String>,
    pub allowed_extensions: Vec<String>,
    pub artifact_subdir: String,
    pub artifact_file_name: String,
    /// Entries of `artifacts_root` the sweep never touches.
    pub excluded_entries: Vec<String>,
    pub heartbeat: HeartbeatConfig,
    /// Reclaim an allocation that never opened a liveness channel. `None` disables.
    pub liveness_grace: Option<Duration>,
    pub launch_grace: Duration,
    pub stop_grace: Duration,
    pub sweep_interval: Duration,
    pub max_artifact_age: Duration,
    pub max_upload_bytes: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 5,
            base_port: 8080,
            artifacts_root: PathBuf::from("objectbox"),
            database_path: PathBuf::from("data/objectbox.db"),
            launcher: PathBuf::from("objectbox/objectbox-admin.sh"),
            cleanup_command: None,
            public_host: None,
            allowed_extensions: vec!["mdb".to_string()],
            artifact_subdir: "objectbox".to_string(),
            artifact_file_name: "data.mdb".to_string(),
            excluded_entries: vec!["objectbox-admin.sh".to_string(), "nginx".to_string()],
            heartbeat: HeartbeatConfig::default(),
            liveness_grace: Some(Duration::from_secs(30)),
            launch_grace: Duration::from_secs(5),
            stop_grace: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(60),
            max_artifact_age: Duration::from_secs(60 * 60),
            max_upload_bytes: 512 * 1024 * 1024,
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `BOXPOOL_*` environment variables on top of the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(format!("{ENV_PREFIX}{name}")).ok())
    }

    /// Build from an arbitrary lookup (unprefixed variable name -> value).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = parse_var(&lookup, "POOL_SIZE")? {
            config.pool_size = v;
        }
        if let Some(v) = parse_var(&lookup, "BASE_PORT")? {
            config.base_port = v;
        }
        if let Some(v) = lookup("ARTIFACTS_DIR") {
            config.artifacts_root = PathBuf::from(v);
        }
        if let Some(v) = lookup("DATABASE") {
            config.database_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("LAUNCHER") {
            config.launcher = PathBuf::from(v);
        }
        if let Some(v) = lookup("CLEANUP_COMMAND").filter(|v| !v.trim().is_empty()) {
            config.cleanup_command = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("PUBLIC_HOST").filter(|v| !v.trim().is_empty()) {
            config.public_host = Some(v);
        }
        if let Some(v) = lookup("ALLOWED_EXTENSIONS") {
            config.allowed_extensions = v
                .split(',')
                .map(|ext| ext.trim().trim_start_matches('.').to_ascii_lowercase())
                .filter(|ext| !ext.is_empty())
                .collect();
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "PING_INTERVAL_SECS")? {
            config.heartbeat.ping_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "HEARTBEAT_TIMEOUT_SECS")? {
            config.heartbeat.timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "LIVENESS_GRACE_SECS")? {
            config.liveness_grace = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(millis) = parse_var::<u64>(&lookup, "LAUNCH_GRACE_MILLIS")? {
            config.launch_grace = Duration::from_millis(millis);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "STOP_GRACE_SECS")? {
            config.stop_grace = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "SWEEP_INTERVAL_SECS")? {
            config.sweep_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "MAX_ARTIFACT_AGE_SECS")? {
            config.max_artifact_age = Duration::from_secs(secs);
        }
        if let Some(v) = parse_var(&lookup, "MAX_UPLOAD_BYTES")? {
            config.max_upload_bytes = v;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_size == 0 {
            return Err(ConfigError::invalid("POOL_SIZE", "0", "pool needs at least one slot"));
        }
        if u32::from(self.base_port) + self.pool_size > u32::from(u16::MAX) {
            return Err(ConfigError::invalid(
                "BASE_PORT",
                self.base_port.to_string(),
                format!("base port + {} slots exceeds 65535", self.pool_size),
            ));
        }
        if self.heartbeat.ping_interval.is_zero() {
            return Err(ConfigError::invalid("PING_INTERVAL_SECS", "0", "must be positive"));
        }
        if self.heartbeat.timeout.is_zero() {
            return Err(ConfigError::invalid("HEARTBEAT_TIMEOUT_SECS", "0", "must be positive"));
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::invalid("SWEEP_INTERVAL_SECS", "0", "must be positive"));
        }
        if self.allowed_extensions.is_empty() {
            return Err(ConfigError::invalid(
                "ALLOWED_EXTENSIONS",
                "",
                "at least one extension is required",
            ));
        }
        Ok(())
    }

    pub fn with_pool_size(mut self, n: u32) -> Self {
        self.pool_size = n;
        self
    }

    pub fn with_base_port(mut self, port: u16) -> Self {
        self.base_port = port;
        self
    }

    pub fn with_artifacts_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.artifacts_root = root.into();
        self
    }

    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = path.into();
        self
    }

    pub fn with_launcher(mut self, launcher: impl Into<PathBuf>) -> Self {
        self.launcher = launcher.into();
        self
    }

    pub fn with_cleanup_command(mut self, command: impl Into<PathBuf>) -> Self {
        self.cleanup_command = Some(command.into());
        self
    }

    pub fn with_public_host(mut self, host: impl Into<String>) -> Self {
        self.public_host = Some(host.into());
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn with_liveness_grace(mut self, grace: Option<Duration>) -> Self {
        self.liveness_grace = grace;
        self
    }

    pub fn with_launch_grace(mut self, grace: Duration) -> Self {
        self.launch_grace = grace;
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn with_max_artifact_age(mut self, age: Duration) -> Self {
        self.max_artifact_age = age;
        self
    }

    pub fn slot_ids(&self) -> impl Iterator<Item = SlotId> + use<> {
        (1..=self.pool_size).map(SlotId::new)
    }

    /// Deterministic port of a slot, `None` if the id is outside the pool.
    pub fn port_for(&self, id: SlotId) -> Option<u16> {
        if id.get() == 0 || id.get() > self.pool_size {
            return None;
        }
        u16::try_from(u32::from(self.base_port) + id.get()).ok()
    }

    /// Extension gate for uploaded artifacts (case-insensitive).
    pub fn accepts_file_name(&self, file_name: &str) -> bool {
        let Some((stem, ext)) = file_name.rsplit_once('.') else {
            return false;
        };
        !stem.is_empty()
            && self
                .allowed_extensions
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(ext))
    }

    /// Host placed in access URLs.
    pub fn advertised_host(&self) -> String {
        self.public_host
            .clone()
            .unwrap_or_else(|| detect_local_ip().unwrap_or_else(|| "localhost".to_string()))
    }
}

/// LAN address of the default route. No packet is sent; connecting a UDP
/// socket only selects the outbound interface.
fn detect_local_ip() -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    socket.local_addr().ok().map(|addr| addr.ip().to_string())
}

pub(crate) fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::invalid(name, raw.clone(), e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_describe_five_slot_pool() {
        let config = PoolConfig::default();
        assert_eq!(config.pool_size, 5);
        assert_eq!(config.port_for(SlotId::new(1)), Some(8081));
        assert_eq!(config.port_for(SlotId::new(5)), Some(8085));
        assert_eq!(config.port_for(SlotId::new(6)), None);
        assert_eq!(config.port_for(SlotId::new(0)), None);
        assert_eq!(config.heartbeat.ping_interval, Duration::from_secs(15));
        assert_eq!(config.heartbeat.timeout, Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn ports_are_pairwise_distinct() {
        let config = PoolConfig::default().with_pool_size(20);
        let mut ports: Vec<u16> = config
            .slot_ids()
            .filter_map(|id| config.port_for(id))
            .collect();
        ports.dedup();
        assert_eq!(ports.len(), 20);
    }

    #[test]
    fn extension_gate() {
        let config = PoolConfig::default();
        assert!(config.accepts_file_name("a.mdb"));
        assert!(config.accepts_file_name("Data.MDB"));
        assert!(!config.accepts_file_name("a.db"));
        assert!(!config.accepts_file_name("mdb"));
        assert!(!config.accepts_file_name(".mdb"));
    }

    #[test]
    fn from_lookup_overrides_defaults() {
        let config = PoolConfig::from_lookup(lookup(&[
            ("POOL_SIZE", "3"),
            ("BASE_PORT", "9000"),
            ("ALLOWED_EXTENSIONS", ".mdb, DB"),
            ("HEARTBEAT_TIMEOUT_SECS", "45"),
            ("LIVENESS_GRACE_SECS", "0"),
            ("CLEANUP_COMMAND", "/opt/cleanup.sh"),
        ]))
        .unwrap();

        assert_eq!(config.pool_size, 3);
        assert_eq!(config.port_for(SlotId::new(3)), Some(9003));
        assert_eq!(config.allowed_extensions, vec!["mdb", "db"]);
        assert_eq!(config.heartbeat.timeout, Duration::from_secs(45));
        assert_eq!(config.liveness_grace, None);
        assert_eq!(config.cleanup_command, Some(PathBuf::from("/opt/cleanup.sh")));
    }

    #[test]
    fn from_lookup_rejects_garbage() {
        let err = PoolConfig::from_lookup(lookup(&[("POOL_SIZE", "five")])).unwrap_err();
        assert!(err.to_string().contains("BOXPOOL_POOL_SIZE"));
    }

    #[test]
    fn validate_rejects_port_overflow() {
        let config = PoolConfig::default().with_base_port(65534);
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_pool() {
        let config = PoolConfig::default().with_pool_size(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn explicit_public_host_wins() {
        let config = PoolConfig::default().with_public_host("10.0.0.7");
        assert_eq!(config.advertised_host(), "10.0.0.7");
    }
}
