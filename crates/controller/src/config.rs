use std::collections::BTreeMap;

use serde::Deserialize;

pub const ENV_PREFIX: &str = "DEVCONF";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub metrics: MetricsConfig,
    pub database: DatabaseConfig,
    pub registration: RegistrationConfig,
    /// Global context defaults, the lowest-priority variable layer.
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    pub vpn: VpnConfig,
    pub hardware_id: HardwareIdConfig,
    pub dsa: DsaConfig,
    pub checksum: ChecksumConfig,
    pub limits: LimitsConfig,
    pub tasks: TaskConfig,
    pub features: FeatureFlags,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistrationConfig {
    /// Global switch; organizations can additionally disable registration.
    pub enabled: bool,
    /// Derive device keys from the mac address (or hardware id) and the
    /// organization secret so a reflashed device gets the same key back.
    pub consistent: bool,
    /// Create unknown devices on registration instead of answering 404.
    pub self_creation: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VpnConfig {
    /// Directory on the device where certificates are written.
    pub cert_path: String,
    pub common_name_format: String,
    pub dh_length: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HardwareIdConfig {
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DsaConfig {
    /// Value used when the OS is unknown or matches no rule.
    pub default_fallback: bool,
    /// OS patterns of firmware that ships DSA (21.02 and later).
    #[serde(default)]
    pub dsa_os_patterns: Vec<String>,
    /// OS patterns of firmware that predates DSA.
    #[serde(default)]
    pub legacy_os_patterns: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChecksumConfig {
    pub cache_ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    pub error_reason_max_len: usize,
    pub register_body_bytes: u64,
    pub max_field_len: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskConfig {
    pub max_retries: u32,
    pub backoff_secs: u64,
    pub backoff_max_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeatureFlags {
    #[serde(default)]
    pub migrations_dry_run_on_start: bool,
}

impl VpnConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.cert_path.starts_with('/') {
            anyhow::bail!("vpn.cert_path must be an absolute path");
        }
        if !self.common_name_format.contains('{') {
            anyhow::bail!("vpn.common_name_format must reference at least one device field");
        }
        for placeholder in placeholders(&self.common_name_format) {
            if !matches!(placeholder, "mac_address" | "name" | "id" | "key") {
                anyhow::bail!(
                    "vpn.common_name_format references unknown field {{{placeholder}}}"
                );
            }
        }
        if self.dh_length < 1024 {
            anyhow::bail!("vpn.dh_length must be >= 1024");
        }
        Ok(())
    }
}

fn placeholders(format: &str) -> impl Iterator<Item = &str> {
    format
        .split('{')
        .skip(1)
        .filter_map(|chunk| chunk.split_once('}').map(|(name, _)| name))
}

impl DsaConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        for pattern in self.dsa_os_patterns.iter().chain(&self.legacy_os_patterns) {
            regex::Regex::new(pattern)
                .map_err(|err| anyhow::anyhow!("invalid dsa os pattern {pattern:?}: {err}"))?;
        }
        Ok(())
    }
}

impl TaskConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.backoff_secs == 0 {
            anyhow::bail!("tasks.backoff_secs must be > 0");
        }
        if self.backoff_max_secs < self.backoff_secs {
            anyhow::bail!("tasks.backoff_max_secs must be >= tasks.backoff_secs");
        }
        Ok(())
    }
}

impl Default for VpnConfig {
    fn default() -> Self {
        Self {
            cert_path: "/etc/x509".into(),
            common_name_format: "{mac_address}-{name}".into(),
            dh_length: 2048,
        }
    }
}

impl Default for DsaConfig {
    fn default() -> Self {
        Self {
            default_fallback: true,
            dsa_os_patterns: Vec::new(),
            legacy_os_patterns: Vec::new(),
        }
    }
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff_secs: 1,
            backoff_max_secs: 600,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            error_reason_max_len: 1024,
            register_body_bytes: 16 * 1024,
            max_field_len: 255,
        }
    }
}

pub fn load() -> anyhow::Result<AppConfig> {
    let env = config::Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        // Keep try_parsing disabled so numeric secrets are not coerced.
        .try_parsing(false);

    let builder = config::Config::builder()
        .add_source(config::File::with_name("config").required(false))
        .add_source(env)
        .set_default("server.host", "0.0.0.0")?
        .set_default("server.port", 8080)?
        .set_default("metrics.host", "127.0.0.1")?
        .set_default("metrics.port", 9090)?
        .set_default("database.url", "sqlite://data/devconf.db")?
        .set_default("registration.enabled", true)?
        .set_default("registration.consistent", true)?
        .set_default("registration.self_creation", true)?
        .set_default("vpn.cert_path", "/etc/x509")?
        .set_default("vpn.common_name_format", "{mac_address}-{name}")?
        .set_default("vpn.dh_length", 2048)?
        .set_default("hardware_id.enabled", false)?
        .set_default("dsa.default_fallback", true)?
        .set_default("dsa.dsa_os_patterns", Vec::<String>::new())?
        .set_default("dsa.legacy_os_patterns", Vec::<String>::new())?
        .set_default("checksum.cache_ttl_secs", 30 * 24 * 60 * 60u64)?
        .set_default("limits.error_reason_max_len", 1024)?
        .set_default("limits.register_body_bytes", 16 * 1024u64)?
        .set_default("limits.max_field_len", 255)?
        .set_default("tasks.max_retries", 5)?
        .set_default("tasks.backoff_secs", 1)?
        .set_default("tasks.backoff_max_secs", 600)?
        .set_default("features.migrations_dry_run_on_start", false)?;

    let cfg = builder.build()?;
    let mut app: AppConfig = cfg.try_deserialize()?;
    app.vpn.cert_path = app.vpn.cert_path.trim_end_matches('/').to_string();
    if app.vpn.cert_path.is_empty() {
        app.vpn.cert_path = "/".into();
    }
    app.vpn.validate()?;
    app.dsa.validate()?;
    app.tasks.validate()?;
    Ok(app)
}
