use std::sync::LazyLock;

use regex::Regex;
use semver::Version;
use tracing::debug;

use crate::config::DsaConfig;

static STOCK_OPENWRT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[oO][pP][eE][nN][wW][rR][tT]\s*([\d.]+)").expect("openwrt pattern is valid")
});

/// Decides whether firmware uses the DSA switch model.
#[derive(Debug, Clone)]
pub struct DsaPolicy {
    fallback: bool,
    dsa_os: Vec<Regex>,
    legacy_os: Vec<Regex>,
}

impl DsaPolicy {
    pub fn from_config(cfg: &DsaConfig) -> anyhow::Result<Self> {
        let compile = |patterns: &[String]| -> anyhow::Result<Vec<Regex>> {
            patterns
                .iter()
                .map(|pattern| {
                    Regex::new(pattern)
                        .map_err(|err| anyhow::anyhow!("invalid dsa os pattern {pattern:?}: {err}"))
                })
                .collect()
        };
        Ok(Self {
            fallback: cfg.default_fallback,
            dsa_os: compile(&cfg.dsa_os_patterns)?,
            legacy_os: compile(&cfg.legacy_os_patterns)?,
        })
    }

    pub fn fallback_only(fallback: bool) -> Self {
        Self {
            fallback,
            dsa_os: Vec::new(),
            legacy_os: Vec::new(),
        }
    }

    pub fn uses_dsa(&self, os: Option<&str>) -> bool {
        let Some(os) = os.filter(|os| !os.trim().is_empty()) else {
            return self.fallback;
        };

        if let Some(caps) = STOCK_OPENWRT.captures(os)
            && let Some(version) = parse_loose_version(&caps[1])
        {
            return version >= Version::new(21, 0, 0);
        }

        if self.dsa_os.iter().any(|pattern| pattern.is_match(os)) {
            return true;
        }
        if self.legacy_os.iter().any(|pattern| pattern.is_match(os)) {
            return false;
        }
        debug!(os, fallback = self.fallback, "no dsa rule matched firmware");
        self.fallback
    }
}

/// Firmware versions look like `21.02.2` or `19.07`; normalize them to
/// three numeric components without leading zeros.
fn parse_loose_version(raw: &str) -> Option<Version> {
    let mut parts = raw
        .split('.')
        .filter(|part| !part.is_empty())
        .map(|part| part.parse::<u64>().ok());
    let major = parts.next()??;
    let minor = parts.next().flatten().unwrap_or(0);
    let patch = parts.next().flatten().unwrap_or(0);
    Some(Version::new(major, minor, patch))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> DsaPolicy {
        DsaPolicy::from_config(&DsaConfig {
            default_fallback: false,
            dsa_os_patterns: vec![r"MyCustomFirmware 2.1(.*)".into()],
            legacy_os_patterns: vec![r"MyCustomFirmware 2.0(.*)".into()],
        })
        .expect("policy")
    }

    #[test]
    fn stock_openwrt_versions_are_compared_numerically() {
        let policy = policy();
        assert!(policy.uses_dsa(Some("OpenWrt 21.02.2 r16495-bf0c965af0")));
        assert!(policy.uses_dsa(Some("openwrt 22.03")));
        assert!(!policy.uses_dsa(Some("OpenWrt 19.07.8 r11364-ef56c85848")));
    }

    #[test]
    fn custom_firmware_uses_mapping() {
        let policy = policy();
        assert!(policy.uses_dsa(Some("MyCustomFirmware 2.1.2")));
        assert!(!policy.uses_dsa(Some("MyCustomFirmware 2.0.1")));
    }

    #[test]
    fn unknown_or_missing_os_returns_fallback() {
        let policy = policy();
        assert!(!policy.uses_dsa(None));
        assert!(!policy.uses_dsa(Some("")));
        assert!(!policy.uses_dsa(Some("SomethingElse 1.0")));
        assert!(DsaPolicy::fallback_only(true).uses_dsa(Some("SomethingElse 1.0")));
    }

    #[test]
    fn loose_versions_tolerate_leading_zeros() {
        assert_eq!(parse_loose_version("21.02"), Some(Version::new(21, 2, 0)));
        assert_eq!(parse_loose_version("19.07.8"), Some(Version::new(19, 7, 8)));
        assert_eq!(parse_loose_version("."), None);
    }
}
