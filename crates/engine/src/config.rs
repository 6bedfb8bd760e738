use std::{fs, path::Path};

use serde::Deserialize;

/// Top-level configuration for the mailveil relay.
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub smtp: SmtpConfig,

    pub engine: EngineConfig,
}

/// SMTP ingress listener configuration.
#[derive(Debug, Deserialize)]
pub struct SmtpConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Engine configuration: deployment domain, fixed system addresses, and
/// spam thresholds.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Deployment domain. Reverse-alias and bounce addresses live under it,
    /// and generated Message-IDs are scoped to it.
    pub domain: String,

    /// Further domains aliases may legitimately live under (custom domains).
    /// The deployment domain is always valid.
    #[serde(default)]
    pub alias_domains: Vec<String>,

    /// System-wide unsubscribe address; unsubscribe handling is disabled
    /// when unset.
    #[serde(default)]
    pub unsubscribe_address: Option<String>,

    /// No-reply sink used as reverse alias for contacts whose address could
    /// not be parsed. Defaults to `noreply@<domain>`.
    #[serde(default)]
    pub noreply_address: Option<String>,

    /// Forward-phase spam threshold, overridable per user.
    #[serde(default = "default_max_spam_score")]
    pub max_spam_score: f32,

    /// Reply-phase spam threshold. Fixed: reply-phase spam is
    /// attacker-controlled, so no per-user override applies.
    #[serde(default = "default_max_reply_spam_score")]
    pub max_reply_spam_score: f32,

    /// spamd address (`host:port`); spam checking is skipped when unset.
    #[serde(default)]
    pub spamd_address: Option<String>,

    /// Outbound smart host (`host:port`) for the SMTP relay transport.
    #[serde(default)]
    pub relay_address: Option<String>,

    /// Whether reply-phase SPF verification is performed for mailboxes
    /// that require it.
    #[serde(default)]
    pub enforce_spf: bool,
}

impl EngineConfig {
    /// Minimal configuration for the given deployment domain.
    pub fn for_domain(domain: &str) -> Self {
        Self {
            domain: domain.to_string(),
            alias_domains: Vec::new(),
            unsubscribe_address: None,
            noreply_address: None,
            max_spam_score: default_max_spam_score(),
            max_reply_spam_score: default_max_reply_spam_score(),
            spamd_address: None,
            relay_address: None,
            enforce_spf: false,
        }
    }

    /// The no-reply sink address.
    pub fn noreply(&self) -> String {
        self.noreply_address
            .clone()
            .unwrap_or_else(|| format!("noreply@{}", self.domain))
    }

    /// Whether an alias address lives under a domain this deployment
    /// still handles.
    pub fn is_valid_alias_domain(&self, alias_address: &str) -> bool {
        let domain = crate::address::domain_part(alias_address);
        domain == self.domain || self.alias_domains.iter().any(|d| d == domain)
    }
}

/// Loads configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
    toml::from_str(&content).map_err(ConfigError::Parse)
}

/// Errors that can occur while loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// An I/O error occurred reading the file.
    Io(std::io::Error),
    /// A parse error occurred deserializing TOML.
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Config I/O error: {e}"),
            ConfigError::Parse(e) => write!(f, "Config parse error: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    2525
}

fn default_max_spam_score() -> f32 {
    5.5
}

fn default_max_reply_spam_score() -> f32 {
    15.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
[engine]
domain = "veil.example"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.smtp.host, "127.0.0.1");
        assert_eq!(config.smtp.port, 2525);
        assert_eq!(config.engine.domain, "veil.example");
        assert_eq!(config.engine.noreply(), "noreply@veil.example");
        assert_eq!(config.engine.max_spam_score, 5.5);
        assert_eq!(config.engine.max_reply_spam_score, 15.0);
        assert!(!config.engine.enforce_spf);
        assert!(config.engine.spamd_address.is_none());
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
[smtp]
host = "0.0.0.0"
port = 25

[engine]
domain = "veil.example"
alias_domains = ["mail.corp.example"]
unsubscribe_address = "unsubscribe@veil.example"
noreply_address = "no-reply@veil.example"
max_spam_score = 4.0
max_reply_spam_score = 10.0
spamd_address = "127.0.0.1:783"
relay_address = "127.0.0.1:25"
enforce_spf = true
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.smtp.host, "0.0.0.0");
        assert_eq!(config.smtp.port, 25);
        assert_eq!(config.engine.noreply(), "no-reply@veil.example");
        assert_eq!(config.engine.max_spam_score, 4.0);
        assert_eq!(
            config.engine.unsubscribe_address.as_deref(),
            Some("unsubscribe@veil.example")
        );
        assert!(config.engine.enforce_spf);
    }

    #[test]
    fn test_valid_alias_domain() {
        let mut engine = EngineConfig::for_domain("veil.example");
        engine.alias_domains = vec!["corp.example".to_string()];

        assert!(engine.is_valid_alias_domain("news@veil.example"));
        assert!(engine.is_valid_alias_domain("me@corp.example"));
        assert!(!engine.is_valid_alias_domain("me@gone.example"));
    }
}
