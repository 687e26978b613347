//! Sandbox configuration

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::stdin;

/// Top-level configuration for a sandbox context.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Data-region size of each run's stdin channel
    pub stdin_capacity: usize,
    /// Maximum number of headless runs executing at once
    pub max_concurrent_runs: usize,
    /// Connection handshake retry policy
    pub handshake: HandshakeConfig,
    /// Origin messages are accepted from (`None` accepts any)
    pub allowed_origin: Option<String>,
    /// Environment passed to every run
    pub env: BTreeMap<String, String>,
    /// Runtime identifier to command mapping
    pub runtimes: RuntimeRegistry,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            stdin_capacity: stdin::DEFAULT_CAPACITY,
            max_concurrent_runs: 4,
            handshake: HandshakeConfig::default(),
            allowed_origin: None,
            env: BTreeMap::new(),
            runtimes: RuntimeRegistry::default(),
        }
    }
}

impl SandboxConfig {
    /// Parse a JSON document. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Bounded backoff for connection probes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    /// Delay before the second probe
    #[serde(with = "duration_ms")]
    pub initial_delay: Duration,
    /// Upper bound on the delay between probes
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
    /// Growth factor applied to the delay after each probe
    pub multiplier: u32,
    /// Probes sent before giving up
    pub max_attempts: u32,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(1000),
            multiplier: 2,
            max_attempts: 20,
        }
    }
}

impl HandshakeConfig {
    /// Delay to wait after probe number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1).saturating_pow(attempt);
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

/// How a runtime identifier maps onto a module invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeCommand {
    /// Module reference handed to the engine
    pub module: String,
    /// Arguments placed before the entry path
    #[serde(default)]
    pub args: Vec<String>,
    /// Where source code is written for run-from-code requests
    pub entry_path: String,
}

impl RuntimeCommand {
    /// Create a runtime command.
    pub fn new(module: &str, args: &[&str], entry_path: &str) -> Self {
        Self {
            module: module.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            entry_path: entry_path.to_string(),
        }
    }
}

/// Known runtimes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuntimeRegistry {
    runtimes: BTreeMap<String, RuntimeCommand>,
}

impl Default for RuntimeRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("python", RuntimeCommand::new("python", &[], "/program.py"));
        registry.register("ruby", RuntimeCommand::new("ruby", &[], "/program.rb"));
        registry.register("quickjs", RuntimeCommand::new("quickjs", &["--std"], "/program.js"));
        registry.register("sqlite", RuntimeCommand::new("sqlite", &["-init"], "/program.sql"));
        registry.register("php-cgi", RuntimeCommand::new("php-cgi", &[], "/program.php"));
        registry
    }
}

impl RuntimeRegistry {
    /// A registry with no runtimes.
    pub fn empty() -> Self {
        Self {
            runtimes: BTreeMap::new(),
        }
    }

    /// Add or replace a runtime.
    pub fn register(&mut self, name: impl Into<String>, command: RuntimeCommand) {
        self.runtimes.insert(name.into(), command);
    }

    /// Look up a runtime.
    pub fn get(&self, name: &str) -> Option<&RuntimeCommand> {
        self.runtimes.get(name)
    }

    /// Registered runtime identifiers.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.runtimes.keys().map(String::as_str)
    }
}

/// Helper for serializing Duration as milliseconds
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SandboxConfig::default();

        assert_eq!(config.stdin_capacity, 64 * 1024);
        assert_eq!(config.handshake.max_attempts, 20);
        assert!(config.allowed_origin.is_none());
        assert!(config.runtimes.get("python").is_some());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = SandboxConfig::from_json(
            r#"{"stdin_capacity": 128, "handshake": {"max_attempts": 3}}"#,
        )
        .unwrap();

        assert_eq!(config.stdin_capacity, 128);
        assert_eq!(config.handshake.max_attempts, 3);
        assert_eq!(config.handshake.initial_delay, Duration::from_millis(10));
    }

    #[test]
    fn test_durations_serialize_as_millis() {
        let handshake = HandshakeConfig {
            initial_delay: Duration::from_millis(25),
            ..Default::default()
        };
        let json = serde_json::to_string(&handshake).unwrap();

        assert!(json.contains("\"initial_delay\":25"));
        assert!(json.contains("\"max_delay\":1000"));
    }

    #[test]
    fn test_backoff_is_bounded() {
        let handshake = HandshakeConfig::default();

        assert_eq!(handshake.delay_for(0), Duration::from_millis(10));
        assert_eq!(handshake.delay_for(1), Duration::from_millis(20));
        assert_eq!(handshake.delay_for(3), Duration::from_millis(80));
        assert_eq!(handshake.delay_for(10), Duration::from_millis(1000));
        assert_eq!(handshake.delay_for(u32::MAX), Duration::from_millis(1000));
    }

    #[test]
    fn test_constant_delay_when_multiplier_is_one() {
        let handshake = HandshakeConfig {
            multiplier: 1,
            ..Default::default()
        };
        assert_eq!(handshake.delay_for(5), Duration::from_millis(10));
    }

    #[test]
    fn test_custom_runtime_from_json() {
        let config = SandboxConfig::from_json(
            r#"{"runtimes": {"lua": {"module": "lua.wasm", "entry_path": "/main.lua"}}}"#,
        )
        .unwrap();

        let lua = config.runtimes.get("lua").unwrap();
        assert_eq!(lua.module, "lua.wasm");
        assert!(lua.args.is_empty());
        assert!(config.runtimes.get("python").is_none());
    }
}
