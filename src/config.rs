use crate::claude::DEFAULT_MODEL;
use crate::shell::{ExecutionLimits, ShellKind};
use crate::workflow::WorkflowPolicy;
use anyhow::{Context, Result, anyhow, bail};
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use which::which;

const CONFIG_DIR_NAME: &str = ".shellgate";
const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub anthropic_api_key: Option<String>,
    pub model: String,
    pub use_mock: bool,
    /// Seconds before a running command is terminated.
    pub max_execution_timeout: u64,
    /// Bytes kept per output stream.
    pub max_output_size: usize,
    pub max_retries: u32,
    pub require_confirmation: bool,
    pub enable_dangerous_commands: bool,
    /// Fallback order.
    pub shells: Vec<ShellKind>,
    pub shell_paths: BTreeMap<ShellKind, PathBuf>,
    pub enable_conversation_memory: bool,
    pub max_conversations: usize,
    pub context_conversations: usize,
    pub log_level: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            anthropic_api_key: None,
            model: DEFAULT_MODEL.to_string(),
            use_mock: false,
            max_execution_timeout: 30,
            max_output_size: 1024 * 1024,
            max_retries: 3,
            require_confirmation: true,
            enable_dangerous_commands: false,
            shells: ShellKind::platform_priority(),
            shell_paths: BTreeMap::new(),
            enable_conversation_memory: true,
            max_conversations: 5,
            context_conversations: 3,
            log_level: None,
        }
    }
}

impl Config {
    /// Load configuration from file, then environment variables, then validate
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file(&Self::get_config_path()?)?.unwrap_or_else(|| {
            info!("No config file found, using defaults");
            Self::default()
        });

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_file(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| format!("Invalid configuration in {}", path.display()))?;
        info!("Loaded config from: {}", path.display());
        Ok(Some(config))
    }

    /// Environment variables override the file. `lookup` is `std::env::var` outside tests.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(api_key) = lookup("ANTHROPIC_API_KEY").filter(|k| !k.trim().is_empty()) {
            self.anthropic_api_key = Some(api_key.trim().to_string());
        }
        if let Some(model) = lookup("SHELLGATE_MODEL").filter(|m| !m.trim().is_empty()) {
            self.model = model.trim().to_string();
        }
        if let Some(value) = lookup("SHELLGATE_USE_MOCK") {
            self.use_mock = parse_bool("SHELLGATE_USE_MOCK", &value)?;
        }
        if let Some(value) = lookup("MAX_EXECUTION_TIMEOUT") {
            self.max_execution_timeout = parse_number("MAX_EXECUTION_TIMEOUT", &value)?;
        }
        if let Some(value) = lookup("MAX_OUTPUT_SIZE") {
            self.max_output_size = parse_number("MAX_OUTPUT_SIZE", &value)?;
        }
        if let Some(value) = lookup("MAX_RETRIES") {
            self.max_retries = parse_number("MAX_RETRIES", &value)?;
        }
        if let Some(value) = lookup("REQUIRE_CONFIRMATION") {
            self.require_confirmation = parse_bool("REQUIRE_CONFIRMATION", &value)?;
        }
        if let Some(value) = lookup("ENABLE_DANGEROUS_COMMANDS") {
            self.enable_dangerous_commands = parse_bool("ENABLE_DANGEROUS_COMMANDS", &value)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_execution_timeout == 0 {
            bail!("max_execution_timeout must be at least 1 second");
        }
        if self.max_output_size == 0 {
            bail!("max_output_size must be greater than zero");
        }
        if self.shells.is_empty() {
            bail!("shells must list at least one shell");
        }
        if self.model.trim().is_empty() {
            bail!("model must not be empty");
        }
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::get_config_path()?)
    }

    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(config_path, content)?;
        info!("Saved config to: {}", config_path.display());
        Ok(())
    }

    pub fn get_config_path() -> Result<PathBuf> {
        Ok(Self::get_config_dir()?.join(CONFIG_FILE_NAME))
    }

    pub fn get_config_dir() -> Result<PathBuf> {
        let home = home_dir().ok_or_else(|| anyhow!("Could not find home directory"))?;
        Ok(home.join(CONFIG_DIR_NAME))
    }

    /// Set API key and save config
    pub fn set_api_key(&mut self, api_key: String) -> Result<()> {
        let api_key = api_key.trim();
        if api_key.is_empty() {
            bail!("API key must not be empty");
        }
        self.anthropic_api_key = Some(api_key.to_string());
        self.save()?;
        info!("API key saved to config file");
        Ok(())
    }

    pub fn get_api_key(&self) -> Option<&String> {
        self.anthropic_api_key.as_ref()
    }

    pub fn is_mock_mode(&self) -> bool {
        self.use_mock
    }

    pub fn limits(&self) -> ExecutionLimits {
        ExecutionLimits {
            timeout: Duration::from_secs(self.max_execution_timeout),
            output_cap: self.max_output_size,
        }
    }

    pub fn policy(&self) -> WorkflowPolicy {
        WorkflowPolicy {
            max_retries: self.max_retries,
            require_confirmation: self.require_confirmation,
            shells: self.shells.clone(),
            limits: self.limits(),
        }
    }

    /// Program that would be launched for `shell`.
    pub fn program_for(&self, shell: ShellKind) -> PathBuf {
        self.shell_paths
            .get(&shell)
            .cloned()
            .unwrap_or_else(|| PathBuf::from(shell.default_program()))
    }

    pub fn show_config_info(&self) -> Result<()> {
        let config_path = Self::get_config_path()?;
        println!("Configuration file: {}", config_path.display());
        println!(
            "Status: {}",
            if config_path.exists() { "Found" } else { "Not found (using defaults)" }
        );

        println!("API Key: {}", if self.anthropic_api_key.is_some() { "Set" } else { "Not set" });
        println!("Model: {}", self.model);
        println!("Mock mode: {}", self.use_mock);
        println!("Timeout: {}s", self.max_execution_timeout);
        println!("Output cap: {} bytes per stream", self.max_output_size);
        println!("Max retries: {}", self.max_retries);
        println!("Require confirmation: {}", self.require_confirmation);
        println!("Dangerous commands: {}", if self.enable_dangerous_commands { "enabled" } else { "blocked" });
        println!(
            "Conversation memory: {} (keep {}, context {})",
            if self.enable_conversation_memory { "on" } else { "off" },
            self.max_conversations,
            self.context_conversations
        );

        println!("\nShells (in fallback order):");
        for shell in &self.shells {
            let program = self.program_for(*shell);
            match which(&program) {
                Ok(path) => println!("  {} -> {}", shell, path.display()),
                Err(_) => println!("  {} -> {} (not installed)", shell, program.display()),
            }
        }

        println!("\nTo set API key:");
        println!("  shellgate --set-api-key <your-key>");
        println!("\nOr set environment variable:");
        println!("  export ANTHROPIC_API_KEY=<your-key>");

        Ok(())
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(anyhow!("{} must be true or false, got '{}'", name, other)),
    }
}

fn parse_number<T>(name: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| anyhow!("{} must be a non-negative integer, got '{}': {}", name, value.trim(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.max_execution_timeout, 30);
        assert_eq!(config.max_output_size, 1_048_576);
        assert_eq!(config.max_retries, 3);
        assert!(config.require_confirmation);
        assert!(!config.enable_dangerous_commands);
        assert_eq!(config.shells, ShellKind::platform_priority());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides_file_values() {
        let mut config = Config::default();
        config
            .apply_env(env(&[
                ("ANTHROPIC_API_KEY", " sk-env "),
                ("MAX_EXECUTION_TIMEOUT", "5"),
                ("MAX_OUTPUT_SIZE", "2048"),
                ("MAX_RETRIES", "0"),
                ("REQUIRE_CONFIRMATION", "false"),
                ("ENABLE_DANGEROUS_COMMANDS", "yes"),
                ("SHELLGATE_USE_MOCK", "1"),
            ]))
            .unwrap();

        assert_eq!(config.get_api_key().map(String::as_str), Some("sk-env"));
        assert_eq!(config.limits().timeout, Duration::from_secs(5));
        assert_eq!(config.limits().output_cap, 2048);
        assert_eq!(config.max_retries, 0);
        assert!(!config.require_confirmation);
        assert!(config.enable_dangerous_commands);
        assert!(config.is_mock_mode());
    }

    #[test]
    fn test_invalid_env_values_are_errors() {
        let mut config = Config::default();
        let err = config.apply_env(env(&[("MAX_RETRIES", "many")])).unwrap_err();
        assert!(err.to_string().contains("MAX_RETRIES"));

        let err = config
            .apply_env(env(&[("REQUIRE_CONFIRMATION", "sometimes")]))
            .unwrap_err();
        assert!(err.to_string().contains("REQUIRE_CONFIRMATION"));

        let err = config.apply_env(env(&[("MAX_OUTPUT_SIZE", "-1")])).unwrap_err();
        assert!(err.to_string().contains("MAX_OUTPUT_SIZE"));
    }

    #[test]
    fn test_validation_rejects_zero_limits_and_empty_shells() {
        let mut config = Config::default();
        config.max_execution_timeout = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.max_output_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.shells.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_file_roundtrip_with_partial_contents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.shells = vec![ShellKind::Sh, ShellKind::Bash];
        config.shell_paths.insert(ShellKind::Bash, PathBuf::from("/opt/bash"));
        config.save_to(&path).unwrap();

        let loaded = Config::load_from_file(&path).unwrap().unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.program_for(ShellKind::Bash), PathBuf::from("/opt/bash"));

        fs::write(&path, "max_retries = 7\nshells = [\"cmd\"]\n").unwrap();
        let partial = Config::load_from_file(&path).unwrap().unwrap();
        assert_eq!(partial.max_retries, 7);
        assert_eq!(partial.shells, vec![ShellKind::Cmd]);
        assert_eq!(partial.max_execution_timeout, 30);
    }

    #[test]
    fn test_missing_file_is_none_and_garbage_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        assert!(Config::load_from_file(&path).unwrap().is_none());

        fs::write(&path, "max_retries = \"three\"").unwrap();
        assert!(Config::load_from_file(&path).is_err());
    }

    #[test]
    fn test_policy_reflects_config() {
        let mut config = Config::default();
        config.max_retries = 1;
        config.require_confirmation = false;
        config.shells = vec![ShellKind::Sh];

        let policy = config.policy();
        assert_eq!(policy.max_retries, 1);
        assert!(!policy.require_confirmation);
        assert_eq!(policy.shells, vec![ShellKind::Sh]);
        assert_eq!(policy.limits, config.limits());
    }
}
