use serde::{Deserialize, Serialize};
use std::{
  env,
  fs,
  path::{Path, PathBuf},
};

// ── Engine options ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SeedingMode {
  /// Pad to a power of two and place seeds 1 v N, 2 v N-1, ...
  Standard,
  /// Pair neighbours of the seed-sorted list.
  Sequential,
}

impl SeedingMode {
  pub fn parse(raw: &str) -> Option<SeedingMode> {
    match raw.trim().to_ascii_lowercase().as_str() {
      "standard" => Some(SeedingMode::Standard),
      "sequential" => Some(SeedingMode::Sequential),
      _ => None,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
  pub seeding: SeedingMode,
  pub allow_grand_finals_reset: bool,
}

impl Default for EngineConfig {
  fn default() -> Self {
    EngineConfig {
      seeding: SeedingMode::Standard,
      allow_grand_finals_reset: true,
    }
  }
}

// ── Server options ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
  pub bind_addr: String,
  pub state_path: Option<String>,
  pub log_dir: String,
  pub engine: EngineConfig,
}

impl Default for ServerConfig {
  fn default() -> Self {
    ServerConfig {
      bind_addr: "127.0.0.1:17880".to_string(),
      state_path: None,
      log_dir: "logs".to_string(),
      engine: EngineConfig::default(),
    }
  }
}

pub fn config_path() -> PathBuf {
  env_default("BRACKET_CONFIG")
    .map(PathBuf::from)
    .unwrap_or_else(|| PathBuf::from("bracket.json"))
}

pub fn env_default(key: &str) -> Option<String> {
  env::var(key)
    .ok()
    .map(|value| value.trim().to_string())
    .filter(|value| !value.is_empty())
}

pub fn parse_flag(raw: &str) -> Option<bool> {
  match raw.trim().to_ascii_lowercase().as_str() {
    "1" | "true" | "yes" | "on" => Some(true),
    "0" | "false" | "no" | "off" => Some(false),
    _ => None,
  }
}

pub fn apply_env_defaults(mut config: ServerConfig) -> ServerConfig {
  apply_overrides(&mut config, |key| env_default(key));
  config
}

fn apply_overrides(config: &mut ServerConfig, lookup: impl Fn(&str) -> Option<String>) {
  if let Some(value) = lookup("BRACKET_BIND_ADDR") {
    config.bind_addr = value;
  }
  if let Some(value) = lookup("BRACKET_STATE_PATH") {
    config.state_path = Some(value);
  }
  if let Some(value) = lookup("BRACKET_LOG_DIR") {
    config.log_dir = value;
  }
  if let Some(value) = lookup("BRACKET_SEEDING") {
    match SeedingMode::parse(&value) {
      Some(mode) => config.engine.seeding = mode,
      None => tracing::warn!("ignoring unknown BRACKET_SEEDING value {value:?}"),
    }
  }
  if let Some(value) = lookup("BRACKET_GF_RESET") {
    match parse_flag(&value) {
      Some(flag) => config.engine.allow_grand_finals_reset = flag,
      None => tracing::warn!("ignoring unknown BRACKET_GF_RESET value {value:?}"),
    }
  }
}

pub fn load_config_from(path: &Path) -> Result<ServerConfig, String> {
  if !path.is_file() {
    return Ok(apply_env_defaults(ServerConfig::default()));
  }
  let data = fs::read_to_string(path).map_err(|e| format!("read config {}: {e}", path.display()))?;
  let config =
    serde_json::from_str::<ServerConfig>(&data).map_err(|e| format!("parse config {}: {e}", path.display()))?;
  Ok(apply_env_defaults(config))
}

pub fn load_config() -> Result<ServerConfig, String> {
  load_config_from(&config_path())
}

/// Loads `.env` from the working directory without clobbering real env vars.
pub fn load_env_file() {
  let env_path = PathBuf::from(".env");
  if !env_path.is_file() {
    return;
  }
  let contents = match fs::read_to_string(&env_path) {
    Ok(data) => data,
    Err(_) => return,
  };
  for line in contents.lines() {
    if let Some((key, value)) = parse_env_line(line) {
      if env::var_os(&key).is_none() {
        env::set_var(key, value);
      }
    }
  }
}

pub fn parse_env_line(line: &str) -> Option<(String, String)> {
  let trimmed = line.trim();
  if trimmed.is_empty() || trimmed.starts_with('#') {
    return None;
  }
  let trimmed = trimmed.strip_prefix("export ").unwrap_or(trimmed);
  let (key, raw_value) = trimmed.split_once('=')?;
  let key = key.trim();
  if key.is_empty() {
    return None;
  }
  let mut value = raw_value.trim();
  if value.starts_with('"') && value.ends_with('"') && value.len() >= 2 {
    value = &value[1..value.len() - 1];
  } else if value.starts_with('\'') && value.ends_with('\'') && value.len() >= 2 {
    value = &value[1..value.len() - 1];
  } else if let Some(idx) = value.find('#') {
    value = value[..idx].trim_end();
  }
  Some((key.to_string(), value.to_string()))
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashMap;

  #[test]
  fn parses_env_lines() {
    assert_eq!(
      parse_env_line("export BRACKET_SEEDING=\"sequential\""),
      Some(("BRACKET_SEEDING".to_string(), "sequential".to_string()))
    );
    assert_eq!(
      parse_env_line("BRACKET_GF_RESET=off # no resets"),
      Some(("BRACKET_GF_RESET".to_string(), "off".to_string()))
    );
    assert_eq!(parse_env_line("# comment"), None);
    assert_eq!(parse_env_line("=value"), None);
  }

  #[test]
  fn overrides_apply_on_top_of_file_values() {
    let vars: HashMap<&str, &str> = HashMap::from([
      ("BRACKET_SEEDING", "Sequential"),
      ("BRACKET_GF_RESET", "no"),
      ("BRACKET_STATE_PATH", "state/brackets.json"),
    ]);
    let mut config = ServerConfig::default();
    apply_overrides(&mut config, |key| vars.get(key).map(|v| v.to_string()));
    assert_eq!(config.engine.seeding, SeedingMode::Sequential);
    assert!(!config.engine.allow_grand_finals_reset);
    assert_eq!(config.state_path.as_deref(), Some("state/brackets.json"));
    assert_eq!(config.bind_addr, "127.0.0.1:17880");
  }

  #[test]
  fn unknown_override_values_are_ignored() {
    let mut config = ServerConfig::default();
    apply_overrides(&mut config, |key| (key == "BRACKET_SEEDING").then(|| "swiss".to_string()));
    assert_eq!(config.engine.seeding, SeedingMode::Standard);
  }

  #[test]
  fn partial_json_uses_defaults() {
    let config: ServerConfig =
      serde_json::from_str(r#"{ "engine": { "seeding": "sequential" } }"#).unwrap();
    assert_eq!(config.engine.seeding, SeedingMode::Sequential);
    assert!(config.engine.allow_grand_finals_reset);
    assert_eq!(config.log_dir, "logs");
  }
}
