//! Configuration file discovery and loading.
//!
//! The discovery order is:
//! 1. The `--config` path.
//! 2. `CHATWARDEN_CONFIG` environment variable.
//! 3. `~/.chatwarden/config.json`
//! 4. `~/.chatwarden/config.yaml`
//! 5. If none is found, the built-in defaults.
//!
//! JSON and YAML are both accepted, chosen by file extension. camelCase keys
//! are handled by serde aliases on the config types.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chatwarden_types::config::Config;

pub const CONFIG_ENV: &str = "CHATWARDEN_CONFIG";

/// Pick the config file to load. An explicit path or env var is returned
/// even if it does not exist, so the caller can report it.
pub fn discover_config_path(
    explicit: Option<&Path>,
    env_value: Option<String>,
    home_dir: Option<PathBuf>,
) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Some(path) = env_value.filter(|v| !v.trim().is_empty()) {
        return Some(PathBuf::from(path));
    }
    let dir = home_dir?.join(".chatwarden");
    ["config.json", "config.yaml"]
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.exists())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Json,
    Yaml,
}

fn format_of(path: &Path) -> Format {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml") => {
            Format::Yaml
        }
        _ => Format::Json,
    }
}

/// Parse config text in the given file's format.
pub fn parse_config(path: &Path, contents: &str) -> anyhow::Result<Config> {
    let config = match format_of(path) {
        Format::Yaml => serde_yaml::from_str(contents)
            .with_context(|| format!("failed to parse YAML config {}", path.display()))?,
        Format::Json => serde_json::from_str(contents)
            .with_context(|| format!("failed to parse JSON config {}", path.display()))?,
    };
    Ok(config)
}

/// Load the configuration, returning it with the path it came from.
pub fn load_config(explicit: Option<&Path>) -> anyhow::Result<(Config, Option<PathBuf>)> {
    let path = discover_config_path(explicit, std::env::var(CONFIG_ENV).ok(), dirs::home_dir());
    let Some(path) = path else {
        tracing::info!("no config file found, using defaults");
        return Ok((Config::default(), None));
    };
    if !path.exists() {
        anyhow::bail!("config file not found: {}", path.display());
    }

    tracing::debug!(path = %path.display(), "loading config file");
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config = parse_config(&path, &contents)?;
    Ok((config, Some(path)))
}

#[cfg(test)]
mod tests {
    use chatwarden_types::Category;
    use chatwarden_types::config::{DeliveryMode, FirstOffense};

    use super::*;

    #[test]
    fn explicit_path_wins() {
        let got = discover_config_path(
            Some(Path::new("/tmp/a.json")),
            Some("/tmp/b.json".into()),
            None,
        );
        assert_eq!(got, Some(PathBuf::from("/tmp/a.json")));
    }

    #[test]
    fn env_var_beats_home() {
        let home = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(home.path().join(".chatwarden")).unwrap();
        std::fs::write(home.path().join(".chatwarden/config.json"), "{}").unwrap();
        let got = discover_config_path(None, Some("/etc/warden.yaml".into()), Some(home.path().into()));
        assert_eq!(got, Some(PathBuf::from("/etc/warden.yaml")));
    }

    #[test]
    fn home_json_then_yaml() {
        let home = tempfile::tempdir().unwrap();
        let dir = home.path().join(".chatwarden");
        std::fs::create_dir_all(&dir).unwrap();
        assert_eq!(discover_config_path(None, None, Some(home.path().into())), None);

        std::fs::write(dir.join("config.yaml"), "{}").unwrap();
        assert_eq!(
            discover_config_path(None, None, Some(home.path().into())),
            Some(dir.join("config.yaml"))
        );

        std::fs::write(dir.join("config.json"), "{}").unwrap();
        assert_eq!(
            discover_config_path(None, None, Some(home.path().into())),
            Some(dir.join("config.json"))
        );
    }

    #[test]
    fn json_with_camel_case_keys() {
        let json = r#"{
            "pipeline": {"batchIntervalSecs": 5, "deliveryMode": "incremental"},
            "twitch": {"channel": "somechannel", "clientId": "abc"},
            "escalation": {
                "ladderSecs": [60, 600],
                "categories": {"SPAM": {"firstOffense": "warn"}}
            }
        }"#;
        let cfg = parse_config(Path::new("c.json"), json).unwrap();
        assert_eq!(cfg.pipeline.batch_interval_secs, 5);
        assert_eq!(cfg.pipeline.delivery_mode, DeliveryMode::Incremental);
        assert_eq!(cfg.twitch.client_id, "abc");
        assert_eq!(cfg.escalation.ladder_secs, vec![60, 600]);
        assert_eq!(
            cfg.escalation.policy_for(Category::Spam).first_offense,
            FirstOffense::Warn
        );
    }

    #[test]
    fn yaml_by_extension() {
        let yaml = "pipeline:\n  max_content_size: 1000\nengine:\n  assistant_id: asst_1\n";
        let cfg = parse_config(Path::new("c.yml"), yaml).unwrap();
        assert_eq!(cfg.pipeline.max_content_size, 1000);
        assert_eq!(cfg.engine.assistant_id, "asst_1");
        assert_eq!(cfg.pipeline.tokens_per_minute, 20_000);
    }

    #[test]
    fn parse_errors_name_the_file() {
        let err = parse_config(Path::new("broken.json"), "{").unwrap_err();
        assert!(err.to_string().contains("broken.json"));
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let err = load_config(Some(Path::new("/nonexistent/warden.json"))).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
