use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use toml::Value;

pub const DEFAULT_CONFIG_FILE: &str = "graphwire.toml";

const DEFAULT_CONFIG_TOML: &str = r#"
[logging]
level = "info"
human_friendly = false

[server]
host = "127.0.0.1"
port = 8787

[wire]
format = "msgpack"
compression = "none"
max_frame_size_bytes = 8388608

[pool]
size = 4
idle_wait_ms = 1000

[auth]
enabled = false
users_file = ""
rechallenge = "every_failure"
challenge = ""

[procedures]
files = []

[engine]
fixtures_file = ""
"#;

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub wire: WireConfig,
    pub pool: PoolConfig,
    pub auth: AuthConfig,
    #[serde(default)]
    pub procedures: ProceduresConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub human_friendly: bool,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct WireConfig {
    pub format: String,
    pub compression: String,
    pub max_frame_size_bytes: usize,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
pub struct PoolConfig {
    pub size: usize,
    pub idle_wait_ms: u64,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct AuthConfig {
    pub enabled: bool,
    pub users_file: String,
    pub rechallenge: String,
    /// Text of the credentials prompt; empty sends none.
    #[serde(default)]
    pub challenge: String,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct ProceduresConfig {
    #[serde(default)]
    pub files: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    #[serde(default)]
    pub fixtures_file: String,
}

impl AppConfig {
    /// Resolves the config source from argv: `--config <path>` wins, then
    /// `./graphwire.toml`, then the built-in defaults. Remaining arguments are
    /// applied as `--section.key value` overrides.
    pub fn load_with_discovery(args: impl IntoIterator<Item = String>) -> Result<Self, ConfigError> {
        let mut explicit_path: Option<PathBuf> = None;
        let mut remaining = Vec::new();
        let mut iter = args.into_iter();

        while let Some(arg) = iter.next() {
            if arg == "--config" {
                let path = iter.next().ok_or_else(|| ConfigError::MissingValueForArg {
                    key: "config".to_owned(),
                })?;
                explicit_path = Some(PathBuf::from(path));
                continue;
            }
            remaining.push(arg);
        }

        if let Some(path) = explicit_path {
            return Self::load_from_toml_with_args(path, remaining);
        }

        let discovered = Path::new(DEFAULT_CONFIG_FILE);
        if discovered.is_file() {
            return Self::load_from_toml_with_args(discovered, remaining);
        }

        Self::load_from_str_with_args(DEFAULT_CONFIG_TOML, "<defaults>", remaining)
    }

    pub fn load_from_toml_with_args(
        path: impl AsRef<Path>,
        args: impl IntoIterator<Item = String>,
    ) -> Result<Self, ConfigError> {
        let display_path = path.as_ref().to_string_lossy().to_string();
        let toml_content = fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Io {
            path: display_path.clone(),
            source,
        })?;

        Self::load_from_str_with_args(&toml_content, &display_path, args)
    }

    fn load_from_str_with_args(
        toml_content: &str,
        display_path: &str,
        args: impl IntoIterator<Item = String>,
    ) -> Result<Self, ConfigError> {
        let mut root_value: Value =
            toml_content
                .parse()
                .map_err(|source| ConfigError::TomlParse {
                    path: display_path.to_owned(),
                    source,
                })?;

        let overrides = parse_cli_overrides(args)?;
        for (key_path, raw_value) in overrides {
            apply_override(&mut root_value, &key_path, &raw_value)?;
        }

        root_value.try_into().map_err(ConfigError::Deserialize)
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: String,
        source: std::io::Error,
    },
    TomlParse {
        path: String,
        source: toml::de::Error,
    },
    Deserialize(toml::de::Error),
    MissingValueForArg {
        key: String,
    },
    InvalidArgFormat {
        arg: String,
    },
    InvalidPath {
        key: String,
    },
    UnknownPath {
        key: String,
    },
    UnsupportedOverrideType {
        key: String,
    },
    InvalidValueForType {
        key: String,
        expected: &'static str,
        value: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "failed to read config file '{path}': {source}")
            }
            Self::TomlParse { path, source } => {
                write!(f, "failed to parse TOML config '{path}': {source}")
            }
            Self::Deserialize(source) => write!(f, "failed to deserialize config: {source}"),
            Self::MissingValueForArg { key } => {
                write!(f, "missing value for CLI override '--{key}'")
            }
            Self::InvalidArgFormat { arg } => write!(
                f,
                "invalid CLI argument format '{arg}', expected '--section.key value'"
            ),
            Self::InvalidPath { key } => write!(f, "invalid override key path '{key}'"),
            Self::UnknownPath { key } => write!(f, "unknown override key path '{key}'"),
            Self::UnsupportedOverrideType { key } => {
                write!(f, "override not supported for complex TOML type at '{key}'")
            }
            Self::InvalidValueForType {
                key,
                expected,
                value,
            } => write!(
                f,
                "invalid value '{value}' for '{key}', expected type {expected}"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

fn parse_cli_overrides(args: impl IntoIterator<Item = String>) -> Result<Vec<(String, String)>, ConfigError> {
    let mut parsed = Vec::new();
    let mut iter = args.into_iter();

    while let Some(arg) = iter.next() {
        let Some(stripped) = arg.strip_prefix("--") else {
            return Err(ConfigError::InvalidArgFormat { arg });
        };

        if stripped.is_empty() {
            return Err(ConfigError::InvalidArgFormat { arg });
        }

        let value = iter.next().ok_or_else(|| ConfigError::MissingValueForArg {
            key: stripped.to_owned(),
        })?;

        parsed.push((stripped.to_owned(), value));
    }

    Ok(parsed)
}

fn apply_override(root: &mut Value, key_path: &str, raw_value: &str) -> Result<(), ConfigError> {
    let parts: Vec<&str> = key_path.split('.').collect();
    if parts.len() < 2 || parts.iter().any(|part| part.is_empty()) {
        return Err(ConfigError::InvalidPath {
            key: key_path.to_owned(),
        });
    }

    let mut current = root;
    for section in &parts[..parts.len() - 1] {
        let table = current
            .as_table_mut()
            .ok_or_else(|| ConfigError::UnknownPath {
                key: key_path.to_owned(),
            })?;
        current = table.get_mut(*section).ok_or_else(|| ConfigError::UnknownPath {
            key: key_path.to_owned(),
        })?;
    }

    let final_key = parts[parts.len() - 1];
    let table = current
        .as_table_mut()
        .ok_or_else(|| ConfigError::UnknownPath {
            key: key_path.to_owned(),
        })?;
    let current_value = table
        .get_mut(final_key)
        .ok_or_else(|| ConfigError::UnknownPath {
            key: key_path.to_owned(),
        })?;

    let parsed_value = parse_value_using_current_type(key_path, raw_value, current_value)?;
    *current_value = parsed_value;

    Ok(())
}

fn parse_value_using_current_type(
    key_path: &str,
    raw_value: &str,
    current_value: &Value,
) -> Result<Value, ConfigError> {
    match current_value {
        Value::String(_) => Ok(Value::String(raw_value.to_owned())),
        Value::Integer(_) => {
            let parsed = raw_value
                .parse::<i64>()
                .map_err(|_| ConfigError::InvalidValueForType {
                    key: key_path.to_owned(),
                    expected: "integer",
                    value: raw_value.to_owned(),
                })?;
            Ok(Value::Integer(parsed))
        }
        Value::Float(_) => {
            let parsed = raw_value
                .parse::<f64>()
                .map_err(|_| ConfigError::InvalidValueForType {
                    key: key_path.to_owned(),
                    expected: "float",
                    value: raw_value.to_owned(),
                })?;
            Ok(Value::Float(parsed))
        }
        Value::Boolean(_) => {
            let parsed = raw_value
                .parse::<bool>()
                .map_err(|_| ConfigError::InvalidValueForType {
                    key: key_path.to_owned(),
                    expected: "boolean",
                    value: raw_value.to_owned(),
                })?;
            Ok(Value::Boolean(parsed))
        }
        // Lists are overridden as ';'-separated strings, matching how
        // procedure files are usually passed on the command line.
        Value::Array(items) if items.iter().all(Value::is_str) => Ok(Value::Array(
            raw_value
                .split(';')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(|item| Value::String(item.to_owned()))
                .collect(),
        )),
        Value::Datetime(_) | Value::Array(_) | Value::Table(_) => {
            Err(ConfigError::UnsupportedOverrideType {
                key: key_path.to_owned(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use super::{AppConfig, ConfigError};

    const SAMPLE: &str = r#"
[logging]
level = "debug"
human_friendly = false

[server]
host = "127.0.0.1"
port = 9000

[wire]
format = "json"
compression = "none"
max_frame_size_bytes = 1024

[pool]
size = 3
idle_wait_ms = 250

[auth]
enabled = true
users_file = "/etc/graphwire/users"
rechallenge = "never"
"#;

    fn write_temp_config(content: &str, suffix: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "graphwire-config-test-{suffix}-{}.toml",
            std::process::id()
        ));
        fs::write(&path, content).expect("failed to write temp config");
        path
    }

    #[test]
    fn loads_config_from_toml_without_overrides() {
        let path = write_temp_config(SAMPLE, "plain");

        let config = AppConfig::load_from_toml_with_args(&path, Vec::<String>::new())
            .expect("config should load");
        fs::remove_file(path).expect("temp config cleanup should succeed");

        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.wire.format, "json");
        assert_eq!(config.pool.size, 3);
        assert!(config.auth.enabled);
        assert!(config.procedures.files.is_empty());
        assert!(config.engine.fixtures_file.is_empty());
    }

    #[test]
    fn argv_overrides_matching_toml_paths() {
        let path = write_temp_config(SAMPLE, "override");

        let config = AppConfig::load_from_toml_with_args(
            &path,
            vec![
                "--logging.level".to_owned(),
                "info".to_owned(),
                "--pool.size".to_owned(),
                "8".to_owned(),
                "--auth.enabled".to_owned(),
                "false".to_owned(),
            ],
        )
        .expect("config with overrides should load");
        fs::remove_file(path).expect("temp config cleanup should succeed");

        assert_eq!(config.logging.level, "info");
        assert_eq!(config.pool.size, 8);
        assert!(!config.auth.enabled);
    }

    #[test]
    fn defaults_are_used_without_config_file() {
        let config = AppConfig::load_with_discovery(vec![
            "--config".to_owned(),
            "/nonexistent/graphwire.toml".to_owned(),
        ]);
        assert!(matches!(config, Err(ConfigError::Io { .. })));

        let defaults = AppConfig::load_from_str_with_args(
            super::DEFAULT_CONFIG_TOML,
            "<defaults>",
            Vec::<String>::new(),
        )
        .expect("defaults should parse");
        assert_eq!(defaults.pool.size, 4);
        assert_eq!(defaults.pool.idle_wait_ms, 1000);
        assert_eq!(defaults.wire.format, "msgpack");
        assert_eq!(defaults.auth.rechallenge, "every_failure");
        assert!(defaults.auth.challenge.is_empty());
    }

    #[test]
    fn auth_challenge_is_optional_and_overridable() {
        let path = write_temp_config(SAMPLE, "challenge");
        let from_file = AppConfig::load_from_toml_with_args(&path, Vec::<String>::new())
            .expect("config without challenge should load");
        fs::remove_file(path).expect("temp config cleanup should succeed");
        assert!(from_file.auth.challenge.is_empty());

        let overridden = AppConfig::load_from_str_with_args(
            super::DEFAULT_CONFIG_TOML,
            "<defaults>",
            vec!["--auth.challenge".to_owned(), "who goes there".to_owned()],
        )
        .expect("challenge override should apply");
        assert_eq!(overridden.auth.challenge, "who goes there");
    }

    #[test]
    fn list_override_splits_on_semicolons() {
        let defaults = AppConfig::load_from_str_with_args(
            super::DEFAULT_CONFIG_TOML,
            "<defaults>",
            vec![
                "--procedures.files".to_owned(),
                "a.procs; b.procs".to_owned(),
            ],
        )
        .expect("override should apply");

        assert_eq!(defaults.procedures.files, vec!["a.procs", "b.procs"]);
    }

    #[test]
    fn rejects_unknown_override_path() {
        let path = write_temp_config(SAMPLE, "unknown-path");

        let err = AppConfig::load_from_toml_with_args(
            &path,
            vec!["--logging.nonexistent".to_owned(), "x".to_owned()],
        )
        .expect_err("unknown override key should fail");
        fs::remove_file(path).expect("temp config cleanup should succeed");

        assert!(matches!(err, ConfigError::UnknownPath { .. }));
    }

    #[test]
    fn rejects_mistyped_override_value() {
        let path = write_temp_config(SAMPLE, "mistyped");

        let err = AppConfig::load_from_toml_with_args(
            &path,
            vec!["--pool.size".to_owned(), "many".to_owned()],
        )
        .expect_err("non-integer pool size should fail");
        fs::remove_file(path).expect("temp config cleanup should succeed");

        assert!(matches!(
            err,
            ConfigError::InvalidValueForType {
                expected: "integer",
                ..
            }
        ));
    }
}
