//! Configuration sources: files, environment variables and derived flags.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use clap::parser::ValueSource;
use clap::{Arg, ArgAction, Command};
use serde_json::Value;
use tracing::debug;

use super::layer::{coerce_like, ConfigLayer};
use crate::error::ConfigError;

/// Supported configuration file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Yaml,
    Json,
}

impl FileFormat {
    /// Guesses the format from the file extension.
    #[must_use]
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()?.to_ascii_lowercase().as_str() {
            "yaml" | "yml" => Some(Self::Yaml),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// A configuration file registered with the builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSource {
    pub path: PathBuf,
    pub format: FileFormat,
}

impl FileSource {
    /// Reads and parses the file.
    ///
    /// Returns `Ok(None)` when the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::File` for any other read or parse failure.
    pub fn load(&self) -> Result<Option<ConfigLayer>, ConfigError> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "config file not found, skipping");
                return Ok(None);
            }
            Err(e) => return Err(self.error(e)),
        };

        let value: Value = match self.format {
            FileFormat::Json => serde_json::from_str(&text).map_err(|e| self.error(e))?,
            FileFormat::Yaml if text.trim().is_empty() => Value::Null,
            FileFormat::Yaml => serde_yaml::from_str(&text).map_err(|e| self.error(e))?,
        };

        if !(value.is_object() || value.is_null()) {
            return Err(self.error("top-level value must be a mapping"));
        }
        Ok(Some(ConfigLayer::from_value(&value)))
    }

    fn error(&self, err: impl std::fmt::Display) -> ConfigError {
        ConfigError::File {
            path: self.path.clone(),
            message: err.to_string(),
        }
    }
}

/// Merges every file, in registration order, into one layer.
///
/// # Errors
///
/// Propagates the first load failure.
pub fn load_files(files: &[FileSource]) -> Result<ConfigLayer, ConfigError> {
    let mut layer = ConfigLayer::new();
    for file in files {
        if let Some(parsed) = file.load()? {
            layer.merge(&parsed);
        }
    }
    Ok(layer)
}

/// Where environment overrides come from.
#[derive(Debug, Clone, Default)]
pub enum EnvSource {
    #[default]
    Disabled,
    Process { prefix: Option<String> },
    Fixed {
        prefix: Option<String>,
        vars: HashMap<String, String>,
    },
}

/// Maps a dot key to its environment variable name: `server.port` -> `SERVER_PORT`.
#[must_use]
pub fn env_var_name(key: &str, prefix: Option<&str>) -> String {
    let base = key.replace('.', "_").to_uppercase();
    match prefix {
        Some(p) if !p.is_empty() => format!("{}_{base}", p.to_uppercase()),
        _ => base,
    }
}

impl EnvSource {
    /// Builds the environment layer for the currently known keys.
    #[must_use]
    pub fn overlay(&self, known: &ConfigLayer) -> ConfigLayer {
        let (prefix, vars) = match self {
            EnvSource::Disabled => return ConfigLayer::new(),
            EnvSource::Process { prefix } => (prefix.as_deref(), std::env::vars().collect()),
            EnvSource::Fixed { prefix, vars } => (prefix.as_deref(), vars.clone()),
        };

        let mut layer = ConfigLayer::new();
        for (key, existing) in known.iter() {
            if let Some(raw) = vars.get(&env_var_name(key, prefix)) {
                layer.set(key, coerce_like(raw, Some(existing)));
            }
        }
        layer
    }
}

/// Where command-line overrides come from.
#[derive(Debug, Clone, Default)]
pub enum ArgSource {
    #[default]
    Disabled,
    Process,
    Fixed(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlagKind {
    Str,
    Int,
    Float,
    Bool,
}

impl FlagKind {
    fn of(value: &Value) -> Option<Self> {
        match value {
            Value::String(_) => Some(Self::Str),
            Value::Bool(_) => Some(Self::Bool),
            Value::Number(n) if n.is_f64() => Some(Self::Float),
            Value::Number(_) => Some(Self::Int),
            _ => None,
        }
    }
}

impl ArgSource {
    /// Derives one typed flag per known scalar key and overlays the flags
    /// that were passed explicitly.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::CommandLine` when a known flag has a malformed value.
    pub fn overlay(&self, known: &ConfigLayer) -> Result<ConfigLayer, ConfigError> {
        let args: Vec<String> = match self {
            ArgSource::Disabled => return Ok(ConfigLayer::new()),
            ArgSource::Process => std::env::args().skip(1).collect(),
            ArgSource::Fixed(args) => args.clone(),
        };

        let kinds: HashMap<String, FlagKind> = known
            .iter()
            .filter(|(key, _)| {
                let usable = is_flag_name(key);
                if !usable {
                    debug!(key = %key, "no command-line flag for key");
                }
                usable
            })
            .filter_map(|(key, value)| FlagKind::of(value).map(|kind| (key.to_string(), kind)))
            .collect();

        let relevant = select_known_args(&args, &kinds);
        if relevant.is_empty() {
            return Ok(ConfigLayer::new());
        }

        let mut command = Command::new("host")
            .no_binary_name(true)
            .disable_help_flag(true)
            .disable_version_flag(true);
        for (key, kind) in &kinds {
            command = command.arg(flag_for(key, *kind));
        }

        let matches = command
            .try_get_matches_from(relevant)
            .map_err(|e| ConfigError::CommandLine(e.to_string().trim().to_string()))?;

        let mut layer = ConfigLayer::new();
        for (key, kind) in &kinds {
            if matches.value_source(key) != Some(ValueSource::CommandLine) {
                continue;
            }
            let value = match kind {
                FlagKind::Str => matches.get_one::<String>(key).cloned().map(Value::String),
                FlagKind::Int => matches.get_one::<i64>(key).copied().map(Value::from),
                FlagKind::Float => matches
                    .get_one::<f64>(key)
                    .copied()
                    .and_then(serde_json::Number::from_f64)
                    .map(Value::Number),
                FlagKind::Bool => matches.get_one::<bool>(key).copied().map(Value::Bool),
            };
            if let Some(value) = value {
                layer.set(key, value);
            }
        }
        Ok(layer)
    }
}

/// Keys clap accepts as a long flag name.
fn is_flag_name(key: &str) -> bool {
    !key.is_empty()
        && !key.starts_with('-')
        && !key.contains(|c: char| c == '=' || c.is_whitespace())
}

fn flag_for(key: &str, kind: FlagKind) -> Arg {
    let arg = Arg::new(key.to_string())
        .long(key.to_string())
        .help(format!("override for {key}"))
        .action(ArgAction::Set)
        .overrides_with(key.to_string());
    match kind {
        FlagKind::Str => arg.value_parser(clap::value_parser!(String)),
        FlagKind::Int => arg
            .value_parser(clap::value_parser!(i64))
            .allow_negative_numbers(true),
        FlagKind::Float => arg
            .value_parser(clap::value_parser!(f64))
            .allow_negative_numbers(true),
        FlagKind::Bool => arg
            .value_parser(clap::value_parser!(bool))
            .num_args(0..=1)
            .require_equals(true)
            .default_missing_value("true"),
    }
}

/// Keeps only `--key`, `--key=value` and `--key value` tokens for known keys,
/// so unrelated process arguments never reach the parser.
fn select_known_args(args: &[String], kinds: &HashMap<String, FlagKind>) -> Vec<String> {
    let mut selected = Vec::new();
    let mut iter = args.iter().peekable();
    while let Some(token) = iter.next() {
        let Some(flag) = token.strip_prefix("--") else {
            continue;
        };
        let (name, has_value) = match flag.split_once('=') {
            Some((name, _)) => (name, true),
            None => (flag, false),
        };
        let name = name.to_lowercase();
        let Some(kind) = kinds.get(&name) else {
            continue;
        };
        let value = token.find('=').map(|idx| &token[idx..]).unwrap_or_default();
        selected.push(format!("--{name}{value}"));
        if !has_value && *kind != FlagKind::Bool {
            if let Some(next) = iter.next_if(|next| !next.starts_with("--")) {
                selected.push(next.clone());
            }
        }
    }
    selected
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn known() -> ConfigLayer {
        ConfigLayer::from_value(&json!({
            "server": { "port": 8080, "host": "0.0.0.0", "ratio": 0.5 },
            "log": { "console": true }
        }))
    }

    fn args(list: &[&str]) -> ArgSource {
        ArgSource::Fixed(list.iter().map(ToString::to_string).collect())
    }

    #[test]
    fn format_from_extension() {
        assert_eq!(FileFormat::from_path(Path::new("a.yaml")), Some(FileFormat::Yaml));
        assert_eq!(FileFormat::from_path(Path::new("a.YML")), Some(FileFormat::Yaml));
        assert_eq!(FileFormat::from_path(Path::new("a.json")), Some(FileFormat::Json));
        assert_eq!(FileFormat::from_path(Path::new("a.toml")), None);
    }

    #[test]
    fn missing_file_is_skipped() {
        let source = FileSource {
            path: PathBuf::from("/definitely/not/here.yaml"),
            format: FileFormat::Yaml,
        };
        assert!(source.load().unwrap().is_none());
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();
        let source = FileSource {
            path: path.clone(),
            format: FileFormat::Json,
        };
        let err = source.load().unwrap_err();
        assert!(matches!(err, ConfigError::File { path: p, .. } if p == path));
    }

    #[test]
    fn yaml_file_is_flattened() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.yaml");
        std::fs::write(&path, "server:\n  port: 9000\nlog:\n  level: debug\n").unwrap();
        let layer = FileSource {
            path,
            format: FileFormat::Yaml,
        }
        .load()
        .unwrap()
        .unwrap();
        assert_eq!(layer.get("server.port"), Some(&json!(9000)));
        assert_eq!(layer.get("log.level"), Some(&json!("debug")));
    }

    #[test]
    fn env_names_use_underscores() {
        assert_eq!(env_var_name("server.port", None), "SERVER_PORT");
        assert_eq!(env_var_name("log.max_files", Some("app")), "APP_LOG_MAX_FILES");
    }

    #[test]
    fn env_overlay_only_touches_known_keys() {
        let vars = HashMap::from([
            ("SERVER_PORT".to_string(), "9090".to_string()),
            ("UNRELATED".to_string(), "x".to_string()),
        ]);
        let layer = EnvSource::Fixed { prefix: None, vars }.overlay(&known());
        assert_eq!(layer.len(), 1);
        assert_eq!(layer.get("server.port"), Some(&json!(9090)));
    }

    #[test]
    fn flags_are_typed_by_known_value() {
        let layer = args(&[
            "--server.port",
            "7000",
            "--server.host=127.0.0.1",
            "--server.ratio",
            "-0.25",
            "--log.console=false",
        ])
        .overlay(&known())
        .unwrap();
        assert_eq!(layer.get("server.port"), Some(&json!(7000)));
        assert_eq!(layer.get("server.host"), Some(&json!("127.0.0.1")));
        assert_eq!(layer.get("server.ratio"), Some(&json!(-0.25)));
        assert_eq!(layer.get("log.console"), Some(&json!(false)));
    }

    #[test]
    fn bare_bool_flag_means_true() {
        let known = ConfigLayer::from_value(&json!({"debug": false}));
        let layer = args(&["--debug"]).overlay(&known).unwrap();
        assert_eq!(layer.get("debug"), Some(&json!(true)));
    }

    #[test]
    fn unknown_arguments_are_ignored() {
        let layer = args(&["serve", "--verbose", "--test-threads", "1"])
            .overlay(&known())
            .unwrap();
        assert!(layer.is_empty());
    }

    #[test]
    fn repeated_flag_keeps_the_last_value() {
        let layer = args(&["--server.port", "2", "--server.port=3"])
            .overlay(&known())
            .unwrap();
        assert_eq!(layer.get("server.port"), Some(&json!(3)));
    }

    #[test]
    fn keys_that_cannot_be_flags_are_skipped() {
        let known = ConfigLayer::from_value(&json!({"-x": 1, "a=b": 2, "port": 1}));
        let layer = args(&["--port", "2", "---x", "5"]).overlay(&known).unwrap();
        assert_eq!(layer.len(), 1);
        assert_eq!(layer.get("port"), Some(&json!(2)));
        assert!(!is_flag_name("-x"));
        assert!(!is_flag_name(""));
        assert!(is_flag_name("server.port"));
    }

    #[test]
    fn malformed_typed_flag_is_an_error() {
        let err = args(&["--server.port", "eighty"]).overlay(&known()).unwrap_err();
        assert!(matches!(err, ConfigError::CommandLine(_)));
    }
}
