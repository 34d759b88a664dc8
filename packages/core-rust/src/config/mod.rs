//! Layered configuration composer.
//!
//! Precedence, lowest to highest: defaults < files < environment < command
//! line. The order is fixed no matter in which order sources are added.
//! The composed snapshot is published through `ArcSwap`, so readers never
//! block while the file watcher re-merges the file layer.
//!
//! Typed values already decoded from a snapshot (for example options structs
//! bound at build time) are not refreshed by a re-merge. Code that needs live
//! values reads [`Configuration`] again or subscribes to [`Configuration::changes`].

pub mod layer;
pub mod sources;
pub mod watcher;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tracing::debug;

pub use layer::ConfigLayer;
pub use sources::{ArgSource, EnvSource, FileFormat, FileSource};
pub use watcher::ConfigWatcher;

use crate::error::ConfigError;

// ---------------------------------------------------------------------------
// ConfigBuilder
// ---------------------------------------------------------------------------

/// Collects configuration sources and composes them into a [`Configuration`].
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    defaults: ConfigLayer,
    files: Vec<FileSource>,
    env: EnvSource,
    args: ArgSource,
    issues: Vec<ConfigError>,
}

impl ConfigBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a built-in default. Objects are flattened below `key`.
    pub fn set_default(&mut self, key: &str, value: impl Serialize) -> &mut Self {
        match serde_json::to_value(value) {
            Ok(value) => self.defaults.set(key, value),
            Err(e) => self.issues.push(ConfigError::Default {
                key: key.to_string(),
                message: e.to_string(),
            }),
        }
        self
    }

    /// Registers a default only when no default exists for `key` yet.
    pub fn set_default_if_absent(&mut self, key: &str, value: impl Serialize) -> &mut Self {
        let present = self.defaults.get(key).is_some()
            || self
                .defaults
                .keys()
                .any(|k| k.starts_with(&format!("{}.", layer::normalize_key(key))));
        if !present {
            self.set_default(key, value);
        }
        self
    }

    /// Registers every leaf of `value` below `key` that has no default yet.
    pub fn merge_defaults(&mut self, key: &str, value: impl Serialize) -> &mut Self {
        let value = match serde_json::to_value(value) {
            Ok(value) => value,
            Err(e) => {
                self.issues.push(ConfigError::Default {
                    key: key.to_string(),
                    message: e.to_string(),
                });
                return self;
            }
        };
        let mut incoming = ConfigLayer::new();
        incoming.set(key, value);
        for (leaf, value) in incoming.iter() {
            self.set_default_if_absent(leaf, value.clone());
        }
        self
    }

    /// Adds a file source. A missing file is skipped at build time.
    pub fn add_file(&mut self, path: impl Into<PathBuf>, format: FileFormat) -> &mut Self {
        self.files.push(FileSource {
            path: path.into(),
            format,
        });
        self
    }

    pub fn add_yaml_file(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.add_file(path, FileFormat::Yaml)
    }

    pub fn add_json_file(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.add_file(path, FileFormat::Json)
    }

    /// Overlays process environment variables (`server.port` -> `SERVER_PORT`).
    pub fn add_environment(&mut self) -> &mut Self {
        self.env = EnvSource::Process { prefix: None };
        self
    }

    /// Like [`add_environment`](Self::add_environment) with a `PREFIX_` in front of every name.
    pub fn add_environment_with_prefix(&mut self, prefix: impl Into<String>) -> &mut Self {
        self.env = EnvSource::Process {
            prefix: Some(prefix.into()),
        };
        self
    }

    /// Uses a fixed set of environment variables instead of the process environment.
    pub fn with_env_vars<I, K, V>(&mut self, vars: I) -> &mut Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let prefix = match &self.env {
            EnvSource::Process { prefix } | EnvSource::Fixed { prefix, .. } => prefix.clone(),
            EnvSource::Disabled => None,
        };
        self.env = EnvSource::Fixed {
            prefix,
            vars: vars
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect::<HashMap<_, _>>(),
        };
        self
    }

    /// Derives flags from the known keys and overlays the process arguments.
    pub fn add_command_line(&mut self) -> &mut Self {
        self.args = ArgSource::Process;
        self
    }

    /// Uses fixed arguments (without the binary name) instead of the process arguments.
    pub fn with_args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = ArgSource::Fixed(args.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn files(&self) -> &[FileSource] {
        &self.files
    }

    /// Composes every source into a [`Configuration`].
    ///
    /// # Errors
    ///
    /// Returns the first invalid default, any file error other than a
    /// missing file, or a malformed command-line value.
    pub fn build(self) -> Result<Configuration, ConfigError> {
        if let Some(issue) = self.issues.into_iter().next() {
            return Err(issue);
        }

        let file = sources::load_files(&self.files)?;

        let mut known = self.defaults.clone();
        known.merge(&file);
        let env = self.env.overlay(&known);
        let flags = self.args.overlay(&known)?;

        let layers = Layers {
            defaults: self.defaults,
            file,
            env,
            flags,
        };
        let snapshot = layers.compose();
        debug!(keys = snapshot.values.len(), "configuration composed");

        let (changes, _) = watch::channel(0);
        Ok(Configuration {
            inner: Arc::new(ConfigState {
                snapshot: ArcSwap::from_pointee(snapshot),
                layers: Mutex::new(layers),
                files: self.files,
                changes,
            }),
        })
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Layers {
    defaults: ConfigLayer,
    file: ConfigLayer,
    env: ConfigLayer,
    flags: ConfigLayer,
}

impl Layers {
    fn compose(&self) -> ConfigSnapshot {
        let mut merged = self.defaults.clone();
        merged.merge(&self.file);
        merged.merge(&self.env);
        merged.merge(&self.flags);
        let tree = merged.to_tree();
        ConfigSnapshot {
            values: merged,
            tree,
        }
    }
}

/// An immutable view of the composed key space.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    values: ConfigLayer,
    tree: Value,
}

impl ConfigSnapshot {
    /// Returns the leaf value, or the subtree, stored at `key`.
    #[must_use]
    pub fn lookup(&self, key: &str) -> Option<Value> {
        if let Some(value) = self.values.get(key) {
            return Some(value.clone());
        }
        let mut node = &self.tree;
        for part in layer::normalize_key(key).split('.') {
            node = node.as_object()?.get(part)?;
        }
        Some(node.clone())
    }

    #[must_use]
    pub fn tree(&self) -> &Value {
        &self.tree
    }

    #[must_use]
    pub fn values(&self) -> &ConfigLayer {
        &self.values
    }
}

#[derive(Debug)]
struct ConfigState {
    snapshot: ArcSwap<ConfigSnapshot>,
    layers: Mutex<Layers>,
    files: Vec<FileSource>,
    changes: watch::Sender<u64>,
}

/// Shared handle to the composed configuration.
#[derive(Debug, Clone)]
pub struct Configuration {
    inner: Arc<ConfigState>,
}

impl Configuration {
    /// Returns the current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        self.inner.snapshot.load_full()
    }

    /// Decodes the value or subtree at `key`.
    ///
    /// # Errors
    ///
    /// Returns `MissingKey` if nothing is stored at `key`, or `Decode` if the
    /// stored value does not fit `T`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, ConfigError> {
        let value = self
            .snapshot()
            .lookup(key)
            .ok_or_else(|| ConfigError::MissingKey(key.to_string()))?;
        decode(key, value)
    }

    /// Decodes `key`, falling back to `default` when the key is absent or invalid.
    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.get(key).unwrap_or(default)
    }

    #[must_use]
    pub fn get_string(&self, key: &str) -> Option<String> {
        match self.snapshot().lookup(key)? {
            Value::String(s) => Some(s),
            Value::Null | Value::Object(_) | Value::Array(_) => None,
            other => Some(other.to_string()),
        }
    }

    #[must_use]
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).ok()
    }

    #[must_use]
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).ok()
    }

    #[must_use]
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).ok()
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.snapshot().lookup(key).is_some()
    }

    /// All leaf keys, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.snapshot().values.keys().map(str::to_string).collect()
    }

    /// Decodes the section below `key` into an options struct.
    ///
    /// # Errors
    ///
    /// Returns `MissingSection` if the section is absent or not a mapping.
    pub fn section<T: DeserializeOwned>(&self, key: &str) -> Result<T, ConfigError> {
        match self.snapshot().lookup(key) {
            Some(value @ Value::Object(_)) => decode(key, value),
            _ => Err(ConfigError::MissingSection(key.to_string())),
        }
    }

    /// Decodes the whole tree.
    ///
    /// # Errors
    ///
    /// Returns `Decode` if the tree does not fit `T`.
    pub fn bind<T: DeserializeOwned>(&self) -> Result<T, ConfigError> {
        decode("<root>", self.snapshot().tree.clone())
    }

    /// Number of re-merges applied since build.
    #[must_use]
    pub fn generation(&self) -> u64 {
        *self.inner.changes.borrow()
    }

    /// Subscribes to re-merge notifications.
    #[must_use]
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.inner.changes.subscribe()
    }

    #[must_use]
    pub fn files(&self) -> &[FileSource] {
        &self.inner.files
    }

    /// Re-reads the file sources and re-merges the file layer only.
    ///
    /// Environment and command-line overrides are kept. On failure the
    /// previous snapshot stays active.
    ///
    /// # Errors
    ///
    /// Returns the file error that prevented the re-merge.
    pub fn reload_files(&self) -> Result<(), ConfigError> {
        let file = sources::load_files(&self.inner.files)?;
        let mut layers = self.inner.layers.lock();
        layers.file = file;
        self.inner.snapshot.store(Arc::new(layers.compose()));
        drop(layers);
        self.inner.changes.send_modify(|generation| *generation += 1);
        Ok(())
    }

    /// Starts watching the configured files; see [`ConfigWatcher`].
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Watch` if the platform watcher cannot be created.
    pub fn watch(&self) -> Result<ConfigWatcher, ConfigError> {
        ConfigWatcher::start(self.clone())
    }
}

fn decode<T: DeserializeOwned>(key: &str, value: Value) -> Result<T, ConfigError> {
    serde_json::from_value(value).map_err(|source| ConfigError::Decode {
        key: key.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde::Deserialize;
    use serde_json::json;

    use super::*;

    fn write(dir: &tempfile::TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct ServerSection {
        port: u16,
        host: String,
    }

    #[test]
    fn precedence_is_fixed_regardless_of_call_order() {
        let dir = tempfile::tempdir().unwrap();
        let file = write(&dir, "app.yaml", "server:\n  port: 2000\n  host: file\n");

        let mut builder = ConfigBuilder::new();
        builder
            .with_args(["--server.port", "4000"])
            .with_env_vars([("SERVER_PORT", "3000"), ("SERVER_HOST", "env")])
            .add_yaml_file(&file)
            .set_default("server", json!({"port": 1000, "host": "default"}));
        let config = builder.build().unwrap();

        assert_eq!(config.get::<u16>("server.port").unwrap(), 4000);
        assert_eq!(config.get_string("server.host").as_deref(), Some("env"));
        assert_eq!(
            config.section::<ServerSection>("server").unwrap(),
            ServerSection {
                port: 4000,
                host: "env".to_string()
            }
        );
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let mut builder = ConfigBuilder::new();
        builder
            .set_default("name", "demo")
            .add_yaml_file("/no/such/config.yaml");
        let config = builder.build().unwrap();
        assert_eq!(config.get_string("name").as_deref(), Some("demo"));
    }

    #[test]
    fn malformed_file_aborts_build() {
        let dir = tempfile::tempdir().unwrap();
        let file = write(&dir, "app.yaml", "server: [unclosed\n");
        let mut builder = ConfigBuilder::new();
        builder.add_yaml_file(&file);
        assert!(matches!(builder.build(), Err(ConfigError::File { .. })));
    }

    #[test]
    fn json_and_yaml_files_merge_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = write(&dir, "a.yaml", "a: 1\nb: 1\n");
        let json = write(&dir, "b.json", r#"{"b": 2, "c": {"d": true}}"#);
        let mut builder = ConfigBuilder::new();
        builder.add_yaml_file(&yaml).add_json_file(&json);
        let config = builder.build().unwrap();
        assert_eq!(config.get_i64("a"), Some(1));
        assert_eq!(config.get_i64("b"), Some(2));
        assert_eq!(config.get_bool("c.d"), Some(true));
        assert_eq!(config.keys(), vec!["a", "b", "c.d"]);
    }

    #[test]
    fn missing_key_and_section_are_errors() {
        let mut builder = ConfigBuilder::new();
        builder.set_default("log.level", "info");
        let config = builder.build().unwrap();
        assert!(matches!(
            config.get::<String>("log.file"),
            Err(ConfigError::MissingKey(_))
        ));
        assert!(matches!(
            config.section::<ServerSection>("server"),
            Err(ConfigError::MissingSection(_))
        ));
        assert!(matches!(
            config.section::<ServerSection>("log.level"),
            Err(ConfigError::MissingSection(_))
        ));
        assert_eq!(config.get_or("log.file", "stdout".to_string()), "stdout");
    }

    #[test]
    fn reload_keeps_env_and_flag_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let file = write(&dir, "app.yaml", "server:\n  port: 1\n  host: a\nname: one\n");
        let mut builder = ConfigBuilder::new();
        builder
            .add_yaml_file(&file)
            .with_env_vars([("SERVER_PORT", "9999")])
            .with_args(["--name=flag"]);
        let config = builder.build().unwrap();
        let mut changes = config.changes();

        std::fs::write(&file, "server:\n  port: 2\n  host: b\nname: two\nextra: 5\n").unwrap();
        config.reload_files().unwrap();

        assert_eq!(config.get_i64("server.port"), Some(9999));
        assert_eq!(config.get_string("server.host").as_deref(), Some("b"));
        assert_eq!(config.get_string("name").as_deref(), Some("flag"));
        assert_eq!(config.get_i64("extra"), Some(5));
        assert_eq!(config.generation(), 1);
        assert!(changes.has_changed().unwrap());
    }

    #[test]
    fn failed_reload_keeps_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let file = write(&dir, "app.json", r#"{"a": 1}"#);
        let mut builder = ConfigBuilder::new();
        builder.add_json_file(&file);
        let config = builder.build().unwrap();

        std::fs::write(&file, "{ broken").unwrap();
        assert!(config.reload_files().is_err());
        assert_eq!(config.get_i64("a"), Some(1));
        assert_eq!(config.generation(), 0);
    }

    #[test]
    fn held_snapshot_is_not_refreshed() {
        let dir = tempfile::tempdir().unwrap();
        let file = write(&dir, "app.json", r#"{"a": 1}"#);
        let mut builder = ConfigBuilder::new();
        builder.add_json_file(&file);
        let config = builder.build().unwrap();

        let held = config.snapshot();
        std::fs::write(&file, r#"{"a": 2}"#).unwrap();
        config.reload_files().unwrap();

        assert_eq!(held.lookup("a"), Some(json!(1)));
        assert_eq!(config.get_i64("a"), Some(2));
    }

    #[test]
    fn set_default_if_absent_respects_existing_subtree() {
        let mut builder = ConfigBuilder::new();
        builder
            .set_default("server.port", "9000")
            .set_default_if_absent("server", json!({"port": "8080"}))
            .set_default_if_absent("log.level", "info");
        let config = builder.build().unwrap();
        assert_eq!(config.get_string("server.port").as_deref(), Some("9000"));
        assert_eq!(config.get_string("log.level").as_deref(), Some("info"));
    }

    #[test]
    fn merge_defaults_fills_only_missing_leaves() {
        let mut builder = ConfigBuilder::new();
        builder
            .set_default("log.level", "debug")
            .merge_defaults("log", json!({"level": "info", "console": true}));
        let config = builder.build().unwrap();
        assert_eq!(config.get_string("log.level").as_deref(), Some("debug"));
        assert_eq!(config.get_bool("log.console"), Some(true));
    }

    proptest! {
        #[test]
        fn highest_precedence_source_wins(
            default in proptest::option::of(0i64..1000),
            file in proptest::option::of(0i64..1000),
            env in proptest::option::of(0i64..1000),
            flag in proptest::option::of(0i64..1000),
        ) {
            let dir = tempfile::tempdir().unwrap();
            let mut builder = ConfigBuilder::new();
            // Flags and env only apply to keys known from defaults or files.
            builder.set_default("anchor", 0);
            if let Some(v) = default {
                builder.set_default("value", v);
            }
            if let Some(v) = file {
                let path = write(&dir, "app.json", &format!(r#"{{"value": {v}}}"#));
                builder.add_json_file(path);
            }
            let known = default.is_some() || file.is_some();
            if let Some(v) = env {
                builder.with_env_vars([("VALUE", v.to_string())]);
            }
            if let Some(v) = flag {
                builder.with_args(["--value".to_string(), v.to_string()]);
            }
            let config = builder.build().unwrap();

            let expected = if known {
                flag.or(env).or(file).or(default)
            } else {
                None
            };
            prop_assert_eq!(config.get_i64("value"), expected);
        }
    }
}
