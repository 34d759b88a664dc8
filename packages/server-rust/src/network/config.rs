//! Web host options, bound from the `server` configuration section.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Serving mode. `Release` and `Test` only log failed requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServeMode {
    Debug,
    #[default]
    Release,
    Test,
}

impl ServeMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ServeMode::Debug => "debug",
            ServeMode::Release => "release",
            ServeMode::Test => "test",
        }
    }

    /// Whether successful requests are logged too.
    #[must_use]
    pub fn logs_every_request(self) -> bool {
        self == ServeMode::Debug
    }
}

impl fmt::Display for ServeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "debug" => Ok(ServeMode::Debug),
            "release" => Ok(ServeMode::Release),
            "test" => Ok(ServeMode::Test),
            "" => Err("server mode is empty".to_string()),
            other => Err(format!(
                "server mode {other:?} is not one of debug, release, test"
            )),
        }
    }
}

/// HTTP listener settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebHostOptions {
    /// Bind address.
    pub host: String,
    /// Port, kept as a string so that an empty value is detectable. `"0"` means OS-assigned.
    #[serde(deserialize_with = "string_or_number")]
    pub port: String,
    /// `debug`, `release` or `test`.
    pub mode: String,
    /// Upper bound for reading a request body.
    pub read_timeout_secs: u64,
    /// Upper bound for producing a response; exceeded requests get 408.
    pub write_timeout_secs: u64,
    /// Keep-alive idle and header read bound per connection.
    pub idle_timeout_secs: u64,
    /// Grace period for in-flight requests on shutdown.
    pub shutdown_timeout_secs: u64,
    /// Origins allowed by the CORS layer when it is enabled.
    pub cors_origins: Vec<String>,
}

impl Default for WebHostOptions {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: "8080".to_string(),
            mode: ServeMode::Release.as_str().to_string(),
            read_timeout_secs: 15,
            write_timeout_secs: 15,
            idle_timeout_secs: 60,
            shutdown_timeout_secs: 10,
            cors_origins: vec!["*".to_string()],
        }
    }
}

impl WebHostOptions {
    /// Every problem with these options; empty when they are usable.
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if self.host.trim().is_empty() {
            issues.push("server host is empty".to_string());
        }
        if self.port.trim().is_empty() {
            issues.push("server port is empty".to_string());
        } else if self.port.trim().parse::<u16>().is_err() {
            issues.push(format!("server port {:?} is not a valid port", self.port));
        }
        if let Err(issue) = self.mode.parse::<ServeMode>() {
            issues.push(issue);
        }
        for (name, value) in [
            ("read_timeout_secs", self.read_timeout_secs),
            ("write_timeout_secs", self.write_timeout_secs),
            ("idle_timeout_secs", self.idle_timeout_secs),
            ("shutdown_timeout_secs", self.shutdown_timeout_secs),
        ] {
            if value == 0 {
                issues.push(format!("server {name} must be greater than zero"));
            }
        }
        issues
    }

    /// The parsed mode; invalid values fall back to release.
    #[must_use]
    pub fn serve_mode(&self) -> ServeMode {
        self.mode.parse().unwrap_or_default()
    }

    /// `host:port` as given.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host.trim(), self.port.trim())
    }

    #[must_use]
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    #[must_use]
    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Accepts `port: 8080` as well as `port: "8080"`.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Text(String),
        Number(u64),
    }

    Ok(match Port::deserialize(deserializer)? {
        Port::Text(s) => s,
        Port::Number(n) => n.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let options = WebHostOptions::default();
        assert!(options.validate().is_empty());
        assert_eq!(options.serve_mode(), ServeMode::Release);
        assert_eq!(options.address(), "0.0.0.0:8080");
        assert_eq!(options.shutdown_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn every_issue_is_reported() {
        let options = WebHostOptions {
            host: " ".to_string(),
            port: String::new(),
            mode: String::new(),
            write_timeout_secs: 0,
            ..WebHostOptions::default()
        };
        let issues = options.validate();
        assert_eq!(issues.len(), 4, "{issues:?}");
        assert!(issues.contains(&"server port is empty".to_string()));
        assert!(issues.contains(&"server mode is empty".to_string()));
    }

    #[test]
    fn mode_parsing_is_case_insensitive_and_strict() {
        assert_eq!("DEBUG".parse::<ServeMode>(), Ok(ServeMode::Debug));
        assert_eq!(" test ".parse::<ServeMode>(), Ok(ServeMode::Test));
        assert!("verbose".parse::<ServeMode>().is_err());
        assert!(ServeMode::Debug.logs_every_request());
        assert!(!ServeMode::Test.logs_every_request());
    }

    #[test]
    fn port_must_fit_u16() {
        let options = WebHostOptions {
            port: "70000".to_string(),
            ..WebHostOptions::default()
        };
        assert_eq!(options.validate().len(), 1);
    }

    #[test]
    fn partial_section_keeps_defaults() {
        let options: WebHostOptions =
            serde_json::from_value(serde_json::json!({"port": "9090", "mode": "debug"})).unwrap();
        assert_eq!(options.port, "9090");
        assert_eq!(options.idle_timeout_secs, 60);
        assert_eq!(options.cors_origins, vec!["*"]);

        let options: WebHostOptions =
            serde_json::from_value(serde_json::json!({"port": 9091})).unwrap();
        assert_eq!(options.port, "9091");
    }
}
