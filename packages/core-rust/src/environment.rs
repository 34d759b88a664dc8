use serde::{Deserialize, Serialize};

/// Name of the deployment environment, read from `app.environment`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostEnvironment {
    name: String,
}

impl HostEnvironment {
    pub const DEVELOPMENT: &'static str = "development";
    pub const PRODUCTION: &'static str = "production";

    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into().trim().to_lowercase(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True for `development` and its common short form `dev`.
    #[must_use]
    pub fn is_development(&self) -> bool {
        matches!(self.name.as_str(), "development" | "dev")
    }

    #[must_use]
    pub fn is_production(&self) -> bool {
        matches!(self.name.as_str(), "production" | "prod")
    }
}

impl Default for HostEnvironment {
    fn default() -> Self {
        Self::new(Self::PRODUCTION)
    }
}
