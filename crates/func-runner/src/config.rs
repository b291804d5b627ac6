//! Application configuration

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde_json::Value;

use func_runner_sdk::Params;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    /// Bundle shared library to load at start-up
    pub bundle_path: Option<PathBuf>,

    /// JSON file holding the bootstrap properties
    pub properties_path: Option<PathBuf>,

    /// Operation to run once after start-up
    pub invoke: Option<String>,

    /// JSON file holding the raw request for `invoke`
    pub request_path: Option<PathBuf>,
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self {
            bundle_path: env::var("FUNC_RUNNER_BUNDLE").ok().map(PathBuf::from),
            properties_path: env::var("FUNC_RUNNER_PROPERTIES").ok().map(PathBuf::from),
            invoke: env::var("FUNC_RUNNER_INVOKE").ok().filter(|s| !s.is_empty()),
            request_path: env::var("FUNC_RUNNER_REQUEST").ok().map(PathBuf::from),
        }
    }

    /// Bootstrap properties, empty when no file is configured
    pub fn load_properties(&self) -> Result<Params> {
        match &self.properties_path {
            Some(path) => read_object(path),
            None => Ok(Params::new()),
        }
    }

    /// Raw request for the start-up invocation, empty when no file is configured
    pub fn load_request(&self) -> Result<Params> {
        match &self.request_path {
            Some(path) => read_object(path),
            None => Ok(Params::new()),
        }
    }
}

fn read_object(path: &Path) -> Result<Params> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let value: Value = serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse {}", path.display()))?;

    match value {
        Value::Object(map) => Ok(map),
        other => bail!(
            "{} must hold a JSON object, found {}",
            path.display(),
            kind_of(&other)
        ),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
