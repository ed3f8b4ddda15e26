//! Common configuration types and helpers.

mod cli;
mod env;
mod vars;

pub use cli::{CliArgs, is_yaml_file};
pub use env::EnvReader;
pub use vars::{InterpolationResult, interpolate, interpolate_with};

use serde::{Deserialize, Serialize};

use crate::metrics::DEFAULT_SERVER_ADDR;

/// HTTP server configuration (read API, health, and Prometheus endpoint).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Address to bind the HTTP server (default: "0.0.0.0:8000").
    #[serde(default = "default_server_address")]
    pub address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_server_address(),
        }
    }
}

impl ServerConfig {
    /// Read the server section from the environment.
    ///
    /// `API_ADDRESS` wins; otherwise `API_HOST` and `API_PORT` are combined,
    /// each falling back to the default host or port.
    pub fn from_env(env: &mut EnvReader) -> Self {
        if let Some(address) = env.optional("API_ADDRESS") {
            return Self { address };
        }

        let host = env.string("API_HOST", "0.0.0.0");
        let port: u16 = env.parse("API_PORT", 8000);
        Self {
            address: format!("{host}:{port}"),
        }
    }
}

fn default_server_address() -> String {
    DEFAULT_SERVER_ADDR.to_string()
}
