//! Command-line arguments.

use std::path::{Path, PathBuf};

use clap::Parser;

/// Check if a path has a YAML extension.
pub fn is_yaml_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext == "yaml" || ext == "yml")
        .unwrap_or(false)
}

#[derive(Parser, Debug)]
#[command(version, about = "Aggregate numeric events from a queue into per-type statistics")]
pub struct CliArgs {
    /// Path to a YAML configuration file. When omitted, settings are read
    /// from environment variables.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level used when RUST_LOG is not set (overrides LOG_LEVEL).
    #[arg(long)]
    pub log_level: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_yaml_file() {
        assert!(is_yaml_file(Path::new("tally.yaml")));
        assert!(is_yaml_file(Path::new("conf/tally.yml")));
        assert!(!is_yaml_file(Path::new("tally.toml")));
        assert!(!is_yaml_file(Path::new("tally")));
    }

    #[test]
    fn test_cli_args_parse() {
        let args = CliArgs::parse_from(["tally", "--config", "tally.yaml", "--log-level", "debug"]);
        assert_eq!(args.config, Some(PathBuf::from("tally.yaml")));
        assert_eq!(args.log_level.as_deref(), Some("debug"));

        let args = CliArgs::parse_from(["tally"]);
        assert!(args.config.is_none());
    }
}
