//! CLI argument definitions for the Waypoint binary.
//!
//! Priority resolution: CLI args > env vars > config file > defaults.

use clap::Parser;
use std::path::PathBuf;

/// Waypoint: plan towards a goal, execute, recover and replan.
#[derive(Parser, Debug)]
#[command(name = "waypoint", version, about)]
pub struct CliArgs {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short = 'l', long = "log-level")]
    pub log_level: Option<String>,

    /// Concurrent demonstration runs sharing one engine.
    #[arg(short = 'r', long = "runs", default_value_t = 1)]
    pub runs: usize,

    /// Make `addFiles` fail until its circuit opens, forcing a replan.
    #[arg(long = "flaky")]
    pub flaky: bool,

    /// Run independent actions in parallel batches.
    #[arg(long = "parallel")]
    pub parallel: bool,
}

impl CliArgs {
    /// Resolve the configuration file path.
    ///
    /// Priority: --config flag > WAYPOINT_CONFIG env var > ./waypoint.toml.
    pub fn resolve_config_path(&self) -> PathBuf {
        resolve_config_path(self.config.as_ref(), std::env::var("WAYPOINT_CONFIG").ok())
    }

    /// Resolve the log filter.
    ///
    /// Priority: --log-level flag > config file value.
    pub fn resolve_log_level(&self, config_level: &str) -> String {
        self.log_level
            .clone()
            .unwrap_or_else(|| config_level.to_string())
    }
}

fn resolve_config_path(flag: Option<&PathBuf>, env: Option<String>) -> PathBuf {
    if let Some(p) = flag {
        return p.clone();
    }
    if let Some(p) = env.filter(|p| !p.is_empty()) {
        return PathBuf::from(p);
    }
    PathBuf::from("waypoint.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_flag_wins() {
        let flag = PathBuf::from("/etc/waypoint.toml");
        let path = resolve_config_path(Some(&flag), Some("/tmp/env.toml".into()));
        assert_eq!(path, flag);
    }

    #[test]
    fn test_env_before_default() {
        let path = resolve_config_path(None, Some("/tmp/env.toml".into()));
        assert_eq!(path, PathBuf::from("/tmp/env.toml"));
        let path = resolve_config_path(None, Some(String::new()));
        assert_eq!(path, PathBuf::from("waypoint.toml"));
        assert_eq!(resolve_config_path(None, None), PathBuf::from("waypoint.toml"));
    }

    #[test]
    fn test_parse_args() {
        let args = CliArgs::parse_from(["waypoint", "-c", "w.toml", "--runs", "4", "--flaky"]);
        assert_eq!(args.config, Some(PathBuf::from("w.toml")));
        assert_eq!(args.runs, 4);
        assert!(args.flaky);
        assert!(!args.parallel);
        assert_eq!(args.resolve_log_level("warn"), "warn");

        let args = CliArgs::parse_from(["waypoint", "--log-level", "debug"]);
        assert_eq!(args.runs, 1);
        assert_eq!(args.resolve_log_level("info"), "debug");
    }
}
