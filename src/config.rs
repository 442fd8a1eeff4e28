use std::{
    path::{Path, PathBuf},
    sync::OnceLock,
};

use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ExplorerError;

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Name of the per-workspace configuration file.
pub const TOML_FILE_NAME: &str = ".vitest-explorer.toml";

/// Main configuration struct for vitest-explorer.
/// Can be loaded from CLI arguments, TOML file, or LSP initialization options.
#[derive(Parser, Debug, Clone, Deserialize, Serialize)]
#[command(name = "vitest-explorer")]
#[command(about = "Bridge between a vitest process and an editor test explorer")]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Directory for log files
    #[arg(long, default_value_t = default_log_dir())]
    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    /// Glob patterns for test files, relative to each workspace folder
    #[arg(long = "include", default_values_t = default_include())]
    #[serde(default = "default_include")]
    pub include: Vec<String>,

    /// Glob patterns for files to leave out of discovery
    #[arg(long = "exclude", default_values_t = default_exclude())]
    #[serde(default = "default_exclude")]
    pub exclude: Vec<String>,

    /// Project name attached to files found by glob discovery
    #[arg(long, default_value_t = String::new())]
    #[serde(default)]
    pub project: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            include: default_include(),
            exclude: default_exclude(),
            project: String::new(),
        }
    }
}

fn default_log_dir() -> String {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("vitest-explorer/logs")
        .to_string_lossy()
        .to_string()
}

fn default_include() -> Vec<String> {
    [
        "**/*.test.{js,mjs,cjs,ts,mts,cts,jsx,tsx}",
        "**/*.spec.{js,mjs,cjs,ts,mts,cts,jsx,tsx}",
    ]
    .map(String::from)
    .to_vec()
}

fn default_exclude() -> Vec<String> {
    ["**/node_modules/**", "**/dist/**"].map(String::from).to_vec()
}

impl Config {
    #[must_use]
    pub fn log_dir(&self) -> PathBuf {
        PathBuf::from(&self.log_dir)
    }

    /// Layer workspace settings over `self`.
    ///
    /// A `.vitest-explorer.toml` in `workspace_dir` wins; otherwise the
    /// `initializationOptions` sent by the editor are used. Only the keys
    /// they set replace values from the command line.
    pub fn with_workspace_overrides(
        &self,
        workspace_dir: &Path,
        options: Option<&Value>,
    ) -> Result<Config, ExplorerError> {
        let toml_path = workspace_dir.join(TOML_FILE_NAME);
        let overrides = match std::fs::read_to_string(&toml_path) {
            Ok(content) => toml::from_str::<ConfigOverrides>(&content)?,
            Err(_) => match options {
                Some(opts) if !opts.is_null() => serde_json::from_value(opts.clone())?,
                _ => ConfigOverrides::default(),
            },
        };
        Ok(overrides.apply(self.clone()))
    }
}

/// The subset of [`Config`] a workspace sets explicitly.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
struct ConfigOverrides {
    log_dir: Option<String>,
    include: Option<Vec<String>>,
    exclude: Option<Vec<String>>,
    project: Option<String>,
}

impl ConfigOverrides {
    fn apply(self, base: Config) -> Config {
        Config {
            log_dir: self.log_dir.unwrap_or(base.log_dir),
            include: self.include.unwrap_or(base.include),
            exclude: self.exclude.unwrap_or(base.exclude),
            project: self.project.unwrap_or(base.project),
        }
    }
}

pub fn init() -> &'static Config {
    CONFIG.get_or_init(Config::parse)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn toml_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(TOML_FILE_NAME),
            "include = [\"src/**/*.check.ts\"]\nproject = \"web\"\n",
        )
        .unwrap();

        let config = Config::default()
            .with_workspace_overrides(dir.path(), None)
            .unwrap();
        assert_eq!(config.include, vec!["src/**/*.check.ts".to_string()]);
        assert_eq!(config.project, "web");
        assert_eq!(config.exclude, default_exclude());
    }

    #[test]
    fn initialization_options_used_without_toml() {
        let dir = tempfile::tempdir().unwrap();
        let options = json!({ "project": "api", "exclude": [] });
        let config = Config::default()
            .with_workspace_overrides(dir.path(), Some(&options))
            .unwrap();
        assert_eq!(config.project, "api");
        assert!(config.exclude.is_empty());
        assert_eq!(config.include, default_include());
    }

    #[test]
    fn defaults_kept_when_nothing_configured() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default()
            .with_workspace_overrides(dir.path(), None)
            .unwrap();
        assert_eq!(config.project, "");
        assert_eq!(config.include.len(), 2);
    }

    #[test]
    fn command_line_values_survive_partial_toml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(TOML_FILE_NAME), "project = \"web\"\n").unwrap();

        let cli = Config::parse_from([
            "vitest-explorer",
            "--log-dir",
            "/var/log/explorer",
            "--include",
            "**/*.check.ts",
        ]);
        let config = cli.with_workspace_overrides(dir.path(), None).unwrap();
        assert_eq!(config.project, "web");
        assert_eq!(config.log_dir, "/var/log/explorer");
        assert_eq!(config.include, vec!["**/*.check.ts".to_string()]);
        assert_eq!(config.exclude, default_exclude());
    }
}
