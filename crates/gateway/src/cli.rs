//! CLI surface for the `opta-lmx` binary.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use lmx_domain::config::{Config, ConfigSeverity};

pub const DEFAULT_CONFIG_PATH: &str = "opta-lmx.yaml";

#[derive(Parser)]
#[command(name = "opta-lmx", about = "Single-host inference control plane")]
pub struct Cli {
    /// Path to the YAML config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the server (default).
    Serve,
    /// Run environment checks and exit.
    Doctor,
    /// Config inspection.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Print the version.
    Version,
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Validate the config file and report issues.
    Validate,
    /// Print the effective config (secrets redacted).
    Show,
}

/// Load config from `--config`, the default path, or built-in defaults
/// when no file exists.
pub fn load_config(path: Option<&PathBuf>) -> anyhow::Result<(Config, Option<PathBuf>)> {
    let candidate = path
        .cloned()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    if candidate.exists() {
        let config = Config::load(&candidate)
            .map_err(|e| anyhow::anyhow!("loading {}: {e}", candidate.display()))?;
        Ok((config, Some(candidate)))
    } else if path.is_some() {
        anyhow::bail!("config file not found: {}", candidate.display());
    } else {
        Ok((Config::default(), None))
    }
}

/// `config validate` — returns false when any error-severity issue exists.
pub fn validate(config: &Config) -> bool {
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => println!("warning: {issue}"),
            ConfigSeverity::Error => println!("error: {issue}"),
        }
    }
    let ok = !issues
        .iter()
        .any(|issue| issue.severity == ConfigSeverity::Error);
    if ok {
        println!("config ok ({} warning(s))", issues.len());
    }
    ok
}

/// `config show` — effective config as YAML with secret fields redacted.
pub fn show(config: &Config) {
    let mut value = match serde_json::to_value(config) {
        Ok(value) => value,
        Err(e) => {
            println!("failed to render config: {e}");
            return;
        }
    };
    lmx_domain::redact::redact_value(&mut value);
    match serde_yaml::to_string(&value) {
        Ok(yaml) => println!("{yaml}"),
        Err(e) => println!("failed to render config: {e}"),
    }
}

/// `doctor` — environment checks; returns overall pass/fail.
pub async fn doctor(config: &Config) -> bool {
    let mut ok = true;

    if !validate(config) {
        ok = false;
    }

    match std::fs::create_dir_all(&config.models.models_directory) {
        Ok(()) => println!("ok: models directory {}", config.models.models_directory.display()),
        Err(e) => {
            println!(
                "fail: models directory {}: {e}",
                config.models.models_directory.display()
            );
            ok = false;
        }
    }

    let http = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(3))
        .build()
        .expect("http client");
    for (kind, endpoint) in &config.models.backends {
        let url = format!("{}/v1/models", endpoint.base_url.trim_end_matches('/'));
        match http.get(&url).send().await {
            Ok(response) if response.status().is_success() => {
                println!("ok: backend {kind} at {}", endpoint.base_url);
            }
            Ok(response) => {
                println!(
                    "warn: backend {kind} at {} returned {}",
                    endpoint.base_url,
                    response.status()
                );
            }
            Err(e) => {
                println!("fail: backend {kind} at {}: {e}", endpoint.base_url);
                ok = false;
            }
        }
    }

    for node in &config.helper_nodes {
        let url = format!("{}/health", node.base_url.trim_end_matches('/'));
        match http.get(&url).send().await {
            Ok(response) if response.status().is_success() => {
                println!("ok: helper {} at {}", node.id, node.base_url);
            }
            _ => println!("warn: helper {} at {} unreachable", node.id, node.base_url),
        }
    }

    ok
}
