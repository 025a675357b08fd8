#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

#[cfg(not(any(target_os = "macos", unix)))]
compile_error!("Only macos and unix are currently supported");

use std::path::PathBuf;

use clap::Parser;

/// Announcement delivery with rate limiting and retries
#[derive(Parser, Debug)]
#[command(name = "herald")]
#[command(version, long_about = None)]
struct Cli {
    /// Configuration file, overriding `HERALD_CONFIG` and the default locations
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = match cli.config {
        Some(path) => path,
        None => find_config_file()?,
    };
    let config_content = std::fs::read_to_string(&config_path).map_err(|e| {
        anyhow::anyhow!(
            "Failed to read config from {}: {}",
            config_path.display(),
            e
        )
    })?;
    let herald: herald::controller::Herald = ron::from_str(&config_content)?;

    herald.run().await
}

/// Find the configuration file using the following precedence:
/// 1. `HERALD_CONFIG` environment variable
/// 2. ./herald.config.ron (current working directory)
/// 3. /etc/herald/herald.config.ron (system-wide config)
fn find_config_file() -> anyhow::Result<PathBuf> {
    if let Ok(env_path) = std::env::var("HERALD_CONFIG") {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Ok(path);
        }
        anyhow::bail!(
            "HERALD_CONFIG points to non-existent file: {}",
            path.display()
        );
    }

    let default_paths = [
        PathBuf::from("./herald.config.ron"),
        PathBuf::from("/etc/herald/herald.config.ron"),
    ];

    if let Some(path) = default_paths.iter().find(|path| path.exists()) {
        return Ok(path.clone());
    }

    let paths_tried = default_paths
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    anyhow::bail!(
        "No configuration file found. Tried:\n  - HERALD_CONFIG environment variable\n{paths_tried}"
    )
}
