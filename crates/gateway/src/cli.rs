//! CLI surface for `weftd`.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use weft_domain::config::Config;

#[derive(Debug, Parser)]
#[command(name = "weftd", about = "The weft orchestration engine")]
pub struct Cli {
    /// Path to weft.toml. Defaults to ./weft.toml when present.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Bind address override (e.g. 0.0.0.0:9000).
    #[arg(long, global = true)]
    pub bind: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the engine server (default).
    Serve,
    #[command(subcommand)]
    Config(ConfigCommand),
    Version,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Validate the config file and report issues.
    Validate,
    /// Print the effective config.
    Show,
}

/// Load config from the given path, `./weft.toml`, or defaults.
pub fn load_config(path: Option<&PathBuf>) -> anyhow::Result<(Config, Option<PathBuf>)> {
    let candidate = path
        .cloned()
        .or_else(|| {
            let default = PathBuf::from("weft.toml");
            default.exists().then_some(default)
        });

    match candidate {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| anyhow::anyhow!("reading {}: {e}", path.display()))?;
            let config: Config = toml::from_str(&raw)
                .map_err(|e| anyhow::anyhow!("parsing {}: {e}", path.display()))?;
            Ok((config, Some(path)))
        }
        None => Ok((Config::default(), None)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn explicit_missing_config_errors() {
        assert!(load_config(Some(&PathBuf::from("/nonexistent/weft.toml"))).is_err());
    }

    #[test]
    fn config_file_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weft.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "[server]\nbind = \"0.0.0.0:9100\"").unwrap();

        let (config, loaded) = load_config(Some(&path)).unwrap();
        assert_eq!(config.server.bind, "0.0.0.0:9100");
        assert_eq!(loaded, Some(path));
    }
}
