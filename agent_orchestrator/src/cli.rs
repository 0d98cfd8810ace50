//! Command-line interface definitions using clap derive API.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Agent orchestrator CLI
#[derive(Parser)]
#[command(name = "orchestrator-cli")]
#[command(about = "Route requests to pooled agents, select models under budget and keep task memory")]
#[command(version)]
pub struct Cli {
    /// Settings file layered over the built-in defaults
    #[arg(long, global = true)]
    pub settings: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Submit a single request and print its outcome
    Submit {
        /// Request text
        text: String,

        /// Metadata entries as key=value; `task_type=<name>` forces classification
        #[arg(long = "meta", value_parser = parse_key_val)]
        meta: Vec<(String, String)>,
    },
    /// Run a batch of requests from a TOML file
    Run {
        /// Path to the batch file
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Query stored facts
    Facts(FactsArgs),
    /// Print the effective configuration
    Config,
}

#[derive(Args)]
pub struct FactsArgs {
    #[command(flatten)]
    pub selector: FactSelector,

    /// Include superseded facts
    #[arg(long)]
    pub include_superseded: bool,
}

#[derive(Args)]
#[group(required = true, multiple = false)]
pub struct FactSelector {
    /// Facts about this subject
    #[arg(long)]
    pub subject: Option<String>,

    /// Facts carrying this tag
    #[arg(long)]
    pub tag: Option<String>,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", s))?;
    if key.trim().is_empty() {
        return Err(format!("empty key in '{}'", s));
    }
    Ok((key.trim().to_string(), value.to_string()))
}
