//! CLI argument parsing using clap

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Execution mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExecutionMode {
    /// Coordinator mode - run rounds against remote participant services
    Coordinator,
    /// Local mode - run rounds against in-process participants that read
    /// their databases directly
    Local,
    /// Service mode - serve partial aggregates for one site
    Service,
}

/// fedstat - federated aggregate statistics
#[derive(Parser, Debug)]
#[command(name = "fedstat")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Execution mode: coordinator, local, or service
    #[arg(value_enum)]
    pub mode: ExecutionMode,

    // === Configuration File ===
    /// TOML configuration file (coordinator and local modes)
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Validate configuration and print the plan without running any round
    #[arg(long)]
    pub dry_run: bool,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,

    // === Round Options (override [coordinator]) ===
    /// Minimum number of partials for a round to complete
    #[arg(long)]
    pub minimum_quorum: Option<usize>,

    /// Round deadline (e.g., 500ms, 30s, 2m)
    #[arg(long)]
    pub round_deadline: Option<String>,

    /// Fraction of participants sampled per round (0 < f <= 1)
    #[arg(long)]
    pub fraction_sample: Option<f64>,

    /// Seed for reproducible sampling
    #[arg(long)]
    pub sample_seed: Option<u64>,

    /// Participants that must answer a probe before the first round
    #[arg(long)]
    pub min_participants: Option<usize>,

    // === Output Options ===
    /// JSON report file path
    #[arg(long)]
    pub json_output: Option<PathBuf>,

    // === Service Options ===
    /// Participant id announced to the coordinator (default: host name)
    #[arg(long, env = "FEDSTAT_PARTICIPANT_ID")]
    pub participant_id: Option<String>,

    /// Port for the service to listen on (service mode only)
    #[arg(long, default_value = "9999")]
    pub listen_port: u16,

    /// Site database URL (sqlite:// or postgres://)
    #[arg(long, env = "FEDSTAT_DATABASE_URL")]
    pub database_url: Option<String>,

    /// Table the site's queries run against
    #[arg(long)]
    pub table: Option<String>,
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate CLI arguments
    pub fn validate(&self) -> anyhow::Result<()> {
        match self.mode {
            ExecutionMode::Service => {
                if self.database_url.is_none() {
                    anyhow::bail!("--database-url is required in service mode");
                }
                if self.table.is_none() {
                    anyhow::bail!("--table is required in service mode");
                }
            }
            ExecutionMode::Coordinator | ExecutionMode::Local => {
                if self.config.is_none() {
                    anyhow::bail!("--config is required in {:?} mode", self.mode);
                }
            }
        }

        if let Some(fraction) = self.fraction_sample {
            if !(fraction > 0.0 && fraction <= 1.0) {
                anyhow::bail!("fraction_sample must be in (0, 1], got {}", fraction);
            }
        }
        if self.minimum_quorum == Some(0) {
            anyhow::bail!("minimum_quorum must be at least 1");
        }

        Ok(())
    }
}
