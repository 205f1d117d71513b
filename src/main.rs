//! fedstat CLI entry point

use anyhow::{Context, Result};
use fedstat::config::cli::{Cli, ExecutionMode};
use fedstat::config::{toml, validator, Config};
use fedstat::distributed::{
    FederationSession, InProcessTransport, ParticipantRegistry, ParticipantService, RoundCoordinator, RoundError,
    RoundOutcome, TcpTransport, Transport,
};
use fedstat::engine::sql::DataSource;
use fedstat::output::{json, text};
use fedstat::worker::LocalSite;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Every round completed
const EXIT_OK: i32 = 0;
/// Any other failure
const EXIT_ERROR: i32 = 1;
/// At least one round aborted on quorum
const EXIT_QUORUM: i32 = 2;

fn main() {
    let cli = Cli::parse_args();
    init_tracing(cli.debug);

    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            EXIT_ERROR
        }
    };
    std::process::exit(code);
}

fn init_tracing(debug: bool) {
    let default = if debug { "fedstat=debug" } else { "fedstat=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    // Ignored: a subscriber may already be installed.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run(cli: Cli) -> Result<i32> {
    cli.validate()?;

    println!("fedstat v{}", env!("CARGO_PKG_VERSION"));
    println!();

    match cli.mode {
        ExecutionMode::Service => run_service(cli).map(|()| EXIT_OK),
        ExecutionMode::Coordinator | ExecutionMode::Local => run_rounds(cli),
    }
}

/// Run in service mode (one participant site)
fn run_service(cli: Cli) -> Result<()> {
    let database_url = cli.database_url.context("--database-url is required in service mode")?;
    let table = cli.table.context("--table is required in service mode")?;
    let participant_id = cli
        .participant_id
        .unwrap_or_else(fedstat::distributed::node_service::default_participant_id);

    let source = DataSource::new(database_url, table).context("Invalid site database")?;
    let service = ParticipantService::new(participant_id, LocalSite::Source(source));

    let runtime = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;
    runtime.block_on(service.run(cli.listen_port))
}

/// Run in coordinator or local mode
fn run_rounds(cli: Cli) -> Result<i32> {
    let config_path = cli.config.clone().context("--config is required")?;
    let config = toml::parse_toml_file(&config_path)?;
    let config = toml::merge_cli_with_config(&cli, config)?;

    validator::validate_config(&config, cli.mode).context("Configuration validation failed")?;
    let queries = config.named_queries()?;

    print_configuration(&config, cli.mode);

    if cli.dry_run {
        println!();
        println!("Dry run mode - configuration validated successfully");
        return Ok(EXIT_OK);
    }
    println!();

    let transport = build_transport(&config, cli.mode)?;
    let mut registry = ParticipantRegistry::new();
    for participant in &config.participants {
        let endpoint = participant.endpoint.clone().unwrap_or_else(|| "in-process".to_string());
        registry.register(participant.id.clone(), endpoint)?;
    }

    let coordinator = RoundCoordinator::new(Arc::clone(&transport), config.coordinator.coordinator_config()?);
    let mut session = FederationSession::new(
        registry.into_shared(),
        transport,
        coordinator,
        config.coordinator.session_config()?,
    );

    let runtime = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;
    let outcomes = runtime.block_on(async {
        session.wait_for_admission().await?;
        Ok::<_, anyhow::Error>(session.run_all(&queries).await)
    })?;

    for outcome in &outcomes {
        text::print_outcome(outcome);
    }
    text::print_summary(&outcomes);

    if let Some(ref path) = cli.json_output {
        json::write_json_output(path, &json::build_report(&outcomes), true)?;
        println!("JSON report written to {}", path.display());
    }

    Ok(exit_code(&outcomes))
}

fn build_transport(config: &Config, mode: ExecutionMode) -> Result<Arc<dyn Transport>> {
    match mode {
        ExecutionMode::Coordinator => Ok(Arc::new(TcpTransport::new(config.coordinator.connect_timeout()?))),
        _ => {
            let mut transport = InProcessTransport::new();
            for participant in &config.participants {
                let (Some(url), Some(table)) = (&participant.database_url, &participant.table) else {
                    anyhow::bail!("Participant '{}': database_url and table are required", participant.id);
                };
                let source = DataSource::new(url.clone(), table.clone())
                    .with_context(|| format!("Participant '{}'", participant.id))?;
                transport.add_site(participant.id.clone(), LocalSite::Source(source));
            }
            Ok(Arc::new(transport))
        }
    }
}

fn exit_code(outcomes: &[RoundOutcome]) -> i32 {
    let mut code = EXIT_OK;
    for outcome in outcomes {
        match outcome.result {
            Ok(_) => {}
            Err(RoundError::QuorumNotMet(_)) => code = code.max(EXIT_QUORUM),
            Err(_) => return EXIT_ERROR,
        }
    }
    code
}

fn print_configuration(config: &Config, mode: ExecutionMode) {
    let c = &config.coordinator;
    println!("Configuration:");
    println!("  Mode:            {:?}", mode);
    println!("  Participants:    {}", config.participants.len());
    println!("  Minimum quorum:  {}", c.minimum_quorum);
    println!("  Round deadline:  {}", c.round_deadline);
    println!("  Sample fraction: {}", c.fraction_sample);
    if let Some(seed) = c.sample_seed {
        println!("  Sample seed:     {}", seed);
    }
    println!("  Queries:");
    for query in &config.queries {
        println!("    - {}", query.display_name());
    }
}
