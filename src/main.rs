//! Conduit - run a statement against a remote engine from the command line.

mod cli;

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::process::ExitCode;

use anyhow::{bail, Context};
use cli::Cli;
use db_conduit::db::PollState;
use db_conduit::logging;
use db_conduit::query::{Handle, PollObserver, QueryEngine, QueryRequest};
use tracing::{error, info};

/// Reports poll progress through the log.
struct LogObserver;

impl PollObserver for LogObserver {
    fn on_execute(&self, handle: &Handle) {
        info!("Executing as {}", handle);
    }

    fn on_status(&self, state: PollState) {
        info!("Status: {}", state);
    }

    fn on_log(&self, text: &str) {
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            info!("{}", line);
        }
    }

    fn wants_log(&self) -> bool {
        true
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    logging::init_stderr_logging();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse_args();

    let config_path = cli.config_path();
    info!("Loading config from: {}", config_path.display());
    let config = cli.load_config()?;
    let backend = cli.backend_name(&config)?;
    info!("Backend: {}", config.backend(&backend)?.display_string());

    let engine = QueryEngine::new(config);
    let request = QueryRequest::new(backend, cli.statement.clone(), cli.principal());

    let result = match &cli.export {
        Some(path) => export(&engine, &request, &cli, path).await,
        None => print_pages(&engine, &request, cli.rows).await,
    };
    engine.shutdown().await;
    result
}

async fn export(
    engine: &QueryEngine,
    request: &QueryRequest,
    cli: &Cli,
    path: &std::path::Path,
) -> anyhow::Result<()> {
    let file = File::create(path)
        .with_context(|| format!("Could not create export file {}", path.display()))?;
    let marker = engine
        .download(request, cli.format, BufWriter::new(file), &LogObserver)
        .await?;

    println!(
        "{}",
        serde_json::json!({
            "name": marker.name,
            "value": marker.value,
            "max_age": marker.max_age.as_secs(),
        })
    );
    Ok(())
}

async fn print_pages(engine: &QueryEngine, request: &QueryRequest, rows: usize) -> anyhow::Result<()> {
    let response = engine.execute(request).await?;
    let handle = response.handle;

    let printed = async {
        let state = engine.wait_until_available(&handle, &LogObserver).await?;
        if state != PollState::Available {
            bail!("Statement ended in state '{}'", state);
        }

        let stdout = io::stdout();
        let mut out = stdout.lock();
        let mut start_over = true;
        loop {
            let batch = engine.fetch_result(&handle, rows, start_over).await?;
            start_over = false;
            serde_json::to_writer(&mut out, &batch)?;
            writeln!(out)?;
            if !batch.has_more {
                break;
            }
        }
        Ok(())
    }
    .await;

    engine.close_statement(&handle).await?;
    printed
}
