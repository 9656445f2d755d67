//! DCP Poller - polls remote field stations and writes the retrieved data
//!
//! Usage:
//!   dcp-poll run                     Poll every configured station once
//!   dcp-poll listen [--port N]       Serve stations that call in
//!   dcp-poll check-script FILE       Parse a poll script and list its commands
//!
//! Retrieved messages go to stdout, or one file each under `--outdir`.

use clap::Parser;
use dcp_poller::cli::{Cli, Command};
use dcp_poller::config::{self, Config, PoolConfig};
use dcp_poller::controller::{ListeningController, PollingController};
use dcp_poller::error::{PollError, Result};
use dcp_poller::logging;
use dcp_poller::port::{build_pool, ListeningPool, PortPool};
use dcp_poller::protocol::{script, ProtocolFactory, RetrievedMessage};
use dcp_poller::session::SessionContext;
use dcp_poller::shutdown::Shutdown;
use dcp_poller::sink::{message_queue, MessageStream};
use dcp_poller::station::{MediumType, StationTarget};
use dcp_poller::status;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init_tracing(cli.verbose);

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("{}", PollError::Runtime { source: e });
            return ExitCode::FAILURE;
        }
    };

    match rt.block_on(run(cli)) {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Command::CheckScript { ref file } => check_script(file),
        Command::Run => {
            let config = config::load(&cli.config)?;
            run_polling(config, cli.outdir).await
        }
        Command::Listen { port } => {
            let config = config::load(&cli.config)?;
            run_listening(config, port, cli.outdir).await
        }
    }
}

fn check_script(file: &Path) -> Result<ExitCode> {
    let text = std::fs::read_to_string(file).map_err(|e| PollError::Io {
        path: file.to_path_buf(),
        source: e,
    })?;
    let parsed = script::parse(&file.display().to_string(), &text)?;
    for line in &parsed.lines {
        println!("{:>4}  {}", line.line_no, line.command);
    }
    println!("{}: {} commands OK", file.display(), parsed.len());
    Ok(ExitCode::SUCCESS)
}

/// Collaborators shared by the run and listen commands
fn session_context(
    config: &Config,
    pool: Arc<dyn PortPool>,
    store: Arc<dyn status::StatusStore>,
    shutdown: Shutdown,
) -> (SessionContext, MessageStream) {
    let (sink, stream) = message_queue();
    let ctx = SessionContext {
        pool,
        factory: Arc::new(ProtocolFactory::from_config(config)),
        store,
        sink,
        settings: Arc::new(config.poller.clone()),
        shutdown,
    };
    (ctx, stream)
}

async fn run_polling(config: Config, outdir: Option<PathBuf>) -> Result<ExitCode> {
    let store = status::open_store(config.poller.status_file.as_deref()).await?;
    let pool = build_pool(&config.pool, &config.poller, store.clone()).await?;
    let shutdown = Shutdown::new();
    spawn_signal_handler(shutdown.clone());

    let stations: Vec<StationTarget> = config
        .stations
        .iter()
        .filter(|s| s.medium_type != MediumType::Incoming)
        .cloned()
        .collect();
    let (ctx, stream) = session_context(&config, pool, store, shutdown);
    let writer = tokio::spawn(write_messages(stream, outdir));

    let summary = PollingController::new(stations, ctx).run().await;
    let written = writer.await.unwrap_or(0);
    info!("{} messages written", written);

    Ok(if summary.failed == 0 && summary.aborted == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn run_listening(config: Config, port: Option<u16>, outdir: Option<PathBuf>) -> Result<ExitCode> {
    let mut settings = match &config.pool {
        PoolConfig::Listening(s) => s.clone(),
        other => {
            return Err(PollError::config(format!(
                "listen needs a listening pool, config has '{}'",
                other.type_name()
            )))
        }
    };
    if let Some(port) = port {
        settings.listening_port = port;
    }

    let store = status::open_store(config.poller.status_file.as_deref()).await?;
    let pool = Arc::new(ListeningPool::bind(&settings)?);
    let shutdown = Shutdown::new();
    spawn_signal_handler(shutdown.clone());

    let stations: Vec<StationTarget> = config
        .stations
        .iter()
        .filter(|s| s.medium_type == MediumType::Incoming)
        .cloned()
        .collect();
    if stations.is_empty() {
        warn!("no stations with medium_type = \"incoming\"; every client will be dropped");
    }
    let (ctx, stream) = session_context(&config, pool.clone(), store, shutdown);
    let writer = tokio::spawn(write_messages(stream, outdir));

    ListeningController::new(pool, stations, ctx).run().await;
    let written = writer.await.unwrap_or(0);
    info!("{} messages written", written);
    Ok(ExitCode::SUCCESS)
}

/// Raise `shutdown` on Ctrl-C or SIGTERM
fn spawn_signal_handler(shutdown: Shutdown) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = sigterm.recv() => {},
                        _ = tokio::signal::ctrl_c() => {},
                    }
                }
                Err(e) => {
                    warn!("cannot install SIGTERM handler: {}", e);
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        info!("shutdown requested");
        shutdown.trigger();
    });
}

/// Drain the message queue to files or stdout; returns the number written
async fn write_messages(mut stream: MessageStream, outdir: Option<PathBuf>) -> usize {
    if let Some(ref dir) = outdir {
        if let Err(e) = tokio::fs::create_dir_all(dir).await {
            warn!("cannot create {}: {}", dir.display(), e);
        }
    }

    let mut written = 0;
    let mut stdout = tokio::io::stdout();
    while let Some(msg) = stream.next().await {
        let result = match outdir {
            Some(ref dir) => {
                let path = dir.join(message_file_name(&msg));
                tokio::fs::write(&path, &msg.data).await
            }
            None => {
                let mut out = msg.data.clone();
                out.push(b'\n');
                match stdout.write_all(&out).await {
                    Ok(()) => stdout.flush().await,
                    Err(e) => Err(e),
                }
            }
        };
        match result {
            Ok(()) => written += 1,
            Err(e) => error!(station = %msg.station, "cannot write message: {}", e),
        }
    }
    written
}

fn message_file_name(msg: &RetrievedMessage) -> String {
    let station: String = msg
        .station
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    format!("{}-{}.msg", station, msg.receive_time.format("%Y%m%d%H%M%S"))
}
