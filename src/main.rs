//! udsio CLI - Unix-domain socket echo server and client.
//!
//! See the `udsio` library for the transport machinery.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use udsio::{
    open_unix_connection, start_unix_server, EventLoop, StreamReader, StreamWriter,
    TransportConfig, TransportError,
};

#[derive(Parser)]
#[command(name = "udsio")]
#[command(version)]
#[command(about = "Unix-domain socket echo server and client")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an echo server on PATH until Ctrl-C
    Serve {
        /// Socket path to create
        path: PathBuf,
        /// Listen backlog (overrides configuration)
        #[arg(long)]
        backlog: Option<u32>,
    },
    /// Send MESSAGE to the server at PATH and print the reply
    Send {
        /// Socket path to connect to
        path: PathBuf,
        /// Bytes to send before half-closing
        message: String,
    },
    /// Print the effective configuration as JSON
    Config,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();
    let mut config = TransportConfig::load().context("Failed to load configuration")?;

    match cli.command {
        Commands::Serve { path, backlog } => {
            if let Some(backlog) = backlog {
                config.backlog = backlog;
                config.validate()?;
            }
            let lp = EventLoop::new()?;
            lp.run_until_complete(serve(path, config))?;
        }
        Commands::Send { path, message } => {
            let lp = EventLoop::new()?;
            let reply = lp.run_until_complete(send(path, message, config))?;
            println!("{}", String::from_utf8_lossy(&reply));
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

async fn serve(path: PathBuf, config: TransportConfig) -> Result<()> {
    let server = start_unix_server(echo, &path, &config)
        .with_context(|| format!("Failed to listen on {}", path.display()))?;

    tokio::select! {
        () = server.serve_forever() => {}
        res = tokio::signal::ctrl_c() => {
            res.context("Failed to listen for Ctrl-C")?;
            log::info!("Received Ctrl-C, shutting down");
        }
    }

    server.close();
    log::info!(
        "Waiting for {} connection(s) to finish",
        server.active_connections()
    );
    server.wait_closed().await;
    Ok(())
}

/// Echo every chunk back until the peer half-closes.
async fn echo(reader: StreamReader, writer: StreamWriter) -> Result<(), TransportError> {
    loop {
        let chunk = reader.read(64 * 1024).await?;
        if chunk.is_empty() {
            return Ok(());
        }
        writer.write(&chunk)?;
        writer.drain().await?;
    }
}

async fn send(path: PathBuf, message: String, config: TransportConfig) -> Result<Vec<u8>> {
    let (reader, writer) = open_unix_connection(&path, &config)
        .await
        .with_context(|| format!("Failed to connect to {}", path.display()))?;

    writer.write(message.as_bytes())?;
    writer.write_eof()?;
    let reply = reader.read_to_end().await?;

    writer.close();
    writer.wait_closed().await;
    Ok(reply.to_vec())
}
