mod session;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pipesecret::client::BridgeClient;
use pipesecret::config::{
    DEFAULT_CALL_TIMEOUT, DEFAULT_CONNECT_TIMEOUT, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_QUERY,
    DEFAULT_REMOTE_COMMAND, DEFAULT_SHUTDOWN_GRACE, DEFAULT_SOCKET_PATH,
};
use pipesecret_item::onepassword::DEFAULT_OP;
use pipesecret_relay::bridge::BridgeConfig;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser)]
#[command(
    name = "pipesecret",
    version,
    about = "Look up secrets on this machine from a remote host over ssh"
)]
struct Cli {
    /// Log at debug level. RUST_LOG takes precedence when set.
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a remote session and answer its secret lookups.
    Serve {
        /// Host to connect to.
        #[arg(long, env = "PIPESECRET_HOST")]
        host: String,
        /// ssh program used to reach the host.
        #[arg(long, env = "PIPESECRET_SSH", default_value = "ssh")]
        ssh: String,
        /// Command started on the remote host.
        #[arg(long, env = "PIPESECRET_COMMAND", default_value = DEFAULT_REMOTE_COMMAND)]
        command: String,
        /// 1Password CLI, as a path or a program name on PATH.
        #[arg(long, env = "PIPESECRET_OP", default_value = DEFAULT_OP)]
        op: String,
        /// Socket path exported to the remote session.
        #[arg(long, env = "PIPESECRET_SOCKET", default_value = DEFAULT_SOCKET_PATH)]
        socket: PathBuf,
    },
    /// Serve the local socket bridge, relaying calls over stdin/stdout.
    RemoteServe {
        #[arg(long, env = "PIPESECRET_SOCKET", default_value = DEFAULT_SOCKET_PATH)]
        socket: PathBuf,
        /// Idle time before a heartbeat is sent.
        #[arg(long, default_value_t = DEFAULT_HEARTBEAT_INTERVAL.into())]
        heartbeat: humantime::Duration,
        /// How long the bridge keeps accepting after a shutdown call.
        #[arg(long, default_value_t = DEFAULT_SHUTDOWN_GRACE.into())]
        shutdown_grace: humantime::Duration,
        /// Upper bound on a single lookup.
        #[arg(long, default_value_t = DEFAULT_CALL_TIMEOUT.into())]
        call_timeout: humantime::Duration,
    },
    /// Look up an item through the local socket bridge.
    Remote {
        /// Item name.
        #[arg(long)]
        item: String,
        /// jq query projecting the item into a flat object of strings.
        #[arg(long, env = "PIPESECRET_QUERY", default_value = DEFAULT_QUERY)]
        query: String,
        #[arg(long, env = "PIPESECRET_SOCKET", default_value = DEFAULT_SOCKET_PATH)]
        socket: PathBuf,
        /// Connect timeout.
        #[arg(long, default_value_t = DEFAULT_CONNECT_TIMEOUT.into())]
        timeout: humantime::Duration,
        /// Print the query output as is instead of checking its shape.
        #[arg(long)]
        raw: bool,
    },
    /// Ask the local socket bridge to stop.
    Shutdown {
        #[arg(long, env = "PIPESECRET_SOCKET", default_value = DEFAULT_SOCKET_PATH)]
        socket: PathBuf,
    },
}

fn init_tracing(debug: bool) {
    let fallback = if debug {
        "pipesecret=debug"
    } else {
        "pipesecret=info"
    };
    // stdout carries the relay channel in remote-serve.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| fallback.into()),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    match cli.command {
        Command::Serve {
            host,
            ssh,
            command,
            op,
            socket,
        } => {
            session::serve(session::ServeOptions {
                host,
                ssh,
                remote_command: command,
                op,
                socket,
            })
            .await
        }
        Command::RemoteServe {
            socket,
            heartbeat,
            shutdown_grace,
            call_timeout,
        } => {
            let config = BridgeConfig {
                socket_path: socket,
                shutdown_grace: shutdown_grace.into(),
                call_timeout: call_timeout.into(),
            };
            let result = session::remote_serve(config, heartbeat.into()).await;
            // Reads from stdin run on a blocking thread that cannot be
            // cancelled, so runtime shutdown could wait on it forever.
            exit_now(result)
        }
        Command::Remote {
            item,
            query,
            socket,
            timeout,
            raw,
        } => {
            let mut client = connect(&socket, timeout.into()).await?;
            if raw {
                let out = client
                    .get_query_item_raw(&item, &query)
                    .await
                    .with_context(|| format!("failed to look up {item}"))?;
                print!("{out}");
            } else {
                let fields = client
                    .get_query_item(&item, &query)
                    .await
                    .with_context(|| format!("failed to look up {item}"))?;
                println!("{}", serde_json::to_string_pretty(&fields)?);
            }
            Ok(())
        }
        Command::Shutdown { socket } => {
            let mut client = connect(&socket, DEFAULT_CONNECT_TIMEOUT).await?;
            client.shutdown().await.context("shutdown request failed")?;
            println!("Bridge shutting down.");
            Ok(())
        }
    }
}

async fn connect(socket: &Path, timeout: Duration) -> Result<BridgeClient> {
    BridgeClient::connect(socket, timeout)
        .await
        .with_context(|| format!("is `pipesecret remote-serve` running? (socket {})", socket.display()))
}

fn exit_now(result: Result<()>) -> ! {
    match result {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("Error: {e:?}");
            std::process::exit(1)
        }
    }
}
