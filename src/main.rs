//! Xzibit bus CLI.
//!
//! `xzibit-bus serve` runs the relay; `announce` and `listen` are small
//! clients for poking at a running bus.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use xzibit_bus::framing::hex_dump;
use xzibit_bus::message::describe;
use xzibit_bus::{BusClient, Config, Message, Relay};

/// Global allocator configured per M-MIMALLOC-APPS guideline.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Exit status when the socket can't be bound.
const EXIT_BIND_FAILURE: u8 = 2;

// CLI
#[derive(Parser)]
#[command(name = "xzibit-bus")]
#[command(version)]
#[command(about = "Local frame relay for xzibit clients")]
struct Cli {
    /// JSON config file
    #[arg(long, global = true, env = "XZIBIT_BUS_CONFIG")]
    config: Option<PathBuf>,

    /// Socket path (overrides config)
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true, env = "XZIBIT_BUS_LOG_FILE")]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay (default)
    Serve {
        /// Largest single read per client, in bytes
        #[arg(long)]
        read_chunk: Option<usize>,
        /// Per-client receive buffer cap, in bytes
        #[arg(long)]
        max_buffered: Option<usize>,
        /// Per-peer write timeout, in milliseconds
        #[arg(long)]
        write_timeout_ms: Option<u64>,
    },
    /// Announce a new window, then print the first frame received
    Announce {
        /// Address of the sharing host
        #[arg(long, default_value = "127.0.0.1")]
        addr: Ipv4Addr,
        /// Port of the sharing host
        #[arg(long, default_value_t = 7177)]
        port: u16,
    },
    /// Print frames sent by other clients
    Listen {
        /// Stop after this many frames
        #[arg(long)]
        count: Option<usize>,
    },
}

fn init_logging(log_file: Option<&Path>) -> Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format_timestamp_secs();
    if let Some(path) = log_file {
        let file = std::fs::File::create(path)?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.init();

    // Log panics before the default handler prints them
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        log::error!("PANIC: {:?}", panic_info);
        default_hook(panic_info);
    }));
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for SIGINT: {e}");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                log::error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

/// Bind and run the relay until a shutdown signal arrives.
///
/// A bind failure is reported through the exit code so the runtime still
/// unwinds normally on the way out of `main`.
async fn serve(config: Config) -> Result<ExitCode> {
    let relay = match Relay::bind(&config) {
        Ok(relay) => relay,
        Err(e) => {
            log::error!("[Relay] {e:#}");
            eprintln!("xzibit-bus: {e:#}");
            return Ok(ExitCode::from(EXIT_BIND_FAILURE));
        }
    };
    relay.run_until(shutdown_signal()).await?;
    Ok(ExitCode::SUCCESS)
}

async fn announce(config: &Config, addr: Ipv4Addr, port: u16) -> Result<()> {
    let mut client = BusClient::connect(&config.socket_path).await?;
    let message = Message::NewWindow { addr, port };
    let payload = message.encode();
    println!("Client {} sends {}", std::process::id(), hex_dump(&payload));
    client.send_payload(&payload).await?;

    match client.recv_frame().await? {
        Some(frame) => println!(
            "Client {} receives {} and quits",
            std::process::id(),
            hex_dump(frame.as_bytes())
        ),
        None => println!("Client {} saw the bus close", std::process::id()),
    }
    Ok(())
}

async fn listen(config: &Config, count: Option<usize>) -> Result<()> {
    let mut client = BusClient::connect(&config.socket_path).await?;
    println!("Client {} is connected.", std::process::id());

    let mut seen = 0;
    loop {
        if count.is_some_and(|limit| seen >= limit) {
            break;
        }
        let Some(frame) = client.recv_frame().await? else {
            break;
        };
        println!("{}  ({})", hex_dump(frame.as_bytes()), describe(frame.payload()));
        seen += 1;
    }
    Ok(())
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.log_file.as_deref())?;

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(socket) = cli.socket {
        config.socket_path = socket;
    }

    // One thread: the relay is a single readiness loop
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    match cli.command {
        None => runtime.block_on(serve(config)),
        Some(Commands::Serve {
            read_chunk,
            max_buffered,
            write_timeout_ms,
        }) => {
            if let Some(size) = read_chunk {
                config.read_chunk_size = size;
            }
            if let Some(max) = max_buffered {
                config.max_buffered_bytes = max;
            }
            if let Some(timeout) = write_timeout_ms {
                config.write_timeout_ms = timeout;
            }
            runtime.block_on(serve(config))
        }
        Some(Commands::Announce { addr, port }) => {
            runtime.block_on(announce(&config, addr, port))?;
            Ok(ExitCode::SUCCESS)
        }
        Some(Commands::Listen { count }) => {
            runtime.block_on(listen(&config, count))?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
