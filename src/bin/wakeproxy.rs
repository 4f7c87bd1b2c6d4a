use clap::Parser;
use mac_address::MacAddress;
use std::path::PathBuf;
use std::process::ExitCode;
use thiserror::Error;
use tracing::subscriber::SetGlobalDefaultError;
use tracing::{error, Level};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::FmtSubscriber;
use wakeproxy::addr::Address;
use wakeproxy::config::{Config, ConfigError, ConfigLoadError};
use wakeproxy::emulate::{emulate_host, EmulateError};
use wakeproxy::signal::{self, SignalSetupError};

/// Pretends to be a sleeping host and wakes it when a client connects
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Verbosity of the logger
    #[clap(short, long, default_value_t = Level::INFO)]
    verbosity: Level,
    /// Path to the config file
    #[clap(short, long)]
    config_path: Option<PathBuf>,
    /// Interface the claimed addresses live on
    #[clap(short, long)]
    interface: Option<String>,
    /// Address to claim, with optional /prefix; may be repeated
    #[clap(short, long = "address")]
    address: Vec<Address>,
    /// TCP port a connection to which wakes the host; may be repeated
    #[clap(short, long = "port")]
    port: Vec<u16>,
    /// MAC address the wake-on-lan packet is sent to
    #[clap(short, long)]
    mac: Option<MacAddress>,
    /// How often to ping the woken host before giving up
    #[clap(long)]
    ping_tries: Option<u32>,
}

#[derive(Debug, Error)]
enum WakeproxyError {
    #[error("Failed to set global logger: {0}")]
    SetGlobalLogger(#[from] SetGlobalDefaultError),
    #[error("Failed to load config: {0}")]
    ConfigLoad(#[from] ConfigLoadError),
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Failed to install signal handlers: {0}")]
    Signal(#[from] SignalSetupError),
    #[error(transparent)]
    Emulate(#[from] EmulateError),
}

fn run(args: Args) -> Result<bool, WakeproxyError> {
    // Build our log filter
    let env_filter = EnvFilter::new(format!("{}={}", clap::crate_name!(), args.verbosity));
    // Build our log subscriber
    let subscriber = FmtSubscriber::builder().with_env_filter(env_filter).finish();
    // Set the global subscriber
    tracing::subscriber::set_global_default(subscriber)?;
    // Load our config and let the command line override it
    let mut config = match &args.config_path {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if args.interface.is_some() {
        config.interface = args.interface;
    }
    if !args.address.is_empty() {
        config.address = args.address;
    }
    if !args.port.is_empty() {
        config.ports = args.port;
    }
    if let Some(mac) = args.mac {
        config.mac = Some(mac.into());
    }
    if args.ping_tries.is_some() {
        config.ping_tries = args.ping_tries;
    }
    let host = config.finish()?;
    // Break the capture loop on SIGINT/SIGTERM
    signal::install()?;
    // Run one impersonate-and-wake cycle
    Ok(emulate_host(&host)?)
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(args) {
        Ok(true) => ExitCode::SUCCESS,
        // the host was woken but never answered a ping
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            error!(error = tracing::field::display(&err), "Error emulating host");
            ExitCode::FAILURE
        }
    }
}
