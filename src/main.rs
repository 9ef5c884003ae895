use std::{error::Error, process, sync::Arc};

use clap::{command, Parser, ValueHint};
use log::{debug, error, info, LevelFilter};

use remote_scan::{
    cache::MemoryCache,
    config::Config,
    http::Client,
    registry::Registry,
    scanner::{ScanRequest, Scanner},
    store::MemoryStore,
};

/// Profile to display when not built in release mode.
#[cfg(debug_assertions)]
const BUILD_PROFILE: &str = "debug";
/// Profile to display when not built release mode.
#[cfg(not(debug_assertions))]
const BUILD_PROFILE: &str = "release";

/// Group name for mutually exclusive logging options.
const ARGS_GROUP_LOGGING: &str = "logging";

/// Command line arguments as parsed by `clap`.
#[derive(Clone, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    ///
    /// TOML file with scanner settings. Settings that are left out take
    /// their default values.
    #[arg(short, long, value_name = "FILE", value_hint = ValueHint::FilePath, env = "REMOTE_SCAN_CONFIG")]
    config: Option<String>,

    /// URLs to resolve
    #[arg(required = true, value_name = "URL", value_hint = ValueHint::Url)]
    urls: Vec<String>,

    /// Suppresses all output except warnings and errors.
    #[arg(short, long, default_value_t = false, group = ARGS_GROUP_LOGGING)]
    quiet: bool,

    /// Enable verbose logging
    ///
    /// Specify twice for trace logging.
    #[arg(short, long, action = clap::ArgAction::Count, group = ARGS_GROUP_LOGGING)]
    verbose: u8,
}

/// Initializes the logger facade.
///
/// The logging level is determined as follows, in order of precedence from
/// highest to lowest:
/// 1. Command line arguments
/// 2. `RUST_LOG` environment variable
/// 3. Hard coded default
///
/// # Panics
///
/// Panics when a logger facade is already initialized.
fn init_logger(config: &Args) {
    let mut logger = env_logger::Builder::from_env(
        // Note: if you change the default logging level here, then you should
        // probably also change the verbosity levels below.
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    if config.quiet || config.verbose > 0 {
        let level = match config.verbose {
            0 => {
                // Quiet and verbose are mutually exclusive, and `verbose` is 0
                // by default. So this arm means: quiet mode.
                LevelFilter::Warn
            }
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Filter log messages of external crates.
        logger.filter_module("remote_scan", level);
    }

    logger.init();
}

/// Resolves every URL on the command line, printing the results as JSON.
///
/// # Errors
///
/// Returns an error when the configuration cannot be loaded, the HTTP
/// client cannot be built, or any URL fails to resolve.
async fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let config = match args.config {
        Some(ref path) => Config::from_file(path)?,
        None => Config::default(),
    };

    let client = Client::new(&config)?;
    let scanner = Scanner::new(
        config,
        Arc::new(client),
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryCache::default()),
        Registry::new(),
    );

    let mut failures = 0;
    for url in args.urls {
        match scanner.resolve(ScanRequest::new(url.as_str())).await {
            Ok(resolved) => println!("{}", serde_json::to_string_pretty(&resolved)?),
            Err(e) => {
                error!("{url}: {e} ({})", e.code());
                failures += 1;
            }
        }
    }

    if failures > 0 {
        return Err(format!("{failures} url(s) could not be resolved").into());
    }

    Ok(())
}

/// Main entry point of the application.
///
/// This function initializes the logger facade, parses the command line
/// arguments, and resolves the URLs.
#[tokio::main]
async fn main() {
    // `clap` handles our command line arguments and help text.
    let args = Args::parse();
    init_logger(&args);

    // Dump command line arguments before we do anything more.
    // This aids in debugging of whatever comes next.
    debug!("Command {:#?}", args);

    let cmd = command!();
    let name = cmd.get_name().to_string();
    let version = cmd.get_version().unwrap_or("UNKNOWN").to_string();

    info!("starting {name}/{version}; {BUILD_PROFILE}");

    tokio::select! {
        biased;

        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
            process::exit(130);
        }

        result = run(args) => {
            if let Err(e) = result {
                error!("{e}");
                process::exit(1);
            }
        }
    }
}
