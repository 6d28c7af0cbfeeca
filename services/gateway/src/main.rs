use clap::{App, Arg};
use gateway::config::GatewayConfig;
use gateway::handlers;
use quark::crypto;
use quark::logging;
use quark::snowflake::ShortId;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::process;
use tachyon::runtime::{RuntimeBuilder, ServeError};

const GATEWAY_CFG_NAME: &str = "gateway.toml";
const LOG_CFG_NAME: &str = "gateway.log.toml";

const EXIT_OK: i32 = 0;
const EXIT_CONFIG: i32 = 1;
const EXIT_BIND: i32 = 2;
const EXIT_FATAL: i32 = 3;

fn main() {
    process::exit(run());
}

fn run() -> i32 {
    let matches = App::new("Gateway")
        .version("1.0")
        .author("Bush Hammer Industries")
        .about("Runs the packet gateway server.")
        .arg(
            Arg::with_name("CONFIG_DIR")
                .help("Directory holding gateway.toml and gateway.log.toml")
                .required(false),
        )
        .get_matches();

    let config_dir = matches
        .value_of("CONFIG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(GatewayConfig::default_config_dir);

    let config_path = config_dir.join(GATEWAY_CFG_NAME);

    let mut config = if config_path.is_file() {
        match GatewayConfig::load(&config_path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("Error loading {}: {}", config_path.display(), err);
                return EXIT_CONFIG;
            }
        }
    } else {
        GatewayConfig::default()
    };

    config.resolve_paths();

    // Initialize logging
    let log_config_path = config_dir.join(LOG_CFG_NAME);
    let log = if log_config_path.is_file() {
        match logging::from_toml_file(&log_config_path) {
            Ok(log) => log,
            Err(err) => {
                eprintln!("Error loading {}: {}", log_config_path.display(), err);
                return EXIT_CONFIG;
            }
        }
    } else {
        logging::init()
    };

    logging::info!(log, "gateway starting";
                   "config" => %config_path.display(),
                   "data_path" => config.paths.data_path.as_deref().unwrap_or("."),
                   "logs_path" => config.paths.logs_path.as_deref().unwrap_or("."));

    let runtime_config = match config.runtime_config() {
        Ok(runtime_config) => runtime_config,
        Err(err) => {
            logging::crit!(log, "invalid configuration"; "error" => %err);
            return EXIT_CONFIG;
        }
    };

    let identity = match config.signing_identity() {
        Ok(identity) => identity,
        Err(err) => {
            logging::crit!(log, "invalid signing key"; "error" => %err);
            return EXIT_CONFIG;
        }
    };

    let mut builder = RuntimeBuilder::new(runtime_config).logger(log.clone());

    if let Some(identity) = identity {
        let fingerprint = crypto::sha256(&identity.public_bytes());
        logging::info!(log, "signing identity loaded";
                       "fingerprint" => %ShortId::new(u32::from_be_bytes([
                           fingerprint[0], fingerprint[1], fingerprint[2], fingerprint[3],
                       ])).to_hex());

        builder = builder.identity(identity);
    }

    if let Err(err) = handlers::install(&mut builder) {
        logging::crit!(log, "handler registration failed"; "error" => %err);
        return EXIT_CONFIG;
    }

    let runtime = builder.build();

    // Wire Ctrl-C to the server-wide cancellation latch
    let shutdown = runtime.shutdown_handle();
    if let Err(err) = ctrlc::set_handler(move || shutdown.trigger()) {
        logging::warn!(log, "signal handler unavailable"; "error" => %err);
    }

    let server = match runtime.bind() {
        Ok(server) => server,
        Err(ServeError::Bind(err)) => {
            logging::crit!(log, "listener bind failed"; "error" => %err);
            return EXIT_BIND;
        }
    };

    logging::info!(log, "listening"; "address" => %server.local_addr());

    match panic::catch_unwind(AssertUnwindSafe(move || server.run())) {
        Ok(()) => {
            logging::info!(log, "gateway stopped");
            EXIT_OK
        }
        Err(_) => {
            logging::crit!(log, "server loop aborted");
            EXIT_FATAL
        }
    }
}
