//! Generates the default gateway configuration files, including a fresh
//! signing identity, into a target directory.

use clap::{App, Arg};
use gateway::config::GatewayConfig;
use quark::crypto::SigningIdentity;
use quark::encoding::base64;
use std::fs;
use std::path::Path;

const GATEWAY_CFG_NAME: &str = "gateway.toml";
const LOG_CFG_NAME: &str = "gateway.log.toml";

const LOG_CONFIG: &str = r#"type = "terminal"
level = "info"
destination = "stderr"
"#;

fn main() {
    let matches = App::new("Gateway Config Generator")
        .version("1.0")
        .author("Bush Hammer Industries")
        .about("Writes default gateway configuration files.")
        .arg(
            Arg::with_name("OUT_DIR")
                .help("Directory the config files are written into")
                .required(true),
        )
        .arg(
            Arg::with_name("FORCE")
                .long("force")
                .help("Overwrite existing files"),
        )
        .get_matches();

    let out_dir = Path::new(matches.value_of("OUT_DIR").unwrap());
    let force = matches.is_present("FORCE");

    fs::create_dir_all(out_dir).expect("Error creating the output directory");

    let config_path = out_dir.join(GATEWAY_CFG_NAME);
    let log_path = out_dir.join(LOG_CFG_NAME);

    if !force && (config_path.exists() || log_path.exists()) {
        eprintln!("Config files already present, pass --force to overwrite");
        std::process::exit(1);
    }

    let mut config = GatewayConfig::default();

    // Every generated config carries its own signing identity
    let identity = SigningIdentity::generate();
    config.security.signing_key = Some(base64::encode(&identity.secret_bytes()));

    let serialized = serdeconv::to_toml_string(&config).expect("Error serializing the config");

    fs::write(&config_path, serialized).expect("Error writing the gateway config");
    fs::write(&log_path, LOG_CONFIG).expect("Error writing the logger config");

    println!("Wrote {}", config_path.display());
    println!("Wrote {}", log_path.display());
    println!(
        "Server public key: {}",
        base64::encode(&identity.public_bytes())
    );
}
