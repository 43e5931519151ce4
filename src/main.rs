use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::Parser;
use env_logger::Env;

use opc_server::cli::{handle_config_action, Args, Command};
use opc_server::config::ServerConfig;
use opc_server::server::{setup_ctrlc_handler, Server};

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    // If --config is specified, require the file to exist
    // Otherwise, fall back to defaults if default config not found
    let loaded = match &args.config {
        Some(path) => ServerConfig::load_from(path),
        None => ServerConfig::load(None),
    };
    let mut config = match loaded {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    // Merge settings: CLI args > config file > built-in defaults
    args.apply_overrides(&mut config);

    if let Some(Command::Config { action }) = args.command {
        if let Err(e) = handle_config_action(action, args.config.as_deref(), &config) {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
        return;
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let result = Server::new(config).and_then(|server| {
        setup_ctrlc_handler(Arc::clone(&shutdown))?;
        server.run(shutdown)
    });

    if let Err(e) = result {
        log::error!("{}", e);
        std::process::exit(1);
    }
}
