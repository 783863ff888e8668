use std::env;
use std::sync::Arc;
use std::thread;

use getopts::Options;

use peerdns::config::{Config, DEFAULT_CONFIG_PATH};
use peerdns::dns::context::ServerContext;
use peerdns::dns::logging::{self, LogLevel, LoggerConfig};
use peerdns::dns::server::{DnsServer, DnsUdpServer};

fn print_usage(program: &str, opts: Options) {
    let brief = format!("Usage: {} [options]", program);
    print!("{}", opts.usage(&brief));
}

/// Main entry point for the peerdns server
fn main() {
    let args: Vec<String> = env::args().collect();
    let program = args[0].clone();

    let mut opts = Options::new();
    opts.optflag("h", "help", "print this help menu");
    opts.optopt(
        "c",
        "config",
        "Configuration file (default: config.toml)",
        "PATH",
    );
    opts.optopt(
        "l",
        "listen",
        "Address to listen on, overriding the configuration (e.g. 0.0.0.0:8053)",
        "ADDR",
    );
    opts.optopt(
        "",
        "log-level",
        "Log level when RUST_LOG is not set (trace, debug, info, warn, error)",
        "LEVEL",
    );
    opts.optflag("", "json-logs", "Emit logs as JSON lines");

    let opt_matches = match opts.parse(&args[1..]) {
        Ok(m) => m,
        Err(f) => {
            eprintln!("{}", f);
            print_usage(&program, opts);
            std::process::exit(2);
        }
    };

    if opt_matches.opt_present("h") {
        print_usage(&program, opts);
        return;
    }

    let mut logger_config = LoggerConfig::default();
    logger_config.json_format = opt_matches.opt_present("json-logs");
    if let Some(level) = opt_matches.opt_str("log-level") {
        match level.parse::<LogLevel>() {
            Ok(level) => logger_config.level = level,
            Err(e) => {
                eprintln!("{}", e);
                std::process::exit(2);
            }
        }
    }
    logging::init(&logger_config);

    log::info!("peerdns {} starting", env!("CARGO_PKG_VERSION"));

    let config_path = opt_matches
        .opt_str("c")
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    let mut config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            log::error!("Error loading config {}: {}", config_path, e);
            std::process::exit(1);
        }
    };

    if let Some(listen) = opt_matches.opt_str("l") {
        config.server.listen = listen;
    }

    let context = match ServerContext::new(&config) {
        Ok(context) => Arc::new(context),
        Err(e) => {
            log::error!("Server failed to initialize: {}", e);
            std::process::exit(1);
        }
    };

    log::info!(
        "Queries are answered by client {}",
        context.entry_client
    );

    let udp_server = DnsUdpServer::new(context.clone(), context.threads);
    if let Err(e) = udp_server.run_server() {
        log::error!("Failed to bind UDP listener on {}: {}", context.listen, e);
        std::process::exit(1);
    }

    // The server threads do the work from here on
    loop {
        thread::park();
    }
}
