#[macro_use]
extern crate clap;
#[macro_use]
extern crate log;

use std::process;

use chat_relay::{parse_port, watch_signals, BindMode, RelayConfig, RelayError, Server, ShutdownToken};

fn main() {
    let matches = clap_app!(
        chat_relay =>
            (version: crate_version!())
            (author: crate_authors!())
            (about: "Relays every byte a client sends to every connected client, sender included.")
            (@arg PORT: -p --port +takes_value +required "The numeric port to listen on.")
            (@arg IPV4: --ipv4 "Listen on IPv4 only instead of dual-stack IPv6.")
            (@arg VERBOSE: -v --verbose ... "Raise log verbosity (-v debug, -vv trace).")
    )
    .get_matches();

    init_logging(matches.occurrences_of("VERBOSE"));

    if let Err(err) = configure(&matches).and_then(run) {
        error!("{}", err);
        eprintln!("chat-relay: {}", err);
        process::exit(err.exit_code());
    }
}

fn configure(matches: &clap::ArgMatches) -> Result<RelayConfig, RelayError> {
    let port = parse_port(matches.value_of("PORT").unwrap_or_default())?;
    let mut config = RelayConfig::new(port);
    if matches.is_present("IPV4") {
        config = config.bind_mode(BindMode::Ipv4);
    }
    Ok(config)
}

fn init_logging(verbosity: u64) {
    let default_filter = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .format_timestamp_millis()
        .init();
}

fn run(config: RelayConfig) -> Result<(), RelayError> {
    info!("chat-relay {} starting", crate_version!());
    let shutdown = ShutdownToken::new();
    let server = Server::bind(config, shutdown.clone())?;
    let signals = watch_signals(shutdown)?;

    server.run();

    if let Err(err) = signals.stop() {
        warn!("{}", err);
    }
    Ok(())
}
