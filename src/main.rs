use backtrace::Backtrace;
use clap::{value_parser, Arg, ArgAction, Command};
use tracing_log::AsTrace;

use std::io::{BufWriter, Write};
use std::path::PathBuf;

pub use tracing::{debug, error, info, trace, warn};

mod backend;
mod buffer;
mod config;
mod counters;
mod device;
mod error;
mod interrupt;
mod output;
mod params;
mod percpu;
mod registers;
mod sample;
mod session;
mod topology;
mod wake;
mod workload;

use config::Config;
use topology::Topology;

fn main() {
    // custom panic hook to terminate whole process after unwinding
    std::panic::set_hook(Box::new(|s| {
        eprintln!("{s}");
        eprintln!("{:?}", Backtrace::new());
        std::process::exit(101);
    }));

    // parse command line options
    let matches = Command::new(env!("CARGO_BIN_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .long_about(
            "Event-based sampling of hardware performance counters. Programs \
            counters to overflow after a number of events and records where \
            the processor was each time one did.",
        )
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new("record")
                .about("Run a sampling session and write the records to a file")
                .arg(
                    Arg::new("CONFIG")
                        .help("Session configuration file")
                        .value_parser(value_parser!(PathBuf))
                        .action(ArgAction::Set)
                        .required(true)
                        .index(1),
                ),
        )
        .subcommand(
            Command::new("decode")
                .about("Print a record file as JSON lines")
                .arg(
                    Arg::new("FILE")
                        .help("Record file written by `record`")
                        .value_parser(value_parser!(PathBuf))
                        .action(ArgAction::Set)
                        .required(true)
                        .index(1),
                ),
        )
        .subcommand(Command::new("topology").about("Show the detected processor layout"))
        .get_matches();

    match matches.subcommand() {
        Some(("record", args)) => {
            let path = args.get_one::<PathBuf>("CONFIG").cloned().unwrap_or_default();
            record(path);
        }
        Some(("decode", args)) => {
            init_logging(tracing::Level::WARN);
            let path = args.get_one::<PathBuf>("FILE").cloned().unwrap_or_default();
            decode(path);
        }
        Some(("topology", _)) => {
            init_logging(tracing::Level::WARN);
            show_topology();
        }
        _ => unreachable!("subcommand is required"),
    }
}

fn init_logging(level: tracing::Level) {
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

fn record(path: PathBuf) {
    // load config from file
    let config = match Config::load(&path) {
        Ok(c) => c,
        Err(error) => {
            eprintln!("error loading config file: {}\n{error}", path.display());
            std::process::exit(1);
        }
    };

    init_logging(config.log().level().as_trace());

    debug!("loaded config: {}", path.display());

    let detected = match Topology::detect() {
        Ok(topology) => Some(topology),
        Err(e) => {
            warn!("{e}");
            None
        }
    };

    let (device, pmu) = match workload::simulate(&config, detected.as_ref()) {
        Ok(v) => v,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };

    let session = device.session().clone();

    if let Err(e) = ctrlc::set_handler(move || {
        info!("interrupted, stopping");
        if let Err(e) = session.stop(true) {
            warn!("stop failed: {e}");
        }
    }) {
        warn!("failed to install signal handler: {e}");
    }

    match workload::record(&device, pmu, &config) {
        Ok(stats) => match serde_json::to_string_pretty(&stats) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                error!("failed to encode statistics: {e}");
                std::process::exit(1);
            }
        },
        Err(e) => {
            error!("recording failed: {e}");
            std::process::exit(1);
        }
    }
}

fn decode(path: PathBuf) {
    let mut file = match std::fs::File::open(&path) {
        Ok(f) => std::io::BufReader::new(f),
        Err(e) => {
            eprintln!("unable to open {}: {e}", path.display());
            std::process::exit(1);
        }
    };

    let stdout = std::io::stdout();
    let mut out = BufWriter::new(stdout.lock());

    match output::decode(&mut file, &mut out) {
        Ok(records) => debug!("decoded {records} records"),
        Err(e) => {
            let _ = out.flush();
            eprintln!("failed to decode {}: {e}", path.display());
            std::process::exit(1);
        }
    }
}

fn show_topology() {
    let topology = match Topology::detect() {
        Ok(t) => t,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    trace!("{} logical cpus", topology.len());

    match serde_json::to_string_pretty(&topology) {
        Ok(json) => println!("{json}"),
        Err(e) => {
            eprintln!("failed to encode topology: {e}");
            std::process::exit(1);
        }
    }
}
