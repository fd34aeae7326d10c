/// Locates a raw dump and turns it into a processed dump file.
use clap::*;
use log::{warn, Level};

use std::path::{Path, PathBuf};

use rawdump_core::error::Result;
use rawdump_offline::pipeline::process_split_dump;
use rawdump_offline::*;

fn main() {
    let matches = parse_args();
    let result = extract_args(&matches).and_then(|(config, dump)| run(&config, dump.as_deref()));

    match result {
        Ok(report) => println!("{}", report),
        Err(err) => {
            eprintln!("unable to process the dump: {}", err);
            std::process::exit(err.into_i32());
        }
    }
}

fn run(config: &OfflineConfig, dump: Option<&Path>) -> Result<ProcessReport> {
    match &config.variables {
        Some(path) => {
            let mut store = FileVariableStore::open(path)?;
            process(config, dump, &mut store)
        }
        None => {
            warn!("no variable file configured, firmware variables are not available");
            process(config, dump, &mut MemoryVariableStore::new())
        }
    }
}

fn process<S: VariableStore>(config: &OfflineConfig, dump: Option<&Path>, store: &mut S) -> Result<ProcessReport> {
    match dump {
        Some(path) => process_split_dump(config, path, &config.output_dir, store),
        None => process_dump(config, store),
    }
}

fn parse_args() -> ArgMatches {
    Command::new("process_dump example")
        .version(crate_version!())
        .author(crate_authors!())
        .arg(Arg::new("verbose").short('v').action(ArgAction::Count))
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .action(ArgAction::Set)
                .required(false),
        )
        .arg(
            Arg::new("variables")
                .long("variables")
                .action(ArgAction::Set)
                .required(false),
        )
        .arg(
            Arg::new("output")
                .long("output")
                .short('o')
                .action(ArgAction::Set)
                .required(false),
        )
        .arg(
            Arg::new("arch")
                .long("arch")
                .short('a')
                .value_parser(value_parser!(u16))
                .action(ArgAction::Set)
                .required(false),
        )
        .arg(
            Arg::new("dump")
                .long("dump")
                .short('d')
                .help("rawdump.bin of a split dump, skips discovery")
                .action(ArgAction::Set)
                .required(false),
        )
        .get_matches()
}

fn extract_args(matches: &ArgMatches) -> Result<(OfflineConfig, Option<PathBuf>)> {
    let log_level = match matches.get_count("verbose") {
        0 => Level::Error,
        1 => Level::Warn,
        2 => Level::Info,
        3 => Level::Debug,
        4 => Level::Trace,
        _ => Level::Trace,
    };
    simplelog::TermLogger::init(
        log_level.to_level_filter(),
        simplelog::Config::default(),
        simplelog::TerminalMode::Stdout,
        simplelog::ColorChoice::Auto,
    )
    .unwrap();

    let mut config = match matches.get_one::<String>("config") {
        Some(path) => OfflineConfig::open(path)?,
        None => OfflineConfig::default(),
    };
    if let Some(path) = matches.get_one::<String>("variables") {
        config.variables = Some(PathBuf::from(path));
    }
    if let Some(path) = matches.get_one::<String>("output") {
        config.output_dir = PathBuf::from(path);
    }
    if let Some(arch) = matches.get_one::<u16>("arch") {
        config.architecture = Some(*arch);
    }

    Ok((config, matches.get_one::<String>("dump").map(PathBuf::from)))
}
