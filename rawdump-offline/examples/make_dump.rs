/// Synthesizes a raw dump from a TOML layout.
use clap::*;
use itertools::Itertools;
use log::Level;

use std::fs::File;
use std::io::BufWriter;

use rawdump_core::builder::DumpLayout;
use rawdump_core::error::{Error, ErrorKind, ErrorOrigin, Result};

fn main() -> Result<()> {
    let matches = parse_args();
    let (layout, output, split) = extract_args(&matches)?;

    let builder = layout.builder();
    let header = builder.header()?;
    println!("{}", header);
    println!("sections: {}", header.sections().map(|s| s.name()).join(", "));

    if split {
        std::fs::create_dir_all(output)
            .map_err(|err| Error(ErrorOrigin::Other, ErrorKind::InvalidPath).log_error(err))?;
        builder.write_split(output)?;
        println!("split dump written to {}", output);
    } else {
        let file = File::create(output)
            .map_err(|err| Error(ErrorOrigin::Other, ErrorKind::UnableToOpenFile).log_error(err))?;
        let written = builder.write(&mut BufWriter::new(file))?;
        println!("{:x} bytes written to {}", written, output);
    }

    Ok(())
}

fn parse_args() -> ArgMatches {
    Command::new("make_dump example")
        .version(crate_version!())
        .author(crate_authors!())
        .arg(Arg::new("verbose").short('v').action(ArgAction::Count))
        .arg(
            Arg::new("layout")
                .long("layout")
                .short('l')
                .action(ArgAction::Set)
                .required(true),
        )
        .arg(
            Arg::new("output")
                .long("output")
                .short('o')
                .action(ArgAction::Set)
                .required(true),
        )
        .arg(
            Arg::new("split")
                .long("split")
                .short('s')
                .help("write one file per section into the output directory")
                .action(ArgAction::SetTrue),
        )
        .get_matches()
}

fn extract_args(matches: &ArgMatches) -> Result<(DumpLayout, &str, bool)> {
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

    let layout = DumpLayout::open(matches.get_one::<String>("layout").unwrap())?;
    Ok((
        layout,
        matches.get_one::<String>("output").unwrap(),
        matches.get_flag("split"),
    ))
}
