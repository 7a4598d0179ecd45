// main.rs

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, Command};
use regex::Regex;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use log::{debug, error, info, warn};
use simplelog::{
    ColorChoice, CombinedLogger, ConfigBuilder, LevelFilter, SharedLogger, TermLogger,
    TerminalMode, WriteLogger,
};

use cso_pack::nar::NarArchive;
use cso_pack::pak::{EntryType, PakArchive};
use cso_pack::Error;

enum ArchiveKind {
    Nar,
    Pak,
}

fn archive_kind(path: &str) -> Result<ArchiveKind> {
    match Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("nar") => Ok(ArchiveKind::Nar),
        Some("pak") => Ok(ArchiveKind::Pak),
        other => anyhow::bail!(
            "unrecognized archive extension {:?} (expected .nar or .pak)",
            other.unwrap_or("")
        ),
    }
}

fn make_regex(strs: Vec<&str>) -> Result<Vec<Regex>> {
    strs.into_iter()
        .map(|s| Regex::new(s).with_context(|| format!("Invalid regex: {}", s)))
        .collect()
}

fn format_mtime(secs: u32) -> String {
    chrono::DateTime::from_timestamp(secs as i64, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_owned())
}

fn write_file(root_dir: &str, rel_path: &str, content: &[u8]) -> Result<()> {
    let fname = Path::new(root_dir)
        .join(rel_path.replace(['/', '\\'], &std::path::MAIN_SEPARATOR.to_string()));
    let par = fname
        .parent()
        .ok_or_else(|| anyhow::anyhow!("unrecognized path: {}", fname.to_string_lossy()))?;
    fs::create_dir_all(par).context(format!("Failed to create directory {:?}", par))?;
    fs::write(&fname, content).context(format!("Failed to write file {:?}", fname))?;
    debug!("[WRITE] '{}' ({} bytes)", rel_path, content.len());
    Ok(())
}

fn run_list(input: &str, output: Option<&str>) -> Result<()> {
    let mut writer: Box<dyn Write> = if let Some(out_path) = output {
        Box::new(
            fs::File::create(out_path)
                .with_context(|| format!("Failed to create output list file: {}", out_path))?,
        )
    } else {
        Box::new(io::stdout())
    };

    match archive_kind(input)? {
        ArchiveKind::Nar => {
            let archive =
                NarArchive::open(input).with_context(|| format!("Opening NAR '{}'", input))?;
            info!("'{}': {} entries", input, archive.entries().len());
            for ent in archive.entries() {
                writeln!(
                    writer,
                    "{}\t{:?}\t{}\t{}\t{}",
                    ent.path,
                    ent.stored_type,
                    ent.stored_size,
                    ent.extracted_size,
                    format_mtime(ent.last_modified)
                )?;
            }
        }
        ArchiveKind::Pak => {
            let archive =
                PakArchive::open(input).with_context(|| format!("Opening PAK '{}'", input))?;
            info!("'{}': {} entries", input, archive.entries().len());
            for ent in archive.entries() {
                writeln!(
                    writer,
                    "{}\t{:?}\t{}\t{}",
                    ent.path, ent.entry_type, ent.original_size, ent.packed_size
                )?;
            }
        }
    }
    writer.flush().context("Failed to flush list output stream")?;
    Ok(())
}

fn run_extract(input: &str, output_dir: &str, filters_cli: Vec<&str>) -> Result<()> {
    let filters = make_regex(filters_cli)?;
    let wanted = |name: &str| filters.is_empty() || filters.iter().any(|re| re.is_match(name));

    match archive_kind(input)? {
        ArchiveKind::Nar => {
            let archive =
                NarArchive::open(input).with_context(|| format!("Opening NAR '{}'", input))?;
            for ent in archive.entries() {
                if !wanted(&ent.path) {
                    continue;
                }
                if !archive.verify(ent)? {
                    warn!("'{}': stored checksum does not match payload", ent.path);
                }
                let content = archive
                    .extract(ent)
                    .with_context(|| format!("Extracting '{}'", ent.path))?;
                write_file(output_dir, &ent.path, &content)?;
            }
        }
        ArchiveKind::Pak => {
            let archive =
                PakArchive::open(input).with_context(|| format!("Opening PAK '{}'", input))?;
            for ent in archive.entries() {
                if !wanted(&ent.path) {
                    continue;
                }
                if ent.entry_type == EntryType::Compressed {
                    warn!(
                        "'{}': compressed entries are not supported, skipping",
                        ent.path
                    );
                    continue;
                }
                let content = match archive.unpack(ent) {
                    Ok(c) => c,
                    Err(e @ Error::UnsupportedType(_)) => {
                        warn!("'{}': {}, skipping", ent.path, e);
                        continue;
                    }
                    Err(e) => {
                        return Err(
                            anyhow::Error::new(e).context(format!("Unpacking '{}'", ent.path))
                        )
                    }
                };
                write_file(output_dir, &ent.path, &content)?;
            }
        }
    }
    Ok(())
}

fn main() {
    let matches = Command::new("CSO pack utilities")
        .version("v0.3.1")
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::Count)
                .help("Sets the verbosity level:\n-v: Shows INFO messages\n-vv: Shows DEBUG and INFO messages\n-vvv: Shows TRACE, DEBUG, and INFO messages"),
        )
        .subcommand(
            Command::new("list")
                .about("Output the file list of a .nar or .pak archive")
                .arg(Arg::new("input").short('i').long("input").value_name("ARCHIVE").help("Set the input archive to list").required(true))
                .arg(
                    Arg::new("output")
                        .short('o')
                        .long("output")
                        .value_name("LIST_FILE_NAME")
                        .help("Set the list file name, output to stdout if not set")
                        .required(false),
                ),
        )
        .subcommand(
            Command::new("extract")
                .about("Extract a .nar or .pak archive")
                .arg(Arg::new("input").short('i').long("input").value_name("ARCHIVE").help("Set the input archive to extract").required(true))
                .arg(Arg::new("output").short('o').long("output").value_name("FOLDER").help("Set the output folder").required(true))
                .arg(
                    Arg::new("filter")
                        .short('f')
                        .long("filter")
                        .value_name("FILTER")
                        .help("Set a filter when extracting, in regexp, multiple occurrences mean OR")
                        .required(false)
                        .action(ArgAction::Append),
                ),
        )
        .get_matches();

    let verbose_level = matches.get_count("verbose");
    let mut loggers: Vec<Box<dyn SharedLogger>> = Vec::new();

    let (console_log_level, file_log_level) = match verbose_level {
        0 => (LevelFilter::Info, LevelFilter::Off),
        1 => (LevelFilter::Info, LevelFilter::Info),
        2 => (LevelFilter::Debug, LevelFilter::Debug),
        _ => (LevelFilter::Trace, LevelFilter::Trace),
    };

    loggers.push(TermLogger::new(
        console_log_level,
        ConfigBuilder::new()
            .set_location_level(LevelFilter::Error)
            .build(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    ));

    if file_log_level > LevelFilter::Off {
        if let Ok(log_file) = OpenOptions::new().append(true).create(true).open("log.txt") {
            loggers.push(WriteLogger::new(
                file_log_level,
                ConfigBuilder::new().set_time_format_rfc3339().build(),
                log_file,
            ));
        } else {
            eprintln!("Failed to open log.txt for writing.");
        }
    }

    if CombinedLogger::init(loggers).is_err() {
        eprintln!("Failed to initialize the logger!");
    }

    let operation_result: Result<()> = if let Some(sub_matches) = matches.subcommand_matches("list")
    {
        let input = sub_matches.get_one::<String>("input").unwrap();
        let output = sub_matches.get_one::<String>("output").map(|s| s.as_str());
        info!("list for: '{}'", input);
        run_list(input, output)
    } else if let Some(sub_matches) = matches.subcommand_matches("extract") {
        let input = sub_matches.get_one::<String>("input").unwrap();
        let output = sub_matches.get_one::<String>("output").unwrap();
        debug!("extract for: '{}' to output: '{}'", input, output);
        run_extract(
            input,
            output,
            sub_matches
                .get_many::<String>("filter")
                .map_or(Vec::new(), |v| v.map(|s| s.as_str()).collect()),
        )
    } else {
        info!("No subcommand provided. Use --help for usage information.");
        Ok(())
    };

    match operation_result {
        Ok(()) => {
            debug!("completed successfully.");
            std::process::exit(0);
        }
        Err(e) => {
            error!("failed: {}", e);
            let mut cause = e.source();
            while let Some(inner_cause) = cause {
                error!("  caused by: {}", inner_cause);
                cause = inner_cause.source();
            }
            std::process::exit(1);
        }
    };
}
