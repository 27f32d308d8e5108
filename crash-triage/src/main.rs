use std::boxed::Box;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::ops::Deref;
use std::panic;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::Context;
use clap::{value_parser, Arg, ArgAction, ArgGroup, ArgMatches, Command};
use log::{error, info};
use serde_json::json;
use simplelog::{
    ColorChoice, ConfigBuilder, Level, LevelFilter, TermLogger, TerminalMode, WriteLogger,
};
use triage_common::CrashSnapshot;
use triage_processor::{analyze_batch, ProcessorOptions, SignalId, TriageReport};

fn make_app() -> Command {
    Command::new("crash-triage")
        .version(clap::crate_version!())
        .about(
            "Classifies crash snapshots by how likely they are to be exploitable, and produces a \
             report (either human-readable or JSON).",
        )
        .next_line_help(true)
        .override_usage("crash-triage [FLAGS] [OPTIONS] <snapshot>...")
        .arg(
            Arg::new("json")
                .long("json")
                .action(ArgAction::SetTrue)
                .long_help(
                    "Emit a machine-readable JSON report.

One JSON object is written per snapshot, in the order the snapshots were given. Each object \
carries a `source` field naming the file (and array index) the snapshot came from.",
                ),
        )
        .arg(
            Arg::new("human")
                .long("human")
                .action(ArgAction::SetTrue)
                .long_help(
                    "Emit a human-readable report (the default).

The human-readable report does not have a specified format, and may not have as many details \
as the JSON format. It is intended for quickly inspecting a crash.",
                ),
        )
        .group(ArgGroup::new("output-format").args(["json", "human"]))
        .arg(
            Arg::new("features")
                .long("features")
                .value_parser(["stable-basic", "aggressive"])
                .default_value("stable-basic")
                .long_help(
                    "Specify at a high-level how eager the triage should be.

* stable-basic (default): one high-severity signal alone is PROBABLY_EXPLOITABLE, two make \
it EXPLOITABLE
* aggressive: one high-severity signal is EXPLOITABLE and one medium-severity signal is \
PROBABLY_EXPLOITABLE. Useful for fuzzing, where a missed bug costs more than a false alarm.

Either way, a snapshot missing evidence (an undecodable instruction or a failed unwind) is \
held at UNKNOWN.",
                ),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .value_parser(value_parser!(PathBuf))
                .conflicts_with("features")
                .long_help(
                    "A JSON file of processor options.

Any field that isn't given keeps its stable-basic default. For example:

{\"null_page_radius\": 65536, \"disabled_signals\": [\"benign-signal\"], \
\"policy\": {\"exploitable_high_count\": 1}}",
                ),
        )
        .arg(
            Arg::new("disable")
                .long("disable")
                .value_name("SIGNAL")
                .action(ArgAction::Append)
                .value_parser(SignalId::from_str)
                .help("Never produce this signal (may be given multiple times)"),
        )
        .arg(
            Arg::new("null-page-radius")
                .long("null-page-radius")
                .value_name("BYTES")
                .value_parser(value_parser!(u64))
                .help("Treat fault addresses below this as null pointer dereferences"),
        )
        .arg(
            Arg::new("heap-overflow-ceiling")
                .long("heap-overflow-ceiling")
                .value_name("BYTES")
                .value_parser(value_parser!(u64))
                .help("How far past a heap pointer a fault may be and still look like an overflow"),
        )
        .arg(
            Arg::new("output-file")
                .long("output-file")
                .value_parser(value_parser!(PathBuf))
                .help("Where to write the output to (if unspecified, stdout is used)"),
        )
        .arg(
            Arg::new("log-file")
                .long("log-file")
                .value_parser(value_parser!(PathBuf))
                .help("Where to write logs to (if unspecified, stderr is used)"),
        )
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .value_parser(["off", "error", "warn", "info", "debug", "trace"])
                .default_value("error")
                .long_help(
                    "Set the logging level.

Every rule logs whether it fired or abstained at `trace`, so --verbose=trace is the way to \
find out why a snapshot got the verdict it did.",
                ),
        )
        .arg(
            Arg::new("pretty")
                .long("pretty")
                .action(ArgAction::SetTrue)
                .help("Pretty-print --json output."),
        )
        .arg(
            Arg::new("brief")
                .long("brief")
                .action(ArgAction::SetTrue)
                .help(
                    "Provide a briefer --human report.

Only one line per snapshot: the verdict, the crash reason and the signals that fired.",
                ),
        )
        .arg(
            Arg::new("snapshot")
                .required(true)
                .num_args(1..)
                .value_parser(value_parser!(PathBuf))
                .help("Paths to the crash snapshots to triage."),
        )
        .after_help(
            "
NOTES:

Snapshot Files:

  Each file holds one crash snapshot as a JSON object, or a JSON array of them, as written by \
the debugger integration. All snapshots from all files are triaged in parallel.

Verdicts:

  EXPLOITABLE, PROBABLY_EXPLOITABLE, PROBABLY_NOT_EXPLOITABLE, NOT_EXPLOITABLE and UNKNOWN. \
The report lists every signal that contributed, with its severity and an explanation.

Exit Status:

  0 if every snapshot was triaged, 1 if any file couldn't be read or any snapshot couldn't be \
triaged. Failures are logged and don't stop the remaining snapshots from being triaged.
",
        )
}

/// One snapshot to triage, and where it came from.
struct Input {
    source: String,
    snapshot: CrashSnapshot,
}

fn read_snapshots(path: &Path) -> anyhow::Result<Vec<Input>> {
    let file = File::open(path).with_context(|| format!("couldn't open {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("{} isn't valid JSON", path.display()))?;
    let inputs = if value.is_array() {
        let snapshots: Vec<CrashSnapshot> = serde_json::from_value(value)
            .with_context(|| format!("{} isn't an array of crash snapshots", path.display()))?;
        snapshots
            .into_iter()
            .enumerate()
            .map(|(index, snapshot)| Input {
                source: format!("{}[{index}]", path.display()),
                snapshot,
            })
            .collect()
    } else {
        let snapshot: CrashSnapshot = serde_json::from_value(value)
            .with_context(|| format!("{} isn't a crash snapshot", path.display()))?;
        vec![Input {
            source: path.display().to_string(),
            snapshot,
        }]
    };
    Ok(inputs)
}

fn load_options(matches: &ArgMatches) -> anyhow::Result<ProcessorOptions> {
    // Pick the default options
    let mut options = match matches.get_one::<PathBuf>("config") {
        Some(path) => {
            let file =
                File::open(path).with_context(|| format!("couldn't open {}", path.display()))?;
            serde_json::from_reader(BufReader::new(file))
                .with_context(|| format!("invalid config file {}", path.display()))?
        }
        None => match matches.get_one::<String>("features").map(String::as_str) {
            Some("aggressive") => ProcessorOptions::aggressive(),
            _ => ProcessorOptions::stable_basic(),
        },
    };

    // Now overload the defaults
    if let Some(&radius) = matches.get_one::<u64>("null-page-radius") {
        options.null_page_radius = radius;
    }
    if let Some(&ceiling) = matches.get_one::<u64>("heap-overflow-ceiling") {
        options.heap_overflow_offset_ceiling = ceiling;
    }
    if let Some(disabled) = matches.get_many::<SignalId>("disable") {
        options.disabled_signals.extend(disabled.copied());
    }
    Ok(options)
}

struct OutputFormat {
    json: bool,
    pretty: bool,
    brief: bool,
}

fn print_report<W: Write>(
    output: &mut W,
    source: &str,
    report: &TriageReport,
    format: &OutputFormat,
) -> anyhow::Result<()> {
    if format.json {
        let mut value = report.to_json();
        value["source"] = json!(source);
        if format.pretty {
            serde_json::to_writer_pretty(&mut *output, &value)?;
        } else {
            serde_json::to_writer(&mut *output, &value)?;
        }
        writeln!(output)?;
    } else if format.brief {
        write!(output, "{source}: ")?;
        report.print_brief(output)?;
    } else {
        writeln!(output, "Snapshot: {source}")?;
        report.print(output)?;
        writeln!(output)?;
    }
    Ok(())
}

/// Triage every snapshot named on the command line.
///
/// Returns whether every snapshot was triaged.
fn run(matches: &ArgMatches, format: &OutputFormat) -> anyhow::Result<bool> {
    let options = load_options(matches)?;

    let mut output: Box<dyn Write> = match matches.get_one::<PathBuf>("output-file") {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("couldn't create {}", path.display()))?,
        )),
        None => Box::new(std::io::stdout().lock()),
    };

    let mut all_ok = true;
    let mut inputs = Vec::new();
    for path in matches.get_many::<PathBuf>("snapshot").into_iter().flatten() {
        match read_snapshots(path) {
            Ok(mut snapshots) => inputs.append(&mut snapshots),
            Err(err) => {
                error!("{:#}", err);
                all_ok = false;
            }
        }
    }

    info!("triaging {} snapshots", inputs.len());
    let (sources, snapshots): (Vec<String>, Vec<CrashSnapshot>) = inputs
        .into_iter()
        .map(|input| (input.source, input.snapshot))
        .unzip();
    let results = analyze_batch(&snapshots, &options);

    for (source, result) in sources.iter().zip(results) {
        match result {
            Ok(report) => print_report(&mut output, source, &report, format)?,
            Err(err) => {
                error!("{} - Error triaging snapshot: {}", source, err);
                all_ok = false;
            }
        }
    }
    output.flush()?;
    Ok(all_ok)
}

#[cfg_attr(test, allow(dead_code))]
fn main() {
    let matches = make_app().get_matches();

    let verbosity = match matches.get_one::<String>("verbose").map(String::as_str) {
        Some("off") => LevelFilter::Off,
        Some("warn") => LevelFilter::Warn,
        Some("info") => LevelFilter::Info,
        Some("debug") => LevelFilter::Debug,
        Some("trace") => LevelFilter::Trace,
        _ => LevelFilter::Error,
    };

    // Init the logger (and make trace logging less noisy)
    if let Some(log_path) = matches.get_one::<PathBuf>("log-file") {
        let log_file = match File::create(log_path) {
            Ok(file) => file,
            Err(err) => {
                eprintln!("couldn't create log file {}: {}", log_path.display(), err);
                std::process::exit(1);
            }
        };
        let _ = WriteLogger::init(
            verbosity,
            ConfigBuilder::new()
                .set_location_level(LevelFilter::Off)
                .set_time_level(LevelFilter::Off)
                .set_thread_level(LevelFilter::Off)
                .set_target_level(LevelFilter::Off)
                .build(),
            log_file,
        );
    } else {
        let _ = TermLogger::init(
            verbosity,
            ConfigBuilder::new()
                .set_location_level(LevelFilter::Off)
                .set_time_level(LevelFilter::Off)
                .set_thread_level(LevelFilter::Off)
                .set_target_level(LevelFilter::Off)
                .set_level_color(Level::Trace, None)
                .build(),
            TerminalMode::Stderr,
            ColorChoice::Auto,
        );
    }

    // Set a panic hook to redirect to the logger
    panic::set_hook(Box::new(|panic_info| {
        let (filename, line) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line()))
            .unwrap_or(("<unknown>", 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref)
            .unwrap_or_else(|| {
                panic_info
                    .payload()
                    .downcast_ref::<&str>()
                    .copied()
                    .unwrap_or("<cause unknown>")
            });
        error!(
            "Panic - A panic occurred at {}:{}: {}",
            filename, line, cause
        );
    }));

    // Human is just enabled if nothing else is. We can't use Arg::requires for the checks below
    // because clap doesn't understand --human being implicitly enabled.
    let json = matches.get_flag("json");
    let format = OutputFormat {
        json,
        pretty: matches.get_flag("pretty"),
        brief: matches.get_flag("brief"),
    };

    if format.pretty && !json {
        error!("The --pretty flag is only valid for --json output");
        std::process::exit(1);
    }

    if format.brief && json {
        error!("The --brief flag is only valid for --human output");
        std::process::exit(1);
    }

    match run(&matches, &format) {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(err) => {
            error!("{:#}", err);
            std::process::exit(1);
        }
    }
}
