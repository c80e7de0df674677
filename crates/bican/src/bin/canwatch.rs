use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use bican::frame::parse_identifier;
use bican::report::{
    write_definition, write_frame_header, write_frame_row, write_match_details,
    write_watch_header, write_watch_summary,
};
use bican::watch::{WatchConfig, WatchEvent, WatchSession};
use bican::{AdapterConfig, MatchTarget, PayloadPattern, Registry};
use bican_utils::logging::LogArgs;
use bican_utils::stdio::get_output_writer;
use chrono::Local;
use clap::Parser;

/// Wait for CAN messages and decode them
///
/// Watches for predefined messages by name (--msg) or for an arbitrary identifier and payload
/// pattern (--id/--data). Each matching frame is printed in candump format, followed by its
/// decoded fields. Exits non-zero if nothing matched.
///
/// Examples:
///     canwatch -i socketcan:can0 --msg BI_RESULTS,BI_USAGE --timeout 60
///     canwatch -i socketcan:can0 --id 0x114F0900 --data "FF,XX,81" --first
///     candump -L can0 | canwatch -i replay:- --msg DISPLAY_SUCCESS
///     canwatch -i socketcan:can0 --monitor
#[derive(Debug, Parser)]
#[clap(version, verbatim_doc_comment)]
struct Args {
    #[clap(flatten)]
    log: LogArgs,

    /// The bus to watch: sim, replay:<path|->, or socketcan:<iface>
    #[clap(short, long, required_unless_present = "list")]
    interface: Option<String>,

    /// Comma separated names of predefined messages to watch for
    #[clap(short, long, value_delimiter = ',')]
    msg: Vec<String>,

    /// Watch for an arbitrary identifier (hex)
    #[clap(long)]
    id: Option<String>,

    /// Payload pattern for --id, e.g. "FF,00,XX"; X, XX, * and ? are wildcards
    #[clap(long, requires = "id")]
    data: Option<String>,

    /// Seconds to watch for. 0 watches until Ctrl-C
    #[clap(short, long, default_value_t = 0.0)]
    timeout: f64,

    /// Stop at the first match
    #[clap(short, long, conflicts_with = "all")]
    first: bool,

    /// Collect every match until the timeout (the default)
    #[clap(short, long)]
    all: bool,

    /// Only print matches, not every received frame
    #[clap(short, long)]
    quiet: bool,

    /// Print all traffic without matching anything
    #[clap(long, conflicts_with_all = ["msg", "id"])]
    monitor: bool,

    /// List the predefined messages and exit
    #[clap(long)]
    list: bool,

    /// Load predefined messages from this JSON catalog instead of the built-in one
    #[clap(long)]
    messages: Option<PathBuf>,

    /// Also write every match to this CSV file. stdout if '-'
    #[clap(long)]
    csv: Option<PathBuf>,
}

fn targets(args: &Args, registry: &Registry) -> eyre::Result<Vec<MatchTarget>> {
    let mut targets = registry.targets(&args.msg)?;
    if let Some(id) = &args.id {
        let identifier = parse_identifier(id)?;
        let pattern = args
            .data
            .as_deref()
            .map(str::parse::<PayloadPattern>)
            .transpose()?;
        let mut target = MatchTarget::new(identifier, pattern);
        if let Some(definition) = registry.find_by_identifier(identifier) {
            target.decode_info = Some(Arc::clone(definition));
        }
        targets.push(target);
    }
    Ok(targets)
}

fn main() -> eyre::Result<ExitCode> {
    let args = Args::parse();
    bican_utils::logging::init(&args.log)?;

    let registry = match &args.messages {
        Some(path) => Registry::from_path(path)?,
        None => Registry::builtin()?,
    };
    let mut stdout = std::io::stdout().lock();

    if args.list {
        for definition in registry.iter() {
            write_definition(&mut stdout, definition)?;
        }
        return Ok(ExitCode::SUCCESS);
    }

    let targets = targets(&args, &registry)?;
    if targets.is_empty() && !args.monitor {
        eyre::bail!("Nothing to watch for: pass --msg, --id, or --monitor");
    }
    let interface: AdapterConfig = args.interface.as_deref().unwrap_or("sim").parse()?;
    let config = WatchConfig {
        collect_all: args.all || !args.first,
        ..Default::default()
    }
    .with_timeout_secs(args.timeout)?;

    let stop = Arc::new(AtomicBool::new(false));
    let handler_stop = Arc::clone(&stop);
    ctrlc::set_handler(move || handler_stop.store(true, Ordering::Release))?;

    let session = if args.monitor {
        WatchSession::monitor(config)
    } else {
        WatchSession::new(targets, config)
    };
    write_watch_header(&mut stdout, session.targets(), session.config())?;
    let verbose = !args.quiet;
    if verbose {
        write_frame_header(&mut stdout)?;
    }

    let adapter = interface.open()?;
    let (_sink, mut source) = adapter.split();

    let start = Instant::now();
    let mut write_error = None;
    let report = session.run(source.as_mut(), &stop, |event| {
        let result = match event {
            WatchEvent::Frame { frame, matched, .. } if verbose => write_frame_row(
                &mut stdout,
                &Local::now(),
                frame,
                matched.map(|target| target.display_name.as_str()),
            ),
            WatchEvent::Frame { .. } => Ok(()),
            WatchEvent::Match {
                target,
                number,
                event,
            } => {
                let timestamp = event.wall_time.timestamp_micros() as f64 / 1e6;
                event
                    .frame
                    .write_candump(&mut stdout, timestamp, interface.label())
                    .and_then(|()| {
                        if verbose {
                            write_match_details(&mut stdout, target, number, event)
                        } else {
                            Ok(())
                        }
                    })
            }
        };
        if let Err(e) = result
            && write_error.is_none()
        {
            write_error = Some(e);
        }
    })?;
    drop(source);
    if let Some(e) = write_error {
        return Err(e.into());
    }

    write_watch_summary(&mut stdout, &report)?;
    stdout.flush()?;
    tracing::debug!("Watch finished in {:?}", start.elapsed());

    if let Some(path) = &args.csv {
        let writer = get_output_writer(&Some(path.clone()))?;
        report.write_csv(writer)?;
    }

    if args.monitor || report.any_match() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}
