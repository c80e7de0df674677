use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use bican::datetime::{encode_datetime, encode_seconds, is_datetime_message, parse_datetime};
use bican::frame::{parse_identifier, parse_payload};
use bican::report::{write_case_header, write_decoded, write_definition, write_stimuli};
use bican::verify::{TestSuite, send_sequence};
use bican::{AdapterConfig, MessageDefinition, ObservedFrame, Registry};
use bican_utils::logging::LogArgs;
use chrono::Utc;
use clap::Parser;

/// Send CAN messages
///
/// Sends a single predefined message (--msg), a raw frame (--id/--data), or the whole stimulus
/// sequence of a test case (--tc) without verifying the response.
///
/// Date/time messages take their payload from --now, --timestamp, or --datetime. The payload is
/// the number of seconds since 2016-01-01 00:00:00 UTC, little endian, followed by a reserved
/// zero byte.
///
/// Examples:
///     cansend -i socketcan:can0 --msg CURRENT_DATETIME_DISPLAY --now
///     cansend -i socketcan:can0 --msg CURRENT_DATETIME_CONTROL --datetime "2024-03-01 12:00:00"
///     cansend -i socketcan:can0 --id 0x11500700 --data 01
///     cansend -i socketcan:can0 --tc 5 --delay 50
#[derive(Debug, Parser)]
#[clap(version, verbatim_doc_comment)]
struct Args {
    #[clap(flatten)]
    log: LogArgs,

    /// The bus to send on: sim, replay:<path|->, or socketcan:<iface>
    #[clap(short, long, default_value = "sim")]
    interface: String,

    /// Name of a predefined message to send
    #[clap(short, long, conflicts_with_all = ["id", "tc"])]
    msg: Option<String>,

    /// Send a frame with this identifier (hex)
    #[clap(long, conflicts_with = "tc")]
    id: Option<String>,

    /// Force a 29-bit identifier for --id
    #[clap(long, requires = "id", conflicts_with = "standard")]
    extended: bool,

    /// Force an 11-bit identifier for --id
    #[clap(long, requires = "id")]
    standard: bool,

    /// Payload bytes, e.g. "01 02 03" or "010203"
    #[clap(short, long, conflicts_with_all = ["now", "timestamp", "datetime"])]
    data: Option<String>,

    /// Use the current time as a date/time payload
    #[clap(long, conflicts_with_all = ["timestamp", "datetime"])]
    now: bool,

    /// Seconds since 2016-01-01 00:00:00 UTC as a date/time payload
    #[clap(long, conflicts_with = "datetime")]
    timestamp: Option<u32>,

    /// "YYYY-MM-DD HH:MM:SS" in UTC as a date/time payload
    #[clap(long)]
    datetime: Option<String>,

    /// Send the stimulus sequence of this test case
    #[clap(long)]
    tc: Option<u32>,

    /// Milliseconds between frames with --tc
    #[clap(long, default_value_t = 100, requires = "tc")]
    delay: u64,

    /// Load test cases from this JSON file instead of the built-in suite
    #[clap(long)]
    cases: Option<PathBuf>,

    /// Load predefined messages from this JSON catalog instead of the built-in one
    #[clap(long)]
    messages: Option<PathBuf>,

    /// List the predefined messages and exit
    #[clap(long)]
    list: bool,
}

impl Args {
    fn datetime_payload(&self) -> eyre::Result<Option<[u8; 5]>> {
        if self.now {
            return encode_datetime(Utc::now()).map(Some);
        }
        if let Some(seconds) = self.timestamp {
            return Ok(Some(encode_seconds(seconds)));
        }
        if let Some(text) = &self.datetime {
            return encode_datetime(parse_datetime(text)?).map(Some);
        }
        Ok(None)
    }
}

/// The bytes a definition's pattern pins down, if it has no wildcards
fn fixed_payload(definition: &MessageDefinition) -> Option<Vec<u8>> {
    let pattern = definition.payload_pattern.as_ref()?;
    pattern.bytes().iter().copied().collect()
}

fn build_frame(
    args: &Args,
    registry: &Registry,
) -> eyre::Result<(ObservedFrame, Option<Arc<MessageDefinition>>)> {
    let datetime = args.datetime_payload()?;

    if let Some(name) = &args.msg {
        let definition = registry.resolve(name)?;
        let payload = match (datetime, &args.data) {
            (Some(payload), _) if is_datetime_message(definition) => payload.to_vec(),
            (Some(_), _) => eyre::bail!("{} is not a date/time message", definition.name),
            (None, Some(data)) => parse_payload(data)?,
            (None, None) if is_datetime_message(definition) => {
                eyre::bail!(
                    "{} needs a payload: pass --now, --timestamp, or --datetime",
                    definition.name
                )
            }
            (None, None) => fixed_payload(definition).ok_or_else(|| {
                eyre::eyre!("{} has no fixed payload, pass --data", definition.name)
            })?,
        };
        let frame = ObservedFrame::new(definition.identifier, definition.extended, &payload)?;
        return Ok((frame, Some(Arc::clone(definition))));
    }

    let Some(id) = &args.id else {
        eyre::bail!("Nothing to send: pass --msg, --id, or --tc");
    };
    let identifier = parse_identifier(id)?;
    let payload = match (datetime, &args.data) {
        (Some(payload), _) => payload.to_vec(),
        (None, Some(data)) => parse_payload(data)?,
        (None, None) => eyre::bail!("--data is required with --id"),
    };
    let frame = if args.extended {
        ObservedFrame::new(identifier, true, &payload)?
    } else if args.standard {
        ObservedFrame::new(identifier, false, &payload)?
    } else {
        ObservedFrame::inferred(identifier, &payload)?
    };
    let definition = registry.find_by_identifier(identifier).cloned();
    Ok((frame, definition))
}

fn send_case(args: &Args, number: u32, interface: &AdapterConfig) -> eyre::Result<ExitCode> {
    let suite = match &args.cases {
        Some(path) => TestSuite::from_path(path)?,
        None => TestSuite::builtin()?,
    };
    let case = suite.get(number)?;

    let mut stdout = std::io::stdout().lock();
    write_case_header(&mut stdout, case)?;
    write_stimuli(&mut stdout, case)?;

    let (mut sink, _source) = interface.open()?.split();
    let report = send_sequence(
        sink.as_mut(),
        &case.stimuli,
        Duration::from_millis(args.delay),
    );
    for failure in &report.failures {
        writeln!(
            stdout,
            "[SEND FAILED] {}/{}: {:#}",
            failure.index + 1,
            report.total,
            failure.error
        )?;
    }
    writeln!(
        stdout,
        "Messages Sent: {}/{} in {:.2?}",
        report.sent(),
        report.total,
        report.elapsed
    )?;

    if report.failures.is_empty() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

fn main() -> eyre::Result<ExitCode> {
    let args = Args::parse();
    bican_utils::logging::init(&args.log)?;

    let registry = match &args.messages {
        Some(path) => Registry::from_path(path)?,
        None => Registry::builtin()?,
    };
    if args.list {
        let mut stdout = std::io::stdout().lock();
        for definition in registry.iter() {
            write_definition(&mut stdout, definition)?;
        }
        return Ok(ExitCode::SUCCESS);
    }

    let interface: AdapterConfig = args.interface.parse()?;
    if let Some(number) = args.tc {
        return send_case(&args, number, &interface);
    }

    let (frame, definition) = build_frame(&args, &registry)?;
    let (mut sink, _source) = interface.open()?.split();
    sink.send(&frame)?;
    tracing::info!("Sent {frame} on {interface}");

    let mut stdout = std::io::stdout().lock();
    match &definition {
        Some(definition) => writeln!(stdout, "Sent {}: {frame}", definition.name)?,
        None => writeln!(stdout, "Sent {frame}")?,
    }
    if let Some(definition) = &definition {
        write_decoded(&mut stdout, definition, frame.payload())?;
    }
    Ok(ExitCode::SUCCESS)
}
