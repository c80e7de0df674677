use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bican::AdapterConfig;
use bican::report::{write_case_header, write_stimuli, write_verification_report};
use bican::verify::{TestSuite, Verdict, VerificationRun, VerifyConfig};
use bican_utils::logging::LogArgs;
use clap::Parser;

/// Run a scripted Display firmware-update test case and verify the response
///
/// Sends the test case's command sequence while capturing bus traffic in the background, then
/// looks for the expected success or failure message. Exits 0 when it arrives, 1 otherwise, and
/// 130 when interrupted with Ctrl-C.
///
/// Examples:
///     canverify --tc 1
///     canverify -i socketcan:can0 --tc 5 --timeout 10
///     canverify --cases bench-cases.json --list
#[derive(Debug, Parser)]
#[clap(version, verbatim_doc_comment)]
struct Args {
    #[clap(flatten)]
    log: LogArgs,

    /// The test case number to run
    #[clap(long, required_unless_present = "list", conflicts_with = "list")]
    tc: Option<u32>,

    /// Load test cases from this JSON file instead of the built-in suite
    #[clap(long)]
    cases: Option<PathBuf>,

    /// The bus to test on: sim, replay:<path|->, or socketcan:<iface>
    #[clap(short, long, default_value = "sim")]
    interface: String,

    /// Seconds to wait for the expected response
    #[clap(short, long, default_value_t = 5.0)]
    timeout: f64,

    /// List the available test cases and exit
    #[clap(long)]
    list: bool,
}

fn main() -> eyre::Result<ExitCode> {
    let args = Args::parse();
    bican_utils::logging::init(&args.log)?;

    let suite = match &args.cases {
        Some(path) => TestSuite::from_path(path)?,
        None => TestSuite::builtin()?,
    };
    let mut stdout = std::io::stdout().lock();

    let Some(number) = args.tc else {
        for case in suite.iter() {
            writeln!(
                stdout,
                "TC{}: {} (expected {}, {} messages)",
                case.number,
                case.description,
                case.expected_result,
                case.stimuli.len()
            )?;
        }
        return Ok(ExitCode::SUCCESS);
    };

    let case = suite.get(number)?;
    let interface: AdapterConfig = args.interface.parse()?;
    let verification_timeout = match Duration::try_from_secs_f64(args.timeout) {
        Ok(timeout) if !timeout.is_zero() => timeout,
        _ => eyre::bail!(
            "Timeout must be a positive number of seconds, got {}",
            args.timeout
        ),
    };
    let config = VerifyConfig {
        verification_timeout,
        ..Default::default()
    };

    let stop = Arc::new(AtomicBool::new(false));
    let handler_stop = Arc::clone(&stop);
    ctrlc::set_handler(move || handler_stop.store(true, Ordering::Release))?;

    write_case_header(&mut stdout, case)?;
    write_stimuli(&mut stdout, case)?;
    stdout.flush()?;

    let start = Instant::now();
    let adapter = interface.open()?;
    let report = VerificationRun::new(config).run(case, adapter, &stop)?;
    write_verification_report(&mut stdout, case, &report)?;
    tracing::info!("Finished in {:?}", start.elapsed());

    match report.verdict {
        Verdict::Pass => Ok(ExitCode::SUCCESS),
        Verdict::Fail => Ok(ExitCode::FAILURE),
        Verdict::Interrupted => Ok(ExitCode::from(130)),
    }
}
