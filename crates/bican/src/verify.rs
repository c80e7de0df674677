//! Scripted send-then-verify runs of firmware update test cases
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use eyre::WrapErr;
use serde::Deserialize;

use crate::adapter::{Adapter, FrameSink};
use crate::capture::{CaptureBuffer, CaptureMatch};
use crate::frame::{ObservedFrame, parse_payload};
use crate::matcher::{MatchTarget, PayloadPattern};
use crate::registry::RawIdentifier;

const BUILTIN_CASES: &str = include_str!("cases.json");

/// The verdict a test case is expected to produce. Only used for reporting
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExpectedResult {
    Pass,
    Fail,
}

impl fmt::Display for ExpectedResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpectedResult::Pass => write!(f, "PASS"),
            ExpectedResult::Fail => write!(f, "FAIL"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Stimulus {
    pub frame: ObservedFrame,
    pub description: String,
}

/// The frames the Display should send in response to a test case
#[derive(Clone, Debug)]
pub enum Expectation {
    /// Completion of the update
    Success(Vec<MatchTarget>),
    /// The Display's error report
    Failure(Vec<MatchTarget>),
}

impl Expectation {
    #[must_use]
    pub fn targets(&self) -> &[MatchTarget] {
        match self {
            Expectation::Success(targets) | Expectation::Failure(targets) => targets,
        }
    }
}

#[derive(Clone, Debug)]
pub struct TestCase {
    pub number: u32,
    pub description: String,
    pub expected_result: ExpectedResult,
    pub stimuli: Vec<Stimulus>,
    pub expectation: Expectation,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStimulus {
    identifier: RawIdentifier,
    #[serde(default)]
    extended: Option<bool>,
    payload: String,
    #[serde(default)]
    description: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTarget {
    identifier: RawIdentifier,
    #[serde(default)]
    pattern: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCase {
    number: u32,
    description: String,
    expected_result: ExpectedResult,
    stimuli: Vec<RawStimulus>,
    #[serde(default)]
    verify_success: Option<Vec<RawTarget>>,
    #[serde(default)]
    verify_failure: Option<Vec<RawTarget>>,
}

impl RawStimulus {
    fn into_stimulus(self) -> eyre::Result<Stimulus> {
        let identifier = self.identifier.resolve()?;
        let payload = parse_payload(&self.payload)?;
        let frame = match self.extended {
            Some(extended) => ObservedFrame::new(identifier, extended, &payload)?,
            None => ObservedFrame::inferred(identifier, &payload)?,
        };
        Ok(Stimulus {
            frame,
            description: self.description,
        })
    }
}

impl RawTarget {
    fn into_target(self) -> eyre::Result<MatchTarget> {
        let identifier = self.identifier.resolve()?;
        let pattern = self
            .pattern
            .map(|p| p.parse::<PayloadPattern>())
            .transpose()?;
        let target = MatchTarget::new(identifier, pattern);
        Ok(match self.name {
            Some(name) => target.with_name(name),
            None => target,
        })
    }
}

fn into_targets(raw: Vec<RawTarget>) -> eyre::Result<Vec<MatchTarget>> {
    if raw.is_empty() {
        eyre::bail!("Expected at least one verification target");
    }
    raw.into_iter().map(RawTarget::into_target).collect()
}

impl RawCase {
    fn into_case(self) -> eyre::Result<TestCase> {
        let number = self.number;
        let expectation = match (self.verify_success, self.verify_failure) {
            (Some(success), None) => Expectation::Success(into_targets(success)?),
            (None, Some(failure)) => Expectation::Failure(into_targets(failure)?),
            _ => eyre::bail!(
                "Test case {number} needs exactly one of verify_success and verify_failure"
            ),
        };
        let stimuli = self
            .stimuli
            .into_iter()
            .enumerate()
            .map(|(i, s)| {
                s.into_stimulus()
                    .wrap_err(format!("Test case {number}: invalid stimulus {}", i + 1))
            })
            .collect::<eyre::Result<Vec<_>>>()?;
        if stimuli.is_empty() {
            eyre::bail!("Test case {number} has no stimuli");
        }
        Ok(TestCase {
            number,
            description: self.description,
            expected_result: self.expected_result,
            stimuli,
            expectation,
        })
    }
}

/// Test cases by number
#[derive(Clone, Debug, Default)]
pub struct TestSuite {
    cases: BTreeMap<u32, TestCase>,
}

impl TestSuite {
    /// The firmware update cases shipped with the tools
    pub fn builtin() -> eyre::Result<Self> {
        Self::from_json(BUILTIN_CASES).wrap_err("Built-in test cases are invalid")
    }

    pub fn from_json(json: &str) -> eyre::Result<Self> {
        let raw: Vec<RawCase> =
            serde_json::from_str(json).wrap_err("Failed to parse test cases")?;
        let mut cases = BTreeMap::new();
        for raw_case in raw {
            let case = raw_case.into_case()?;
            if cases.contains_key(&case.number) {
                eyre::bail!("Duplicate test case number {}", case.number);
            }
            cases.insert(case.number, case);
        }
        Ok(Self { cases })
    }

    pub fn from_path(path: &Path) -> eyre::Result<Self> {
        let json =
            std::fs::read_to_string(path).wrap_err(format!("Failed to read test cases {path:?}"))?;
        Self::from_json(&json).wrap_err(format!("Invalid test cases {path:?}"))
    }

    pub fn get(&self, number: u32) -> eyre::Result<&TestCase> {
        self.cases.get(&number).ok_or_else(|| {
            eyre::eyre!(
                "Test case {number} not found. Available test cases: {}",
                itertools::join(self.cases.keys(), ", ")
            )
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &TestCase> {
        self.cases.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cases.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }
}

#[derive(Debug)]
pub struct SendFailure {
    /// Position of the stimulus in the sequence, from 0
    pub index: usize,
    pub error: eyre::Report,
}

#[derive(Debug)]
pub struct SendReport {
    pub total: usize,
    pub failures: Vec<SendFailure>,
    pub elapsed: Duration,
}

impl SendReport {
    #[must_use]
    pub fn sent(&self) -> usize {
        self.total - self.failures.len()
    }
}

/// Send every stimulus in order, waiting `delay` between consecutive frames
///
/// A failed send is logged and counted, and the rest of the sequence is still sent.
pub fn send_sequence(sink: &mut dyn FrameSink, stimuli: &[Stimulus], delay: Duration) -> SendReport {
    let start = Instant::now();
    let mut failures = Vec::new();
    for (index, stimulus) in stimuli.iter().enumerate() {
        if index > 0 && !delay.is_zero() {
            std::thread::sleep(delay);
        }
        match sink.send(&stimulus.frame) {
            Ok(()) => tracing::trace!("Sent {} # {}", stimulus.frame, stimulus.description),
            Err(error) => {
                tracing::warn!(
                    "Failed to send stimulus {}/{} ({}): {error:#}",
                    index + 1,
                    stimuli.len(),
                    stimulus.frame
                );
                failures.push(SendFailure { index, error });
            }
        }
    }
    SendReport {
        total: stimuli.len(),
        failures,
        elapsed: start.elapsed(),
    }
}

#[derive(Clone, Debug)]
pub struct VerifyConfig {
    /// How long to look for the expected response after the last stimulus
    pub verification_timeout: Duration,
    /// How often the capture buffer is rescanned
    pub scan_interval: Duration,
    /// Capture receive poll
    pub poll: Duration,
    /// Bound on waiting for the capture thread to stop
    pub join_timeout: Duration,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            verification_timeout: Duration::from_secs(5),
            scan_interval: Duration::from_millis(10),
            poll: Duration::from_millis(100),
            join_timeout: Duration::from_secs(1),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Fail,
    /// Stopped by the user before the expected frame showed up
    Interrupted,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Pass => write!(f, "PASSED"),
            Verdict::Fail => write!(f, "FAILED"),
            Verdict::Interrupted => write!(f, "INTERRUPTED"),
        }
    }
}

#[derive(Debug)]
pub struct VerificationReport {
    pub case_number: u32,
    pub send: SendReport,
    pub verdict: Verdict,
    /// The expected frame, and the target it matched
    pub matched: Option<(MatchTarget, ObservedFrame)>,
    pub frames_captured: usize,
}

pub struct VerificationRun {
    config: VerifyConfig,
}

impl VerificationRun {
    pub fn new(config: VerifyConfig) -> Self {
        Self { config }
    }

    /// Run one test case over the given adapter, which is released before this returns
    ///
    /// Failing to find the expected response is a [Verdict::Fail]. Setting `stop` ends the scan
    /// early with a [Verdict::Interrupted]. Losing the adapter partway through is an error.
    pub fn run(
        &self,
        case: &TestCase,
        adapter: Adapter,
        stop: &AtomicBool,
    ) -> eyre::Result<VerificationReport> {
        let (mut sink, source) = adapter.split();
        let mut capture = CaptureBuffer::start(source, self.config.poll, self.config.join_timeout)
            .wrap_err("Failed to start capture")?;

        tracing::info!(
            "Test case {}: sending {} frames",
            case.number,
            case.stimuli.len()
        );
        let send = send_sequence(sink.as_mut(), &case.stimuli, Duration::ZERO);
        tracing::info!(
            "Sent {}/{} frames in {:.2?}",
            send.sent(),
            send.total,
            send.elapsed
        );

        let targets = case.expectation.targets();
        let found = capture.wait_for(
            targets,
            self.config.verification_timeout,
            self.config.scan_interval,
            stop,
        );

        drop(capture.stop());
        drop(sink);
        if let Some(failure) = capture.take_failure() {
            return Err(failure.wrap_err(format!(
                "Adapter failed during test case {}",
                case.number
            )));
        }

        let verdict = if found.is_some() {
            Verdict::Pass
        } else if stop.load(Ordering::Acquire) {
            Verdict::Interrupted
        } else {
            Verdict::Fail
        };
        tracing::info!("Test case {}: {verdict}", case.number);
        Ok(VerificationReport {
            case_number: case.number,
            send,
            verdict,
            matched: found.map(|CaptureMatch { target, frame }| (targets[target].clone(), frame)),
            frames_captured: capture.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::adapter::{UPDATE_COMMAND_ID, simulated_display, virtual_bus};

    fn quick() -> VerifyConfig {
        VerifyConfig {
            verification_timeout: Duration::from_millis(300),
            scan_interval: Duration::from_millis(5),
            poll: Duration::from_millis(5),
            join_timeout: Duration::from_secs(1),
        }
    }

    fn run_builtin(number: u32) -> VerificationReport {
        let suite = TestSuite::builtin().unwrap();
        let case = suite.get(number).unwrap();
        let adapter = simulated_display().unwrap();
        VerificationRun::new(quick())
            .run(case, adapter, &AtomicBool::new(false))
            .unwrap()
    }

    #[test]
    fn test_builtin_suite() {
        let suite = TestSuite::builtin().unwrap();
        assert_eq!(suite.len(), 8);
        let numbers: Vec<_> = suite.iter().map(|c| c.number).collect();
        assert_eq!(numbers, [1, 2, 3, 4, 5, 6, 7, 8]);

        let case = suite.get(1).unwrap();
        assert_eq!(case.stimuli.len(), 12);
        assert_eq!(case.expected_result, ExpectedResult::Pass);
        assert!(matches!(case.expectation, Expectation::Success(_)));
        assert!(case.stimuli.iter().all(|s| s.frame.identifier == UPDATE_COMMAND_ID));
        assert!(case.stimuli.iter().all(|s| s.frame.extended));

        let case = suite.get(7).unwrap();
        assert_eq!(case.expected_result, ExpectedResult::Fail);
        assert!(matches!(case.expectation, Expectation::Failure(_)));
        assert_eq!(case.stimuli[3].frame.payload(), &[0xFF]);

        let err = suite.get(9).unwrap_err();
        assert!(err.to_string().contains("1, 2, 3, 4, 5, 6, 7, 8"));
    }

    #[test]
    fn test_ideal_case_passes() {
        let report = run_builtin(1);
        assert_eq!(report.verdict, Verdict::Pass);
        assert_eq!(report.send.sent(), 12);
        assert_eq!(report.send.total, 12);
        let (target, frame) = report.matched.unwrap();
        assert_eq!(target.identifier, 0x114F0900);
        assert_eq!(frame.payload(), &[0xFF, 0x00, 0x81]);
    }

    #[test]
    fn test_single_retry_tolerated() {
        assert_eq!(run_builtin(3).verdict, Verdict::Pass);
        assert_eq!(run_builtin(4).verdict, Verdict::Pass);
    }

    #[test]
    fn test_double_retry_fatal() {
        let report = run_builtin(5);
        assert_eq!(report.verdict, Verdict::Fail);
        assert!(report.matched.is_none());
        assert_eq!(run_builtin(6).verdict, Verdict::Fail);
    }

    #[test]
    fn test_unexpected_command_fails() {
        assert_eq!(run_builtin(7).verdict, Verdict::Fail);
    }

    #[test]
    fn test_pre_stimulus_noise_ignored() {
        assert_eq!(run_builtin(8).verdict, Verdict::Pass);
        assert_eq!(run_builtin(2).verdict, Verdict::Pass);
    }

    #[test]
    fn test_prefix_response_passes() {
        let suite = TestSuite::builtin().unwrap();
        let case = suite.get(1).unwrap();
        let (near, mut far) = virtual_bus();
        // Answers the last stimulus with a longer success frame
        let total = case.stimuli.len();
        let node = std::thread::spawn(move || {
            let mut seen = 0;
            while seen < total {
                if let Ok(Some(_)) = far.source.receive(Duration::from_millis(10)) {
                    seen += 1;
                }
            }
            let reply = ObservedFrame::inferred(0x114F0900, &[0xFF, 0x00, 0x81, 0x02]).unwrap();
            far.sink.send(&reply).unwrap();
            far
        });

        let report = VerificationRun::new(quick())
            .run(case, near, &AtomicBool::new(false))
            .unwrap();
        assert_eq!(report.verdict, Verdict::Pass);
        drop(node.join().unwrap());
    }

    #[test]
    fn test_burst_is_sent_in_order_with_capture_running() {
        let suite = TestSuite::builtin().unwrap();
        let case = suite.get(8).unwrap();
        let (near, mut far) = virtual_bus();
        let (tx, rx) = mpsc::channel();
        let total = case.stimuli.len();
        let node = std::thread::spawn(move || {
            let mut payloads = Vec::new();
            while payloads.len() < total {
                if let Ok(Some(frame)) = far.source.receive(Duration::from_millis(10)) {
                    // Answer the very first stimulus, mid-burst
                    if payloads.is_empty() {
                        let reply = ObservedFrame::inferred(0x114F0900, &[0xFF, 0x00, 0x81]);
                        far.sink.send(&reply.unwrap()).unwrap();
                    }
                    payloads.push(frame.payload()[0]);
                }
            }
            tx.send(payloads).unwrap();
            far
        });

        let report = VerificationRun::new(quick())
            .run(case, near, &AtomicBool::new(false))
            .unwrap();
        assert_eq!(report.verdict, Verdict::Pass);
        assert_eq!(report.send.sent(), total);

        let payloads = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        let expected: Vec<u8> = case.stimuli.iter().map(|s| s.frame.payload()[0]).collect();
        assert_eq!(payloads, expected);
        drop(node.join().unwrap());
    }

    #[test]
    fn test_stop_ends_the_run() {
        let suite = TestSuite::builtin().unwrap();
        let case = suite.get(5).unwrap();
        let config = VerifyConfig {
            verification_timeout: Duration::from_secs(30),
            ..quick()
        };
        let adapter = simulated_display().unwrap();

        let start = Instant::now();
        let report = VerificationRun::new(config)
            .run(case, adapter, &AtomicBool::new(true))
            .unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(report.verdict, Verdict::Interrupted);
        assert_eq!(report.send.total, case.stimuli.len());
        assert!(report.matched.is_none());
    }

    #[test]
    fn test_send_failures_are_counted() {
        let suite = TestSuite::builtin().unwrap();
        let case = suite.get(1).unwrap();
        let (near, far) = virtual_bus();
        let (mut sink, _source) = near.split();
        drop(far);

        let report = send_sequence(sink.as_mut(), &case.stimuli, Duration::ZERO);
        assert_eq!(report.total, 12);
        assert_eq!(report.sent(), 0);
        assert_eq!(report.failures.len(), 12);
        assert_eq!(report.failures[11].index, 11);
    }

    #[test]
    fn test_adapter_failure_is_an_error() {
        let suite = TestSuite::builtin().unwrap();
        let case = suite.get(1).unwrap();
        let (near, far) = virtual_bus();
        drop(far);
        let result = VerificationRun::new(quick()).run(case, near, &AtomicBool::new(false));
        assert!(result.is_err());
    }

    #[test]
    fn test_case_json_validation() {
        let good = r#"[{"number": 1, "description": "d", "expected_result": "PASS",
            "stimuli": [{"identifier": "0x123", "payload": "01 02"}],
            "verify_success": [{"identifier": 256, "pattern": "FF XX", "name": "OK"}]}]"#;
        let suite = TestSuite::from_json(good).unwrap();
        let case = suite.get(1).unwrap();
        assert!(!case.stimuli[0].frame.extended);
        assert_eq!(case.expectation.targets()[0].to_string(), "OK (ID=0x100, Data=[FF XX])");

        let both = good.replace(
            r#""verify_success""#,
            r#""verify_failure": [{"identifier": 1}], "verify_success""#,
        );
        assert!(TestSuite::from_json(&both).is_err());
        let neither = r#"[{"number": 1, "description": "d", "expected_result": "PASS",
            "stimuli": [{"identifier": "0x123", "payload": "01"}]}]"#;
        assert!(TestSuite::from_json(neither).is_err());
        let empty = good.replace(r#"{"identifier": "0x123", "payload": "01 02"}"#, "");
        assert!(TestSuite::from_json(&empty).is_err());
        let bad_label = good.replace("PASS", "MAYBE");
        assert!(TestSuite::from_json(&bad_label).is_err());
        let duplicate = format!("[{0}, {0}]", &good[1..good.len() - 1]);
        assert!(TestSuite::from_json(&duplicate).is_err());
    }
}
