//! Human-readable rendering shared by the tools
use std::io::Write;
use std::time::Duration;

use chrono::{DateTime, Local};

use crate::frame::{ObservedFrame, format_payload};
use crate::matcher::{MatchTarget, describe_pattern};
use crate::registry::MessageDefinition;
use crate::verify::{Expectation, TestCase, Verdict, VerificationReport};
use crate::watch::{MatchEvent, WatchConfig, WatchOutcome, WatchReport};

/// Number of match times listed per target before only the first and last are shown
const MAX_LISTED_MATCHES: usize = 5;

fn rule(w: &mut dyn Write, c: char, width: usize) -> std::io::Result<()> {
    writeln!(w, "{}", c.to_string().repeat(width))
}

fn timestamp(when: &DateTime<Local>) -> String {
    when.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

fn describe_timeout(timeout: Option<Duration>) -> String {
    timeout.map_or_else(|| "none".to_string(), |t| format!("{:.1}s", t.as_secs_f64()))
}

/// Column headers for [write_frame_row]
pub fn write_frame_header(w: &mut dyn Write) -> std::io::Result<()> {
    writeln!(
        w,
        "{:<26} {:<12} {:<6} {:<4} {:<30} Match",
        "Timestamp", "ID", "Type", "DLC", "Data"
    )?;
    rule(w, '-', 95)
}

/// One table row per received frame
pub fn write_frame_row(
    w: &mut dyn Write,
    when: &DateTime<Local>,
    frame: &ObservedFrame,
    matched: Option<&str>,
) -> std::io::Result<()> {
    let id = if frame.extended {
        format!("0x{:08X}", frame.identifier)
    } else {
        format!("0x{:03X}", frame.identifier)
    };
    writeln!(
        w,
        "{:<26} {:<12} {:<6} {:<4} {:<30} {}",
        timestamp(when),
        id,
        if frame.extended { "Ext" } else { "Std" },
        frame.dlc(),
        format_payload(frame.payload()),
        matched.map_or(String::new(), |name| format!("<- {name}"))
    )
}

pub fn write_watch_header(
    w: &mut dyn Write,
    targets: &[MatchTarget],
    config: &WatchConfig,
) -> std::io::Result<()> {
    rule(w, '=', 80)?;
    if targets.is_empty() {
        writeln!(w, "CAN BUS MONITOR")?;
    } else {
        writeln!(w, "MONITORING {} TARGET(S)", targets.len())?;
    }
    writeln!(
        w,
        "Mode: {} | Timeout: {}",
        if config.collect_all {
            "COLLECT ALL"
        } else {
            "STOP AT FIRST"
        },
        describe_timeout(config.timeout)
    )?;
    rule(w, '=', 80)?;
    for (i, target) in targets.iter().enumerate() {
        writeln!(w, "Target {}: {}", i + 1, target.display_name)?;
        writeln!(
            w,
            "  ID: 0x{:X} | Data: {}",
            target.identifier,
            describe_pattern(target.pattern.as_ref())
        )?;
        if let Some(definition) = &target.decode_info
            && !definition.description.is_empty()
        {
            writeln!(w, "  Desc: {}", definition.description)?;
        }
    }
    if !targets.is_empty() {
        rule(w, '=', 80)?;
    }
    Ok(())
}

/// Everything known about a matched frame: raw bytes, byte descriptions, and decoded fields
pub fn write_match_details(
    w: &mut dyn Write,
    target: &MatchTarget,
    number: usize,
    event: &MatchEvent,
) -> std::io::Result<()> {
    let frame = &event.frame;
    rule(w, '-', 80)?;
    writeln!(w, "MATCH #{number}: {}", target.display_name)?;
    rule(w, '-', 80)?;
    writeln!(
        w,
        "  Time: {} (+{:.2}s)",
        timestamp(&event.wall_time),
        event.elapsed.as_secs_f64()
    )?;
    writeln!(
        w,
        "  ID:   0x{:X} ({})",
        frame.identifier,
        if frame.extended { "Ext" } else { "Std" }
    )?;
    writeln!(w, "  DLC:  {}", frame.dlc())?;
    writeln!(w, "  Data: {}", format_payload(frame.payload()))?;
    if let Some(definition) = &target.decode_info {
        write_decoded(w, definition, frame.payload())?;
    }
    rule(w, '-', 80)
}

/// The byte breakdown and decoded fields of a payload
pub fn write_decoded(
    w: &mut dyn Write,
    definition: &MessageDefinition,
    payload: &[u8],
) -> std::io::Result<()> {
    let mut breakdown = definition.byte_breakdown(payload).peekable();
    if breakdown.peek().is_some() {
        writeln!(w, "\n  Data Breakdown:")?;
        for (offset, byte, description) in breakdown {
            writeln!(w, "    [{}] 0x{byte:02X}: {description}", offset + 1)?;
        }
    }
    let decoded = definition.decode(payload);
    if !decoded.is_empty() {
        writeln!(w, "\n  Decoded Values:")?;
        for field in decoded.values() {
            writeln!(w, "    {field}")?;
        }
    }
    Ok(())
}

pub fn write_watch_summary(w: &mut dyn Write, report: &WatchReport) -> std::io::Result<()> {
    rule(w, '=', 80)?;
    let ended = match report.outcome {
        WatchOutcome::Matched => "first match",
        WatchOutcome::TimedOut => "timed out",
        WatchOutcome::StoppedByUser => "stopped by user",
        WatchOutcome::Exhausted => "end of input",
    };
    writeln!(
        w,
        "SUMMARY: {:.2}s | Messages: {} | Matches: {} | Ended: {ended}",
        report.elapsed.as_secs_f64(),
        report.frames_seen,
        report.total_matches()
    )?;
    rule(w, '=', 80)?;

    let mut unmatched = Vec::new();
    for target in &report.targets {
        let events = &target.events;
        let name = &target.target.display_name;
        let (Some(first), Some(last)) = (events.first(), events.last()) else {
            unmatched.push(name.as_str());
            continue;
        };
        writeln!(w, "\n{name}: {} match(es)", events.len())?;
        if events.len() <= MAX_LISTED_MATCHES {
            for (i, event) in events.iter().enumerate() {
                writeln!(
                    w,
                    "  #{}: {} (+{:.2}s)",
                    i + 1,
                    timestamp(&event.wall_time),
                    event.elapsed.as_secs_f64()
                )?;
            }
        } else {
            writeln!(w, "  First: {}", timestamp(&first.wall_time))?;
            writeln!(w, "  Last:  {}", timestamp(&last.wall_time))?;
        }
    }
    if !unmatched.is_empty() {
        writeln!(w, "\nNo matches: {}", unmatched.join(", "))?;
    }
    Ok(())
}

/// A catalog entry, as listed by `--list`
pub fn write_definition(w: &mut dyn Write, definition: &MessageDefinition) -> std::io::Result<()> {
    writeln!(w, "{}", definition.name)?;
    writeln!(
        w,
        "  ID: 0x{:X} ({}) | Data: {}",
        definition.identifier,
        if definition.extended { "Ext" } else { "Std" },
        describe_pattern(definition.payload_pattern.as_ref())
    )?;
    if !definition.description.is_empty() {
        writeln!(w, "  {}", definition.description)?;
    }
    for note in &definition.notes {
        writeln!(w, "    * {note}")?;
    }
    Ok(())
}

pub fn write_case_header(w: &mut dyn Write, case: &TestCase) -> std::io::Result<()> {
    rule(w, '=', 70)?;
    writeln!(w, "Test Case {}: {}", case.number, case.description)?;
    writeln!(w, "Expected Result: {}", case.expected_result)?;
    writeln!(w, "Total messages: {}", case.stimuli.len())?;
    rule(w, '=', 70)
}

/// The frames a test case sends, one per line
pub fn write_stimuli(w: &mut dyn Write, case: &TestCase) -> std::io::Result<()> {
    let total = case.stimuli.len();
    for (i, stimulus) in case.stimuli.iter().enumerate() {
        writeln!(w, "[{}/{total}] {} # {}", i + 1, stimulus.frame, stimulus.description)?;
    }
    Ok(())
}

pub fn write_verification_report(
    w: &mut dyn Write,
    case: &TestCase,
    report: &VerificationReport,
) -> std::io::Result<()> {
    for failure in &report.send.failures {
        writeln!(
            w,
            "[SEND FAILED] {}/{}: {:#}",
            failure.index + 1,
            report.send.total,
            failure.error
        )?;
    }
    rule(w, '=', 70)?;
    writeln!(w, "VERIFICATION")?;
    rule(w, '=', 70)?;
    for target in case.expectation.targets() {
        writeln!(w, "Expected: {target}")?;
    }
    match (&report.matched, &case.expectation) {
        (Some((_, frame)), Expectation::Success(_)) => {
            writeln!(w, "SUCCESS: Display sent the expected success message: {frame}")?
        }
        (Some((_, frame)), Expectation::Failure(_)) => writeln!(
            w,
            "EXPECTED FAILURE: Display sent the expected error message: {frame}"
        )?,
        (None, _) if report.verdict == Verdict::Interrupted => {
            writeln!(w, "Interrupted before the expected frame was received")?
        }
        (None, _) => writeln!(w, "Expected frame not received")?,
    }
    rule(w, '=', 70)?;
    writeln!(w, "TEST RESULTS")?;
    rule(w, '=', 70)?;
    writeln!(w, "Messages Sent: {}/{}", report.send.sent(), report.send.total)?;
    writeln!(
        w,
        "Send Speed: {:.2}ms total",
        report.send.elapsed.as_secs_f64() * 1000.0
    )?;
    writeln!(w, "Frames Captured: {}", report.frames_captured)?;
    writeln!(w, "Verification: {}", report.verdict)?;
    writeln!(w, "Test Case {}: {}", report.case_number, report.verdict)?;
    rule(w, '=', 70)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::registry::Registry;
    use crate::watch::TargetMatches;

    fn render(f: impl FnOnce(&mut dyn Write) -> std::io::Result<()>) -> String {
        let mut out = Vec::new();
        f(&mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    fn event(seconds: u64, payload: &[u8]) -> MatchEvent {
        MatchEvent {
            wall_time: Local::now(),
            elapsed: Duration::from_secs(seconds),
            frame: ObservedFrame::inferred(0x104E0900, payload).unwrap(),
        }
    }

    #[test]
    fn test_decoded_details() {
        let registry = Registry::builtin().unwrap();
        let target = MatchTarget::from_definition(registry.resolve("BI_USAGE").unwrap());
        let out = render(|w| write_match_details(w, &target, 1, &event(2, &[0xFE, 0xFF])));

        assert!(out.contains("MATCH #1: BI_USAGE"));
        assert!(out.contains("  ID:   0x104E0900 (Ext)"));
        assert!(out.contains("  Data: FE FF"));
        assert!(out.contains("    [1] 0xFE: Days from Due (Bits 0-7) - signed 16-bit"));
        assert!(out.contains("    Days from Due: -2 days -> OVERDUE by 2 days"));
    }

    #[test]
    fn test_summary_lists_or_elides_match_times() {
        let registry = Registry::builtin().unwrap();
        let targets = registry.targets(&["BI_USAGE", "BI_RESULTS"]).unwrap();
        let report = WatchReport {
            outcome: WatchOutcome::TimedOut,
            frames_seen: 9,
            elapsed: Duration::from_secs(3),
            targets: vec![
                TargetMatches {
                    target: targets[0].clone(),
                    events: (0..7).map(|i| event(i, &[0x00, 0x00])).collect(),
                },
                TargetMatches {
                    target: targets[1].clone(),
                    events: Vec::new(),
                },
            ],
        };
        let out = render(|w| write_watch_summary(w, &report));
        assert!(out.contains("SUMMARY: 3.00s | Messages: 9 | Matches: 7 | Ended: timed out"));
        assert!(out.contains("BI_USAGE: 7 match(es)"));
        assert!(out.contains("  First: "));
        assert!(!out.contains("  #1: "));
        assert!(out.contains("No matches: BI_RESULTS"));
    }

    #[test]
    fn test_frame_row() {
        let frame = ObservedFrame::inferred(0x123, &[0x01, 0x02]).unwrap();
        let out = render(|w| write_frame_row(w, &Local::now(), &frame, Some("X")));
        let columns: Vec<_> = out.split_whitespace().collect();
        assert_eq!(&columns[2..], ["0x123", "Std", "2", "01", "02", "<-", "X"]);
    }

    #[test]
    fn test_interrupted_verification() {
        let suite = crate::verify::TestSuite::builtin().unwrap();
        let case = suite.get(1).unwrap();
        let report = VerificationReport {
            case_number: 1,
            send: crate::verify::SendReport {
                total: 12,
                failures: Vec::new(),
                elapsed: Duration::from_millis(3),
            },
            verdict: Verdict::Interrupted,
            matched: None,
            frames_captured: 0,
        };
        let out = render(|w| write_verification_report(w, case, &report));
        assert!(out.contains("Interrupted before the expected frame was received"));
        assert!(out.contains("Messages Sent: 12/12"));
        assert!(out.contains("Test Case 1: INTERRUPTED"));
    }

    #[test]
    fn test_definition_listing() {
        let registry = Registry::builtin().unwrap();
        let out = render(|w| write_definition(w, registry.resolve("DISPLAY_SUCCESS").unwrap()));
        assert_eq!(
            out,
            "DISPLAY_SUCCESS\n  ID: 0x114F0900 (Ext) | Data: [FF 00 81]\n  Display Update Success Message\n    * Indicates successful firmware update completion\n"
        );
    }
}
