use bican_test::{CommandExt, candump_log, tool};
use pretty_assertions::assert_eq;

const TRAFFIC: &str = "\
(1700000000.000100) can0 10630900#01\n\
(1700000000.000200) can0 104E0900#FEFF\n\
(1700000000.000300) can0 114F0900#FF0081\n\
(1700000000.000400) can0 104E0900#0A00\n\
";

#[test]
fn test_collects_every_match() {
    let output = tool!("canwatch")
        .args(["--interface", "replay:-", "--msg", "BI_USAGE", "--quiet"])
        .write_stdin(TRAFFIC)
        .captured_output()
        .unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    let candump: Vec<_> = stdout
        .lines()
        .filter(|line| line.starts_with('('))
        .map(|line| line.split_once(' ').unwrap().1)
        .collect();
    assert_eq!(candump, ["replay 104E0900#FEFF", "replay 104E0900#0A00"]);
    assert!(stdout.contains("| Messages: 4 | Matches: 2 | Ended: end of input"));
    assert!(stdout.contains("BI_USAGE: 2 match(es)"));
}

#[test]
fn test_first_match_stops() {
    let output = tool!("canwatch")
        .args(["--interface", "replay:-", "--msg", "bi_usage", "--first"])
        .write_stdin(TRAFFIC)
        .captured_output()
        .unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Mode: STOP AT FIRST"));
    assert!(stdout.contains("MATCH #1: BI_USAGE"));
    assert!(stdout.contains("FE FF                          <- BI_USAGE"));
    assert!(!stdout.contains("MATCH #2"));
    assert!(stdout.contains("| Messages: 2 | Matches: 1 | Ended: first match"));
}

#[test]
fn test_custom_identifier_and_pattern() {
    let output = tool!("canwatch")
        .args([
            "--interface",
            "replay:-",
            "--id",
            "114F0900",
            "--data",
            "FF,XX,81",
        ])
        .write_stdin(TRAFFIC)
        .captured_output()
        .unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("ID: 0x114F0900 | Data: [FF XX 81]"));
    assert!(stdout.contains("replay 114F0900#FF0081"));
    assert!(stdout.contains("Matches: 1"));
}

#[test]
fn test_no_match_fails() {
    let output = tool!("canwatch")
        .args(["--interface", "replay:-", "--msg", "BI_RESULTS,BI_USAGE"])
        .write_stdin(TRAFFIC)
        .captured_output()
        .unwrap();
    assert_eq!(output.status.code(), Some(0));

    let output = tool!("canwatch")
        .args(["--interface", "replay:-", "--msg", "BI_RESULTS"])
        .write_stdin(TRAFFIC)
        .captured_output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("No matches: BI_RESULTS"));
}

#[test]
fn test_unknown_message_is_rejected() {
    let output = tool!("canwatch")
        .args(["--interface", "replay:/definitely/not/here.log", "--msg", "NOPE"])
        .captured_output()
        .unwrap();
    assert!(!output.status.success());

    // Rejected before the replay log is opened
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Unknown message \"NOPE\""));
    assert!(!stderr.contains("Failed to open input file"));
}

#[test]
fn test_monitor_from_log_file() {
    let log = candump_log(TRAFFIC).unwrap();
    let interface = format!("replay:{}", log.path().display());
    let output = tool!("canwatch")
        .args(["--interface", &interface, "--monitor"])
        .captured_output()
        .unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("CAN BUS MONITOR"));
    assert!(stdout.contains("0x10630900   Ext    1    01"));
    assert!(stdout.contains("| Messages: 4 | Matches: 0 |"));
}

#[test]
fn test_csv_export() {
    let csv = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
    let output = tool!("canwatch")
        .args(["--interface", "replay:-", "--msg", "BI_USAGE", "--quiet", "--csv"])
        .arg(csv.path())
        .write_stdin(TRAFFIC)
        .captured_output()
        .unwrap();
    assert!(output.status.success());

    let contents = std::fs::read_to_string(csv.path()).unwrap();
    let lines: Vec<_> = contents.lines().collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0], "target,timestamp,elapsed_s,canid,extended,dlc,data");
    assert!(lines[1].starts_with("BI_USAGE,"));
    assert!(lines[1].ends_with(",0x104E0900,true,2,FEFF"));
    assert!(lines[2].ends_with(",0x104E0900,true,2,0A00"));
}

#[test]
fn test_list() {
    let output = tool!("canwatch").arg("--list").captured_output().unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("BI_RESULTS\n  ID: 0x102E0900 (Ext) | Data: ANY"));
    assert!(stdout.contains("DISPLAY_SUCCESS\n  ID: 0x114F0900 (Ext) | Data: [FF 00 81]"));
}

#[test]
fn test_oversized_timeout_is_rejected() {
    let output = tool!("canwatch")
        .args(["--interface", "replay:-", "--msg", "BI_USAGE", "--timeout", "1e20"])
        .write_stdin(TRAFFIC)
        .captured_output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Timeout must be a non-negative number of seconds"));
}
