//! Reading frames back out of can-utils candump logs
use std::io::{BufRead, Lines};

use eyre::WrapErr;

use crate::frame::{MAX_DLC, MAX_STANDARD_ID, ObservedFrame};

/// File format of the candump
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CandumpFormat {
    /// Pick the format of the first line that parses, and stick with it
    Auto,
    /// candump -L/-l format
    CanUtilsFile,
    /// candump -ta format
    CanUtilsCli,
}

/// Parse [ObservedFrame]s from the given reader
///
/// Blank lines are skipped; every other line produces one item.
pub struct CandumpParser<R: BufRead> {
    format: CandumpFormat,
    lines: Lines<R>,
}

impl<R: BufRead> CandumpParser<R> {
    pub fn new(reader: R) -> Self {
        Self {
            format: CandumpFormat::Auto,
            lines: reader.lines(),
        }
    }
}

impl<R: BufRead> Iterator for CandumpParser<R> {
    type Item = eyre::Result<ObservedFrame>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => return Some(Err(eyre::eyre!("Failed to read line: {e}"))),
            };
            if line.trim().is_empty() {
                continue;
            }
            return Some(self.format.parse(&line));
        }
    }
}

impl CandumpFormat {
    /// Attempt to parse an [ObservedFrame] from the given line
    pub fn parse(&mut self, line: &str) -> eyre::Result<ObservedFrame> {
        match self {
            CandumpFormat::Auto => {
                if let Ok(frame) = parse_candump_file_msg(line) {
                    *self = CandumpFormat::CanUtilsFile;
                    Ok(frame)
                } else if let Ok(frame) = parse_candump_cli_msg(line) {
                    *self = CandumpFormat::CanUtilsCli;
                    Ok(frame)
                } else {
                    eyre::bail!("Failed to parse {line:?} with all known candump formats")
                }
            }
            CandumpFormat::CanUtilsFile => parse_candump_file_msg(line),
            CandumpFormat::CanUtilsCli => parse_candump_cli_msg(line),
        }
    }
}

fn strip_outer_brackets(s: &str, open: char, close: char) -> &str {
    let s = s.strip_prefix(open).unwrap_or(s);
    s.strip_suffix(close).unwrap_or(s)
}

/// candump writes extended identifiers zero-padded to 8 digits
fn parse_canid(text: &str) -> eyre::Result<(u32, bool)> {
    let canid = u32::from_str_radix(text, 16).wrap_err("Failed to parse canid as u32")?;
    let extended = text.len() > 3 || canid > MAX_STANDARD_ID;
    Ok((canid, extended))
}

/// Parse candumps with the format
///
/// ```text
/// $ candump -ta can0
/// (1739136517.221471)  can0  123   [3]  0A B0 3F
/// ```
fn parse_candump_cli_msg(line: &str) -> eyre::Result<ObservedFrame> {
    let mut parts = line.split_ascii_whitespace();
    let Some(maybe_timestamp) = parts.next() else {
        eyre::bail!("Line {line:?} empty");
    };
    let maybe_timestamp = strip_outer_brackets(maybe_timestamp, '(', ')');
    let _: f64 = maybe_timestamp
        .parse()
        .wrap_err("Failed to parse timestamp as f64")?;
    let Some(_interface) = parts.next() else {
        eyre::bail!("Failed to parse interface from: {line:?}");
    };
    let Some(maybe_canid) = parts.next() else {
        eyre::bail!("Failed to parse canid from: {line:?}");
    };
    let (canid, extended) = parse_canid(maybe_canid)?;
    let Some(maybe_dlc) = parts.next() else {
        eyre::bail!("Failed to parse dlc from: {line:?}");
    };
    let maybe_dlc = strip_outer_brackets(maybe_dlc, '[', ']');
    let dlc: usize = maybe_dlc.parse().wrap_err("Failed to parse dlc as usize")?;
    if dlc > MAX_DLC {
        eyre::bail!("dlc {dlc} exceeds maximum dlc of {MAX_DLC} bytes");
    }

    let mut data = Vec::with_capacity(dlc);
    for i in 0..dlc {
        let Some(maybe_byte) = parts.next() else {
            eyre::bail!("Failed to parse data byte {i} from line: {line:?}");
        };
        if maybe_byte.len() != 2 {
            eyre::bail!(
                "Failed to parse data byte {i} from {maybe_byte:?}: incorrect string length"
            );
        }
        data.push(u8::from_str_radix(maybe_byte, 16).wrap_err("Failed to parse data byte")?);
    }
    ObservedFrame::new(canid, extended, &data)
}

/// Parse candumps with the format
///
/// ```text
/// $ candump -L can0
/// (1739136482.503244) can0 123#FFFFFF
/// ```
fn parse_candump_file_msg(line: &str) -> eyre::Result<ObservedFrame> {
    let mut parts = line.split_ascii_whitespace();
    let Some(maybe_timestamp) = parts.next() else {
        eyre::bail!("Line {line:?} empty");
    };
    let maybe_timestamp = strip_outer_brackets(maybe_timestamp, '(', ')');
    let _: f64 = maybe_timestamp
        .parse()
        .wrap_err("Failed to parse timestamp as f64")?;
    let Some(_interface) = parts.next() else {
        eyre::bail!("Failed to parse interface from: {line:?}");
    };
    let Some(maybe_frame) = parts.next() else {
        eyre::bail!("Failed to parse frame data from: {line:?}");
    };
    let Some((maybe_canid, maybe_data)) = maybe_frame.split_once('#') else {
        eyre::bail!("Failed to parse canid and data from: {maybe_frame:?} in line {line:?}");
    };
    let (canid, extended) = parse_canid(maybe_canid)?;
    if maybe_data.len() > 2 * MAX_DLC {
        eyre::bail!("Failed to parse data from: {maybe_data:?}: incorrect length");
    }
    let data = hex::decode(maybe_data).wrap_err("Failed to parse data")?;
    ObservedFrame::new(canid, extended, &data)
}
