use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use eyre::WrapErr;

fn is_stdio(path: &Path) -> bool {
    path.as_os_str() == "-"
}

/// Get a buffered reader for the given path.
///
/// If `-`, use stdin, otherwise open the given file. Replay logs are read line by line, so the
/// reader is always buffered.
pub fn get_input_reader(input: &Path) -> eyre::Result<Box<dyn BufRead + Send>> {
    if is_stdio(input) {
        return Ok(Box::new(BufReader::new(std::io::stdin())));
    }
    let file = File::open(input).wrap_err(format!("Failed to open input file: {input:?}"))?;
    Ok(Box::new(BufReader::new(file)))
}

/// Get a writer for the given path.
///
/// If `-` or if `None`, use stdout, otherwise create the given file.
///
/// The generated writer is _not_ buffered, because `csv::Writer` is buffered
pub fn get_output_writer(output: &Option<PathBuf>) -> eyre::Result<Box<dyn Write>> {
    match output {
        None => Ok(Box::new(std::io::stdout())),
        Some(path) if is_stdio(path) => Ok(Box::new(std::io::stdout())),
        Some(path) => {
            let file =
                File::create(path).wrap_err(format!("Failed to create output file: {path:?}"))?;
            Ok(Box::new(file))
        }
    }
}
