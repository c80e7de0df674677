use std::io::BufRead;
use std::path::Path;
use std::time::{Duration, Instant};

use super::{Adapter, FrameSink, FrameSource};
use crate::candump::CandumpParser;
use crate::frame::ObservedFrame;

/// Discards sent frames; there's nobody on a recorded bus to hear them
pub struct ReplaySink;

impl FrameSink for ReplaySink {
    fn send(&mut self, frame: &ObservedFrame) -> eyre::Result<()> {
        tracing::debug!("Replay: dropping sent frame {frame}");
        Ok(())
    }
}

/// Plays back a candump log as fast as it's read, ignoring the recorded timestamps
pub struct ReplaySource {
    frames: CandumpParser<Box<dyn BufRead + Send>>,
    exhausted: bool,
}

impl ReplaySource {
    pub fn new(reader: Box<dyn BufRead + Send>) -> Self {
        Self {
            frames: CandumpParser::new(reader),
            exhausted: false,
        }
    }
}

impl FrameSource for ReplaySource {
    fn receive(&mut self, timeout: Duration) -> eyre::Result<Option<ObservedFrame>> {
        if self.exhausted {
            std::thread::sleep(timeout);
            return Ok(None);
        }
        for result in self.frames.by_ref() {
            match result {
                Ok(frame) => return Ok(Some(frame.captured_at(Instant::now()))),
                Err(e) => tracing::warn!("Skipping unparsable candump line: {e:#}"),
            }
        }
        tracing::debug!("Replay log exhausted");
        self.exhausted = true;
        Ok(None)
    }

    fn is_exhausted(&self) -> bool {
        self.exhausted
    }
}

pub(super) fn open(path: &Path) -> eyre::Result<Adapter> {
    let reader = bican_utils::stdio::get_input_reader(path)?;
    Ok(Adapter::new(ReplaySink, ReplaySource::new(reader)))
}
