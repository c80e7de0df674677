//! Waiting for frames that match a set of targets
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use eyre::WrapErr;
use serde::Serialize;

use crate::adapter::FrameSource;
use crate::frame::ObservedFrame;
use crate::matcher::{MatchTarget, first_match};

#[derive(Clone, Debug)]
pub struct WatchConfig {
    /// `None` waits until stopped
    pub timeout: Option<Duration>,
    /// Keep going after the first match
    pub collect_all: bool,
    /// Upper bound on how long a single receive blocks
    pub poll: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            timeout: None,
            collect_all: true,
            poll: Duration::from_millis(100),
        }
    }
}

impl WatchConfig {
    /// Interpret a timeout in seconds, where zero means no timeout
    pub fn with_timeout_secs(mut self, seconds: f64) -> eyre::Result<Self> {
        let timeout = Duration::try_from_secs_f64(seconds).wrap_err(format!(
            "Timeout must be a non-negative number of seconds, got {seconds}"
        ))?;
        self.timeout = (seconds > 0.0).then_some(timeout);
        Ok(self)
    }
}

/// How a watch session ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchOutcome {
    /// Stopped at the first match
    Matched,
    TimedOut,
    StoppedByUser,
    /// The source ran out of frames
    Exhausted,
}

#[derive(Clone, Debug)]
pub struct MatchEvent {
    pub wall_time: DateTime<Local>,
    /// Since the session started
    pub elapsed: Duration,
    pub frame: ObservedFrame,
}

#[derive(Clone, Debug)]
pub struct TargetMatches {
    pub target: MatchTarget,
    pub events: Vec<MatchEvent>,
}

#[derive(Debug)]
pub struct WatchReport {
    pub outcome: WatchOutcome,
    pub frames_seen: usize,
    pub elapsed: Duration,
    /// One entry per target, in the order the targets were given
    pub targets: Vec<TargetMatches>,
}

impl WatchReport {
    #[must_use]
    pub fn any_match(&self) -> bool {
        self.targets.iter().any(|t| !t.events.is_empty())
    }

    #[must_use]
    pub fn total_matches(&self) -> usize {
        self.targets.iter().map(|t| t.events.len()).sum()
    }

    /// Write one CSV record per match event, grouped by target
    pub fn write_csv<W: Write>(&self, writer: W) -> eyre::Result<()> {
        let mut writer = csv::Writer::from_writer(writer);
        for target in &self.targets {
            for event in &target.events {
                writer
                    .serialize(MatchRecord::new(&target.target, event))
                    .wrap_err("Failed to write match record")?;
            }
        }
        writer.flush()?;
        Ok(())
    }
}

#[derive(Serialize)]
struct MatchRecord<'a> {
    target: &'a str,
    timestamp: String,
    elapsed_s: f64,
    canid: String,
    extended: bool,
    dlc: usize,
    data: String,
}

impl<'a> MatchRecord<'a> {
    fn new(target: &'a MatchTarget, event: &MatchEvent) -> Self {
        Self {
            target: &target.display_name,
            timestamp: event.wall_time.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
            elapsed_s: event.elapsed.as_secs_f64(),
            canid: format!("{:#X}", event.frame.identifier),
            extended: event.frame.extended,
            dlc: event.frame.dlc(),
            data: hex::encode_upper(event.frame.payload()),
        }
    }
}

/// What a running session reports as it goes
#[derive(Debug)]
pub enum WatchEvent<'a> {
    /// Every received frame, matched or not
    Frame {
        frame: &'a ObservedFrame,
        elapsed: Duration,
        /// The target this frame is about to be recorded for
        matched: Option<&'a MatchTarget>,
    },
    /// A frame matched a target. `number` counts this target's matches from 1
    Match {
        target: &'a MatchTarget,
        number: usize,
        event: &'a MatchEvent,
    },
}

pub struct WatchSession {
    targets: Vec<MatchTarget>,
    config: WatchConfig,
}

impl WatchSession {
    pub fn new(targets: Vec<MatchTarget>, config: WatchConfig) -> Self {
        Self { targets, config }
    }

    /// Observe all traffic without looking for anything in particular
    pub fn monitor(config: WatchConfig) -> Self {
        Self::new(Vec::new(), config)
    }

    #[must_use]
    pub fn targets(&self) -> &[MatchTarget] {
        &self.targets
    }

    #[must_use]
    pub fn config(&self) -> &WatchConfig {
        &self.config
    }

    /// Receive from `source` until a match (when not collecting), the timeout, `stop`, or the
    /// source is exhausted
    ///
    /// Each frame is checked against the targets in order and recorded for the first one it
    /// satisfies. A failing source ends the session with an error.
    pub fn run<F>(
        self,
        source: &mut dyn FrameSource,
        stop: &AtomicBool,
        mut observer: F,
    ) -> eyre::Result<WatchReport>
    where
        F: FnMut(WatchEvent<'_>),
    {
        let mut targets: Vec<TargetMatches> = self
            .targets
            .into_iter()
            .map(|target| TargetMatches {
                target,
                events: Vec::new(),
            })
            .collect();
        let match_targets: Vec<MatchTarget> = targets.iter().map(|t| t.target.clone()).collect();
        let config = self.config;

        tracing::debug!(
            "Watching for {} targets, timeout={:?}, collect_all={}",
            match_targets.len(),
            config.timeout,
            config.collect_all
        );

        let start = Instant::now();
        let mut frames_seen = 0;
        let outcome = loop {
            if stop.load(Ordering::Acquire) {
                break WatchOutcome::StoppedByUser;
            }
            let mut poll = config.poll;
            if let Some(timeout) = config.timeout {
                let elapsed = start.elapsed();
                if elapsed >= timeout {
                    break WatchOutcome::TimedOut;
                }
                poll = poll.min(timeout - elapsed);
            }

            let frame = match source.receive(poll).wrap_err("Adapter failed during watch")? {
                Some(frame) => frame,
                None if source.is_exhausted() => break WatchOutcome::Exhausted,
                None => continue,
            };
            frames_seen += 1;
            let elapsed = frame
                .capture_time
                .unwrap_or_else(Instant::now)
                .saturating_duration_since(start);
            tracing::trace!("Received {frame}");
            let matched = first_match(&frame, &match_targets);
            observer(WatchEvent::Frame {
                frame: &frame,
                elapsed,
                matched: matched.map(|index| &match_targets[index]),
            });

            let Some(index) = matched else {
                continue;
            };
            let matches = &mut targets[index];
            matches.events.push(MatchEvent {
                wall_time: Local::now(),
                elapsed,
                frame,
            });
            let number = matches.events.len();
            tracing::debug!("Match #{number} for {}", matches.target.display_name);
            if let Some(event) = matches.events.last() {
                observer(WatchEvent::Match {
                    target: &matches.target,
                    number,
                    event,
                });
            }
            if !config.collect_all {
                break WatchOutcome::Matched;
            }
        };

        let report = WatchReport {
            outcome,
            frames_seen,
            elapsed: start.elapsed(),
            targets,
        };
        tracing::info!(
            "Watch ended ({:?}) after {:.2?}: {} frames, {} matches",
            report.outcome,
            report.elapsed,
            report.frames_seen,
            report.total_matches()
        );
        Ok(report)
    }
}
