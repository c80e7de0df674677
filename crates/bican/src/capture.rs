//! Background capture of everything a [FrameSource] receives
//!
//! The capture thread owns the receive half of the adapter for the life of the capture, and
//! appends every frame it sees to a shared buffer in arrival order. The foreground only ever
//! reads the buffer.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::adapter::FrameSource;
use crate::frame::ObservedFrame;
use crate::matcher::MatchTarget;

/// A frame found in the capture buffer, and the index of the target it satisfied
#[derive(Clone, Debug, PartialEq)]
pub struct CaptureMatch {
    pub target: usize,
    pub frame: ObservedFrame,
}

#[derive(Default)]
struct Shared {
    frames: Mutex<Vec<ObservedFrame>>,
    running: AtomicBool,
    failure: Mutex<Option<eyre::Report>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct CaptureBuffer {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<Box<dyn FrameSource>>>,
    join_timeout: Duration,
}

impl CaptureBuffer {
    /// Start draining `source` on a background thread, polling it every `poll`
    pub fn start(
        source: Box<dyn FrameSource>,
        poll: Duration,
        join_timeout: Duration,
    ) -> eyre::Result<Self> {
        let shared = Arc::new(Shared::default());
        shared.running.store(true, Ordering::Release);

        let thread_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("capture".to_string())
            .spawn(move || capture_loop(source, &thread_shared, poll))?;
        tracing::debug!("Capture started");

        Ok(Self {
            shared,
            handle: Some(handle),
            join_timeout,
        })
    }

    /// Stop the capture thread, waiting up to the join timeout for it to finish
    ///
    /// Returns the receive half if the thread finished in time. Stopping an already stopped
    /// capture does nothing and returns `None`.
    pub fn stop(&mut self) -> Option<Box<dyn FrameSource>> {
        let handle = self.handle.take()?;
        self.shared.running.store(false, Ordering::Release);

        let deadline = Instant::now() + self.join_timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                tracing::warn!(
                    "Capture thread didn't stop within {:?}; detaching it",
                    self.join_timeout
                );
                return None;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        match handle.join() {
            Ok(source) => {
                tracing::debug!("Capture stopped with {} frames", self.len());
                Some(source)
            }
            Err(_) => {
                tracing::error!("Capture thread panicked");
                None
            }
        }
    }

    /// Whether the capture thread is still receiving
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// A snapshot of every frame captured so far, in arrival order
    #[must_use]
    pub fn frames(&self) -> Vec<ObservedFrame> {
        lock(&self.shared.frames).clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.shared.frames).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Find the earliest captured frame for the first target, in order, that has one
    #[must_use]
    pub fn find(&self, targets: &[MatchTarget]) -> Option<CaptureMatch> {
        let frames = lock(&self.shared.frames);
        targets.iter().enumerate().find_map(|(index, target)| {
            frames
                .iter()
                .find(|frame| target.matches(frame))
                .map(|frame| CaptureMatch {
                    target: index,
                    frame: frame.clone(),
                })
        })
    }

    /// Repeat [Self::find] every `scan_interval` until a match or `timeout` elapses
    ///
    /// Gives up early if the capture thread has failed or `stop` is set.
    #[must_use]
    pub fn wait_for(
        &self,
        targets: &[MatchTarget],
        timeout: Duration,
        scan_interval: Duration,
        stop: &AtomicBool,
    ) -> Option<CaptureMatch> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(found) = self.find(targets) {
                return Some(found);
            }
            if self.has_failed() {
                tracing::debug!("Capture failed; abandoning the scan");
                return None;
            }
            if stop.load(Ordering::Acquire) {
                tracing::debug!("Scan stopped by user");
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            std::thread::sleep(scan_interval.min(deadline - now));
        }
    }

    #[must_use]
    pub fn has_failed(&self) -> bool {
        lock(&self.shared.failure).is_some()
    }

    /// The error that ended the capture early, if any
    pub fn take_failure(&self) -> Option<eyre::Report> {
        lock(&self.shared.failure).take()
    }
}

impl Drop for CaptureBuffer {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn capture_loop(
    mut source: Box<dyn FrameSource>,
    shared: &Shared,
    poll: Duration,
) -> Box<dyn FrameSource> {
    while shared.running.load(Ordering::Acquire) {
        match source.receive(poll) {
            Ok(Some(frame)) => {
                tracing::trace!("Captured {frame}");
                lock(&shared.frames).push(frame);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!("Capture ended: {e:#}");
                *lock(&shared.failure) = Some(e);
                break;
            }
        }
    }
    shared.running.store(false, Ordering::Release);
    source
}
