use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, channel};
use std::time::{Duration, Instant};

use super::{Adapter, FrameSink, FrameSource};
use crate::frame::ObservedFrame;

pub struct BusSink {
    tx: Sender<ObservedFrame>,
}

pub struct BusSource {
    rx: Receiver<ObservedFrame>,
}

impl FrameSink for BusSink {
    fn send(&mut self, frame: &ObservedFrame) -> eyre::Result<()> {
        self.tx
            .send(frame.clone())
            .map_err(|_| eyre::eyre!("Virtual bus peer hung up"))
    }
}

impl FrameSource for BusSource {
    fn receive(&mut self, timeout: Duration) -> eyre::Result<Option<ObservedFrame>> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Ok(Some(frame.captured_at(Instant::now()))),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => eyre::bail!("Virtual bus peer hung up"),
        }
    }
}

/// A point-to-point bus between two in-process adapters
///
/// Whatever one end sends, the other receives, in order. Dropping either end's sink disconnects
/// the other end's source.
pub fn virtual_bus() -> (Adapter, Adapter) {
    let (near_tx, far_rx) = channel();
    let (far_tx, near_rx) = channel();
    let near = Adapter::new(BusSink { tx: near_tx }, BusSource { rx: near_rx });
    let far = Adapter::new(BusSink { tx: far_tx }, BusSource { rx: far_rx });
    (near, far)
}
