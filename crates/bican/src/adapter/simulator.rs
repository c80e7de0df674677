//! An in-process stand-in for the Display node's firmware update handler
use std::collections::BTreeSet;
use std::thread::JoinHandle;
use std::time::Duration;

use super::{Adapter, virtual_bus};
use crate::frame::ObservedFrame;

/// Control Board to Display update commands
pub const UPDATE_COMMAND_ID: u32 = 0x11500700;
/// Display update status
pub const UPDATE_RESULT_ID: u32 = 0x114F0900;

const UPDATE_SUCCESS: [u8; 3] = [0xFF, 0x00, 0x81];

const START_COMMANDS: [u8; 2] = [0x01, 0x04];
const END_COMMANDS: [u8; 3] = [0x02, 0x07, 0x03];
const LINE_ACK: u8 = 0x06;
const LINE_CHECKSUM_FAIL: u8 = 0x11;
const LINE_TIMEOUT: u8 = 0x12;

const POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Default)]
enum Phase {
    #[default]
    Idle,
    Transferring,
}

/// The Display side of a firmware update
///
/// Both start commands are needed, in either order, before a transfer begins; anything else
/// before then is ignored. During the transfer each kind of line retry is tolerated once, and any
/// command the Display doesn't understand fails the update. Once all three end commands have
/// arrived the update completes, and the Display reports success unless it failed along the way.
#[derive(Debug, Default)]
pub struct DisplaySimulator {
    phase: Phase,
    seen: BTreeSet<u8>,
    checksum_retries: u32,
    timeout_retries: u32,
    failed: bool,
}

impl DisplaySimulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process one frame from the bus, returning the Display's reply, if any
    pub fn handle(&mut self, frame: &ObservedFrame) -> Option<ObservedFrame> {
        if frame.identifier != UPDATE_COMMAND_ID {
            return None;
        }
        let &[command, ..] = frame.payload() else {
            return None;
        };

        match self.phase {
            Phase::Idle => {
                if START_COMMANDS.contains(&command) {
                    self.seen.insert(command);
                    if START_COMMANDS.iter().all(|c| self.seen.contains(c)) {
                        tracing::debug!("Display: update started");
                        self.phase = Phase::Transferring;
                        self.seen.clear();
                    }
                } else {
                    tracing::trace!("Display: ignoring {command:#04X} before update start");
                }
                None
            }
            Phase::Transferring => self.transfer(command),
        }
    }

    fn transfer(&mut self, command: u8) -> Option<ObservedFrame> {
        match command {
            LINE_ACK => {}
            LINE_CHECKSUM_FAIL => {
                self.checksum_retries += 1;
                if self.checksum_retries > 1 {
                    self.fail("repeated LINE_CHECKSUM_FAIL");
                }
            }
            LINE_TIMEOUT => {
                self.timeout_retries += 1;
                if self.timeout_retries > 1 {
                    self.fail("repeated LINE_TIMEOUT");
                }
            }
            c if END_COMMANDS.contains(&c) => {
                self.seen.insert(c);
                if END_COMMANDS.iter().all(|c| self.seen.contains(c)) {
                    return self.complete();
                }
            }
            other => self.fail(&format!("unexpected command {other:#04X}")),
        }
        None
    }

    fn fail(&mut self, reason: &str) {
        if !self.failed {
            tracing::debug!("Display: update failed: {reason}");
        }
        self.failed = true;
    }

    fn complete(&mut self) -> Option<ObservedFrame> {
        let succeeded = !self.failed;
        tracing::debug!("Display: update finished, succeeded={succeeded}");
        *self = Self::default();
        if succeeded {
            ObservedFrame::new(UPDATE_RESULT_ID, true, &UPDATE_SUCCESS).ok()
        } else {
            None
        }
    }

    /// Run the simulator on the far end of a bus until the near end hangs up
    pub fn spawn(mut self, far: Adapter) -> eyre::Result<JoinHandle<()>> {
        let (mut sink, mut source) = far.split();
        let handle = std::thread::Builder::new()
            .name("display-sim".to_string())
            .spawn(move || {
                loop {
                    let frame = match source.receive(POLL) {
                        Ok(Some(frame)) => frame,
                        Ok(None) => continue,
                        Err(_) => break,
                    };
                    if let Some(reply) = self.handle(&frame)
                        && sink.send(&reply).is_err()
                    {
                        break;
                    }
                }
                tracing::debug!("Display simulator exiting");
            })?;
        Ok(handle)
    }
}

/// An adapter connected to a simulated Display node
pub fn simulated_display() -> eyre::Result<Adapter> {
    let (near, far) = virtual_bus();
    // Detached. It exits when the returned adapter is dropped.
    let _handle = DisplaySimulator::new().spawn(far)?;
    Ok(near)
}
