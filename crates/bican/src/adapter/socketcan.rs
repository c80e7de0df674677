use std::io::ErrorKind;
use std::sync::Arc;
use std::time::{Duration, Instant};

use eyre::WrapErr;
use socketcan::{CanFrame, CanSocket, EmbeddedFrame, ExtendedId, Frame, Id, Socket, StandardId};

use super::{Adapter, FrameSink, FrameSource};
use crate::frame::ObservedFrame;

pub struct SocketCanSink {
    socket: Arc<CanSocket>,
}

pub struct SocketCanSource {
    socket: Arc<CanSocket>,
    timeout: Option<Duration>,
}

fn to_can_frame(frame: &ObservedFrame) -> eyre::Result<CanFrame> {
    let id = if frame.extended {
        ExtendedId::new(frame.identifier).map(Id::Extended)
    } else {
        u16::try_from(frame.identifier)
            .ok()
            .and_then(StandardId::new)
            .map(Id::Standard)
    };
    let Some(id) = id else {
        eyre::bail!("Identifier {:#X} is invalid for SocketCAN", frame.identifier);
    };
    CanFrame::new(id, frame.payload())
        .ok_or_else(|| eyre::eyre!("Failed to build SocketCAN frame for {frame}"))
}

impl FrameSink for SocketCanSink {
    fn send(&mut self, frame: &ObservedFrame) -> eyre::Result<()> {
        let can_frame = to_can_frame(frame)?;
        self.socket
            .write_frame(&can_frame)
            .wrap_err(format!("Failed to send {frame}"))
    }
}

impl FrameSource for SocketCanSource {
    fn receive(&mut self, timeout: Duration) -> eyre::Result<Option<ObservedFrame>> {
        if self.timeout != Some(timeout) {
            self.socket
                .set_read_timeout(timeout)
                .wrap_err("Failed to set SocketCAN read timeout")?;
            self.timeout = Some(timeout);
        }
        match self.socket.read_frame() {
            Ok(CanFrame::Data(frame)) => {
                let observed = ObservedFrame::new(frame.raw_id(), frame.is_extended(), frame.data())?;
                Ok(Some(observed.captured_at(Instant::now())))
            }
            Ok(other) => {
                tracing::trace!("Ignoring non-data frame with id {:#X}", other.raw_id());
                Ok(None)
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(None),
            Err(e) => Err(eyre::Report::new(e).wrap_err("SocketCAN receive failed")),
        }
    }
}

pub(super) fn open(interface: &str) -> eyre::Result<Adapter> {
    let socket = CanSocket::open(interface)
        .wrap_err(format!("Failed to open SocketCAN interface {interface:?}"))?;
    let socket = Arc::new(socket);
    Ok(Adapter::new(
        SocketCanSink {
            socket: Arc::clone(&socket),
        },
        SocketCanSource {
            socket,
            timeout: None,
        },
    ))
}
