//! The boundary to the CAN bus
//!
//! An [Adapter] is split into a send half ([FrameSink]) and a receive half ([FrameSource]) so the
//! receive half can be handed to a background capture thread while the foreground keeps sending.
mod replay;
mod simulator;
#[cfg(all(target_os = "linux", feature = "socketcan"))]
mod socketcan;
mod virtual_bus;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub use replay::{ReplaySink, ReplaySource};
pub use simulator::{DisplaySimulator, UPDATE_COMMAND_ID, UPDATE_RESULT_ID, simulated_display};
#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub use socketcan::{SocketCanSink, SocketCanSource};
pub use virtual_bus::{BusSink, BusSource, virtual_bus};

use crate::frame::ObservedFrame;

/// The send half of an adapter
pub trait FrameSink: Send {
    fn send(&mut self, frame: &ObservedFrame) -> eyre::Result<()>;
}

/// The receive half of an adapter
pub trait FrameSource: Send {
    /// Wait up to `timeout` for the next frame
    ///
    /// `Ok(None)` means nothing arrived in time. An `Err` means the adapter is gone, and the
    /// session using it should end.
    fn receive(&mut self, timeout: Duration) -> eyre::Result<Option<ObservedFrame>>;

    /// Whether the source has run out of frames for good, as a replayed log does
    fn is_exhausted(&self) -> bool {
        false
    }
}

/// An exclusively owned connection to a bus
pub struct Adapter {
    pub sink: Box<dyn FrameSink>,
    pub source: Box<dyn FrameSource>,
}

impl Adapter {
    pub fn new(sink: impl FrameSink + 'static, source: impl FrameSource + 'static) -> Self {
        Self {
            sink: Box::new(sink),
            source: Box::new(source),
        }
    }

    pub fn split(self) -> (Box<dyn FrameSink>, Box<dyn FrameSource>) {
        (self.sink, self.source)
    }
}

/// Which bus to connect to
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AdapterConfig {
    /// An in-process Display node
    Simulated,
    /// Frames from a candump log; `-` reads stdin
    Replay(PathBuf),
    /// A Linux SocketCAN interface
    SocketCan(String),
}

impl AdapterConfig {
    /// Interface name for candump output
    #[must_use]
    pub fn label(&self) -> &str {
        match self {
            AdapterConfig::Simulated => "sim",
            AdapterConfig::Replay(_) => "replay",
            AdapterConfig::SocketCan(interface) => interface,
        }
    }

    pub fn open(&self) -> eyre::Result<Adapter> {
        tracing::debug!("Opening adapter {self}");
        match self {
            AdapterConfig::Simulated => simulated_display(),
            AdapterConfig::Replay(path) => replay::open(path),
            #[cfg(all(target_os = "linux", feature = "socketcan"))]
            AdapterConfig::SocketCan(interface) => socketcan::open(interface),
            #[cfg(not(all(target_os = "linux", feature = "socketcan")))]
            AdapterConfig::SocketCan(interface) => {
                eyre::bail!(
                    "Can't open {interface:?}: built without SocketCAN support (enable the `socketcan` feature on Linux)"
                )
            }
        }
    }
}

impl FromStr for AdapterConfig {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "sim" {
            return Ok(AdapterConfig::Simulated);
        }
        match s.split_once(':') {
            Some(("replay", path)) if !path.is_empty() => {
                Ok(AdapterConfig::Replay(PathBuf::from(path)))
            }
            Some(("socketcan", interface)) if !interface.is_empty() => {
                Ok(AdapterConfig::SocketCan(interface.to_string()))
            }
            _ => eyre::bail!(
                "Unknown interface {s:?}, expected one of: sim, replay:<path|->, socketcan:<iface>"
            ),
        }
    }
}

impl fmt::Display for AdapterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdapterConfig::Simulated => write!(f, "sim"),
            AdapterConfig::Replay(path) => write!(f, "replay:{}", path.display()),
            AdapterConfig::SocketCan(interface) => write!(f, "socketcan:{interface}"),
        }
    }
}
