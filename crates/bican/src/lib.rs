pub mod adapter;
pub mod candump;
pub mod capture;
pub mod datetime;
pub mod decode;
pub mod frame;
pub mod matcher;
pub mod registry;
pub mod report;
pub mod verify;
pub mod watch;

pub use adapter::{Adapter, AdapterConfig, FrameSink, FrameSource};
pub use frame::ObservedFrame;
pub use matcher::{MatchTarget, PayloadPattern};
pub use registry::{MessageDefinition, Registry};

#[cfg(test)]
#[ctor::ctor]
fn setup_test_logging() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .with_ansi(true)
        .init();
}
