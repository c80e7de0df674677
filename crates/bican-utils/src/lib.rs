pub mod logging;
pub mod stdio;
