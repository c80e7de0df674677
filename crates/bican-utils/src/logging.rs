use std::io::IsTerminal;

/// Logging options shared by every bican tool
#[derive(Debug, clap::Args)]
pub struct LogArgs {
    /// Default log level. Overridden per-target by the BICAN_LOG environment variable
    #[clap(short, long, default_value_t = tracing::Level::INFO)]
    pub log_level: tracing::Level,
}

/// Install color-eyre and a stderr tracing subscriber
///
/// Colors are only used when stderr is a terminal.
pub fn init(args: &LogArgs) -> eyre::Result<()> {
    let use_color = std::io::stderr().is_terminal();
    if use_color {
        color_eyre::install()?;
    }

    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(args.log_level.into())
        .with_env_var("BICAN_LOG")
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(use_color)
        .with_writer(std::io::stderr)
        .init();

    Ok(())
}
