//! Logging setup of the gateway binary.
//!
//! Dispatch spans carry `deployment` and `request_id` fields and are
//! emitted once on close with their timing, so a per-node latency trail
//! is available from logs alone when metrics are not scraped.

#[derive(Debug, clap::Args)]
pub struct LogArgs {
    /// Log filter directives, e.g. "info" or "warn,gateway=debug".
    #[arg(
        long = "log.filter",
        default_value = "warn,gateway=info",
        env = "GATEWAY_LOG",
        global = true
    )]
    pub filter: String,

    /// Emit logs as JSON lines. Defaults to JSON whenever stderr is not
    /// an interactive terminal, so orchestrated gateways stay parseable.
    #[arg(long = "log.json", global = true, action(clap::ArgAction::SetTrue))]
    pub json: bool,
}

/// Initializes logging on stderr, using the given args. Panics if called
/// twice.
pub fn init_logging(args: &LogArgs) {
    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(args.filter.as_str())
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        // Dispatch spans log once, when they close, timing included.
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE)
        .with_target(false);

    if args.json || !atty::is(atty::Stream::Stderr) {
        builder.json().flatten_event(true).init();
    } else {
        builder.compact().init();
    }
}
