//! Worker executable spawned by `sandpix::Client`. Speaks the sandpix protocol on
//! stdin/stdout and logs to stderr.

use anyhow::Context;
use sandpix::codec::ImageCodec;
use tracing_subscriber::{layer::SubscriberExt, EnvFilter};

fn main() -> anyhow::Result<()> {
    // stdout belongs to the protocol
    let filter = EnvFilter::try_from_env("SANDPIX_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_ansi(false))
        .with(filter);
    tracing::subscriber::set_global_default(subscriber).context("installing tracing subscriber")?;
    tracing_log::LogTracer::init().context("forwarding log records to tracing")?;

    tracing::debug!(pid = std::process::id(), "sandpix worker starting");
    sandpix::server::serve(ImageCodec)
}
