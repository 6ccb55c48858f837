use tracing::level_filters::LevelFilter;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

/// Installs the global tracing subscriber.
///
/// Filter directives come from `OUTPOST_LOG`, defaulting to `info`. Pretty
/// output in debug builds, JSON in release. Calling this more than once is a
/// no-op.
pub fn init() -> eyre::Result<()> {
    let filter = EnvFilter::builder()
        .with_env_var("OUTPOST_LOG")
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?;

    #[cfg(debug_assertions)]
    let _ = FmtSubscriber::builder()
        .pretty()
        .with_env_filter(filter)
        .finish()
        .try_init();

    #[cfg(not(debug_assertions))]
    let _ = FmtSubscriber::builder()
        .json()
        .with_env_filter(filter)
        .finish()
        .try_init();

    Ok(())
}
