use crate::common::settings::LoggingSettings;
use tracing_subscriber::FmtSubscriber;

/// Install the global tracing subscriber.
///
/// Calling this more than once (the integration tests do) only logs a warning.
pub fn configure(settings: LoggingSettings) {
    let fmt_subscriber = FmtSubscriber::builder()
        .with_ansi(true)
        .with_env_filter(settings.filter)
        .finish();
    if tracing::subscriber::set_global_default(fmt_subscriber).is_err() {
        warn!("a global tracing subscriber is already installed");
    }
}
