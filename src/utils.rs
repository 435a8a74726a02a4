use std::any::Any;
use std::sync::LazyLock;

use indicatif::ProgressStyle;

/// Bar shown on the root span of an execution request.
pub(crate) static PROGRESS_STYLE: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .expect("Error setting progress bar template")
        .progress_chars("=>-")
});

/// Spinner shown on the span of a running task body.
pub(crate) static TASK_STYLE: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_spinner()
        .template("  {spinner:.blue} {msg} [{elapsed}]")
        .expect("Error setting task spinner template")
});

/// Turns the payload of a caught panic into a readable message.
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("Task panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("Task panicked: {s}")
    } else {
        String::from("Task panicked with unknown payload")
    }
}

/// Installs a global subscriber printing `tracing` events to stderr, with
/// progress bars drawn for execution spans.
///
/// The filter defaults to `info` and can be overridden with `RUST_LOG`.
#[cfg(feature = "logging")]
pub fn init_logging() -> Result<(), tracing_subscriber::util::TryInitError> {
    use tracing_indicatif::IndicatifLayer;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{EnvFilter, fmt};

    let indicatif = IndicatifLayer::new();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(indicatif.get_stderr_writer()))
        .with(indicatif)
        .try_init()
}
