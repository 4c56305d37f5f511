use std::process::ExitCode;

use tracing_subscriber::EnvFilter;

use crate::core::error::{BootstrapError, ErrorKind};
mod core;
mod dependencies;
mod environment;
mod hosting;
mod identity;
mod kernel;
mod templates;

const ACCESS_DENIED_HINT: &str =
    "Access denied starting hostable web core. Start the application as administrator";

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut krn = match kernel::boot(std::env::args_os()).await {
        Ok(Some(krn)) => krn.with_operator_input(true),
        Ok(None) => return ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{}", report(&err));
            return ExitCode::from(1);
        }
    };

    let signals = kernel::spawn_signal_listener(krn.stop_token());
    let result = krn.run().await;
    signals.abort();

    if let Err(err) = &result {
        eprintln!("{}", report(err));
    }
    ExitCode::from(kernel::exit_code(&result))
}

/// Operator-facing text for a failed run, detail depends on the error kind.
fn report(err: &BootstrapError) -> String {
    match err.kind() {
        ErrorKind::Validation => err.to_string(),
        ErrorKind::Authorization => {
            format!("{ACCESS_DENIED_HINT}\n===========================\n{err}")
        }
        ErrorKind::Unexpected => format!("{err:?}"),
    }
}
