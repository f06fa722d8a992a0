//! Entry point for the `vitte` binary.
//!
//! Sets up error reporting and logging, then delegates everything else to
//! `vitte_cli::run()`, which stays unit-testable on its own.

fn main() {
    if let Err(e) = color_eyre::install() {
        eprintln!("warning: could not install color-eyre: {e}");
    }

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    std::process::exit(vitte_cli::run());
}
