//! stripekeeper CLI entry point
//!
//! Parses arguments and dispatches via `cli::run`. Failures are reported as
//! a JSON error object and a non-zero exit status.

use stripekeeper::cli;

fn main() {
    if let Err(e) = cli::run() {
        let _ = cli::write_error(e.code_str(), e.message());
        std::process::exit(1);
    }
}
