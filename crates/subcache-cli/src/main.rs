//! Subcache.
//!
//! A command line tool that sends HTTP sub-requests through the stale-while-revalidate cache and
//! reports how each call was served. It also inspects cache keys and cleans up on-disk stores.

mod cli;
mod logging;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
