use std::process::ExitCode;

use agentocr::runner::run_if_worker;
use tracing::error;

fn main() -> ExitCode {
    agentocr::init_tracing();

    let outcome = match run_if_worker() {
        Some(result) => result.map(|_| ()),
        None => agentocr::command(),
    };
    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}
