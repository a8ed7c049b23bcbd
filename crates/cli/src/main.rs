use std::process::ExitCode;

fn main() -> ExitCode {
    esgflow_cli::run()
}
