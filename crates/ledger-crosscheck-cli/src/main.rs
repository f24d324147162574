use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    match ledger_crosscheck_cli::run(std::env::args()).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(2)
        }
    }
}
