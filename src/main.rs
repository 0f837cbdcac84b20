use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    match scamscan::app::run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("scamscan: {e}");
            ExitCode::FAILURE
        }
    }
}
