use anyhow::Result;
use pcsc_nfc::cli::commands::run_cli;

#[tokio::main]
async fn main() -> Result<()> {
    run_cli().await
}
