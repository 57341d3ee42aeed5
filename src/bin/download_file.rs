use clap::Parser;
use rates_pubsub::download::download_file;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "download-file")]
#[command(about = "Downloads one URL to a local file")]
struct Args {
    url: String,
    output: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    FmtSubscriber::builder()
        .with_max_level(Level::WARN)
        .with_target(false)
        .init();

    match download_file(&args.url, &args.output).await {
        Ok(_) => {
            println!("File downloaded successfully to {}", args.output.display());
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Failed to download file: {}", e);
            ExitCode::FAILURE
        }
    }
}
