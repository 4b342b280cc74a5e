use clap::Parser;
use cloudcutter_rs::config::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = cloudcutter_rs::run(cli).await {
        eprintln!("fatal: {err:#}");
        std::process::exit(1);
    }
}
