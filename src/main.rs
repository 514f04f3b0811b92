use apiflow::cli::{self, output, Cli};
use clap::Parser;

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    cli::apply_color(&cli.color);
    output::configure(output::OutputConfig::new(cli.json, cli.quiet, cli.verbose));

    if let Err(e) = cli::run(cli).await {
        output::error(&e.to_string());
        std::process::exit(1);
    }
}
