use tracing_subscriber::EnvFilter;
use vigil::cli::{print_error, Cli};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = Cli::run().await {
        print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}
