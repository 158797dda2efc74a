mod tunnelmux;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "tunnelmux",
    version,
    about = "tunnelmux - reverse tunnel server and client with stream multiplexing and p2p traversal"
)]
struct Cli {
    /// Path to the config file (.toml/.yaml/.yml). If omitted, uses TUNNELMUX_CONFIG; then tunnelmux.toml > tunnelmux.yaml > tunnelmux.yml in the working directory; then the OS default path (Linux: /etc/tunnelmux/tunnelmux.toml; others: user config dir).
    #[arg(long, env = "TUNNELMUX_CONFIG")]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tunnelmux::run(cli.config).await
}
