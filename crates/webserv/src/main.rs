use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use webserv_core::{Config, Server, init_logging_with_level};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "webserv")]
#[command(about = "Single-threaded HTTP/1.1 server for static files, uploads and CGI scripts")]
#[command(version)]
struct Cli {
    /// Configuration file
    #[arg(default_value = "conf/webserv.conf")]
    config: PathBuf,
    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
    /// Log level used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging_with_level(&cli.log_level);

    let config = Config::from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    if cli.check {
        println!(
            "{}: ok ({} server block(s))",
            cli.config.display(),
            config.servers.len()
        );
        return Ok(());
    }

    let server = Server::bind(config).context("starting server")?;
    let shutdown = server.shutdown_handle();
    ctrlc::set_handler(move || {
        info!("received shutdown signal");
        shutdown.trigger();
    })
    .context("installing signal handler")?;

    server.run()?;
    Ok(())
}
