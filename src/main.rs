use clap::Parser;
use panel_sub_refresh::{config, log::RunLog, panel, pool, Args};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&args.log_level))
        .with_writer(std::io::stderr)
        .init();

    let hosts = config::load_hosts(&args.hosts).await.map_err(|e| {
        error!("Failed to load hosts: {}", e);
        std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string())
    })?;
    let client = panel::build_client().map_err(|e| {
        error!("Failed to build http client: {}", e);
        std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
    })?;

    let log = RunLog::new();
    let caches = pool::run_all(&client, hosts, args.workers, &args.out_dir, &log).await;

    for line in log.lines() {
        println!("{}", line);
    }

    if args.dump_cache {
        let json = serde_json::to_string_pretty(&caches)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        println!("{}", json);
    }

    Ok(())
}
