use clap::Parser;
use watershed::catalog::CatalogDaemon;
use watershed::runtime::files;
use watershed::transport::GroupHandle;

#[derive(Parser, Debug)]
#[command(name = "watershed-catalog", about = "Run a Watershed catalog daemon")]
struct Args {
    /// Rank of this catalog instance within the catalog peer group.
    #[arg(long, default_value_t = 0)]
    rank: i32,

    /// Address to bind the catalog's rendezvous port on.
    #[arg(long, default_value = "127.0.0.1:0")]
    bind: String,

    /// Directory used for the lock/info/log files.
    #[arg(long, default_value = ".")]
    running_dir: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let running_dir = std::path::Path::new(&args.running_dir);
    if let Err(e) = files::init_logging(running_dir) {
        eprintln!("warning: failed to initialize logging: {e}");
    }

    let runtimes = GroupHandle::solo(args.rank);
    let mut daemon = match CatalogDaemon::start(runtimes, &args.bind).await {
        Ok(d) => d,
        Err(e) => {
            eprintln!("failed to start catalog daemon: {e}");
            std::process::exit(1);
        }
    };

    tracing::info!(port = daemon.advertised_port(), "catalog daemon listening");
    if let Err(e) = daemon.run().await {
        eprintln!("catalog daemon exited with error: {e}");
        std::process::exit(1);
    }
}
