use clap::Parser;
use watershed::descriptor::load_cluster_config;
use watershed::runtime::{files, RuntimeDaemon};
use watershed::transport::GroupHandle;

#[derive(Parser, Debug)]
#[command(name = "watershed-runtime", about = "Run a Watershed runtime daemon")]
struct Args {
    /// Rank of this runtime within the all-runtimes group.
    #[arg(long, default_value_t = 0)]
    rank: i32,

    /// This runtime is the root (serves the console).
    #[arg(long)]
    root: bool,

    /// Path to the cluster configuration TOML file.
    #[arg(long)]
    cluster_config: String,

    /// Address to bind the console port on (root only; otherwise unused).
    #[arg(long, default_value = "127.0.0.1:0")]
    console_bind: String,

    /// Address of the catalog daemon this runtime hands to spawned module
    /// instances during admission.
    #[arg(long, default_value = "127.0.0.1:0")]
    catalog_addr: String,

    /// Address to bind the port spawned module instances dial back into.
    #[arg(long, default_value = "127.0.0.1:0")]
    module_bind: String,

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
    let _lock = match files::RuntimeLock::acquire(running_dir) {
        Ok(lock) => lock,
        Err(e) => {
            eprintln!("failed to acquire runtime lock: {e}");
            std::process::exit(1);
        }
    };

    let cluster = match load_cluster_config(std::path::Path::new(&args.cluster_config)) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("failed to load cluster config: {e}");
            std::process::exit(1);
        }
    };

    let peer_runtimes = GroupHandle::solo(args.rank);
    let catalog = GroupHandle::solo(args.rank);

    let mut daemon = match RuntimeDaemon::start(
        args.rank,
        args.root,
        cluster,
        peer_runtimes,
        catalog,
        args.catalog_addr.clone(),
        &args.console_bind,
        &args.module_bind,
    )
    .await
    {
        Ok(d) => d,
        Err(e) => {
            eprintln!("failed to start runtime daemon: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = files::write_info_file(running_dir, daemon.console_port()) {
        eprintln!("failed to write info file: {e}");
        std::process::exit(1);
    }

    tracing::info!(rank = args.rank, port = daemon.console_port(), "runtime daemon listening");
    daemon.run_server_loop().await;
}
