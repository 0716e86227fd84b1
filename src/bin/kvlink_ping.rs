use std::{
    error::Error,
    sync::mpsc,
    time::{Duration, Instant},
};

use clap::Parser;
use kvlink::{Cluster, ClusterConfig, NodeAddress, Ping};
use log::{error, info};

#[derive(Debug, Parser)]
#[command(version, about = "Ping a cluster through the dispatcher", long_about = None)]
struct Cli {
    /// Node addresses as host:port
    #[arg(required = true)]
    nodes: Vec<NodeAddress>,
    /// Number of pings to send
    #[arg(short, long, default_value_t = 4)]
    count: u32,
    /// Pause between pings, in milliseconds
    #[arg(short, long, default_value_t = 1000)]
    interval_ms: u64,
    /// Extra option as name=value, e.g. retryCount=1 or requestTimeout=500
    #[arg(short = 'o', long = "option")]
    options: Vec<String>,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let mut config = ClusterConfig::new(cli.nodes);
    for option in &cli.options {
        config.set(option)?;
    }

    let cluster = Cluster::new(config)?;
    cluster.start()?;

    let (stop_tx, stop_rx) = mpsc::channel();
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    }) {
        error!("failed to set Ctrl-C handler: {e}");
    }

    let interval = Duration::from_millis(cli.interval_ms);
    let mut answered = 0;
    let mut sent = 0;
    for seq in 1..=cli.count {
        sent += 1;
        let started = Instant::now();
        match cluster.execute_command(Ping).wait() {
            Ok(()) => {
                answered += 1;
                println!("pong seq={seq} time={:.2?}", started.elapsed());
            }
            Err(e) => println!("failed seq={seq}: {e}"),
        }

        if seq < cli.count && stop_rx.recv_timeout(interval).is_ok() {
            info!("interrupted");
            break;
        }
    }

    for node in cluster.nodes() {
        let state = node.state();
        info!(
            "{} {:?} failures={} pool={:?}",
            state.address, state.health, state.consecutive_failures, state.pool
        );
    }
    cluster.shutdown();

    println!("{sent} sent, {answered} answered");
    Ok(())
}
