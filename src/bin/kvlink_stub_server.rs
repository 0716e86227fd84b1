use std::error::Error;

use clap::Parser;
use kvlink::{
    NodeAddress,
    protocol::{FrameServer, StubHandler},
};

#[derive(Debug, Parser)]
#[command(version, about = "Stand-in store node for local testing", long_about = None)]
struct Cli {
    /// Listen for new connections at address
    address: NodeAddress,
    /// Connections served concurrently
    #[arg(short, long, default_value_t = 8)]
    workers: usize,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let handler = StubHandler {
        address: cli.address.clone(),
    };
    let server = FrameServer::bind(
        (cli.address.host.as_str(), cli.address.port),
        handler,
        cli.workers,
    )?;

    server.listen()?;
    Ok(())
}
