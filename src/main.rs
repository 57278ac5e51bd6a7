use clap::Parser;
use tbauthd::{udev::UdevSource, Config, Server};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse();

    // The monitor feeding the source is an external collaborator; until it
    // attaches, the daemon serves the devices found at startup.
    let (udev_tx, udev) = UdevSource::channel();

    Server::new(config).start(udev_tx, udev).await?;
    Ok(())
}
