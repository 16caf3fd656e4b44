#[macro_use]
extern crate log;

use liftnet::assign::ExecutableOptimizer;
use liftnet::driver::{self, ElevatorServer};
use liftnet::rpc::UdpTransport;
use liftnet::{Config, Error, Io};
use std::env;
use std::time::Duration;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    ::std::process::exit(match run().await {
        Ok(()) => 0,
        Err(e) => {
            error!("{}", e);
            1
        }
    })
}

async fn run() -> liftnet::Result<()> {
    let path = env::args()
        .nth(1)
        .ok_or_else(|| Error::Config("usage: liftnet <config.toml>".to_string()))?;
    let config = Config::load(&path)?;
    let timing = config.timing();

    let transport = UdpTransport::bind(&config.address, &config.peers()).await?;
    let server = loop {
        match ElevatorServer::connect(&config.driver_address(), config.floors(), timing.io_timeout())
            .await
        {
            Ok(server) => break server,
            Err(e) => {
                warn!("Elevator server at {} unreachable: {}", config.driver_address(), e);
                liftnet::time::delay_for(Duration::from_secs(1)).await;
            }
        }
    };
    let (events_tx, events_rx) = async_channel::bounded(32);
    let (commands_tx, commands_rx) = async_channel::bounded(32);
    tokio::spawn(async move {
        if let Err(e) = driver::run(server, events_tx, commands_rx).await {
            error!("Elevator driver stopped: {}", e);
        }
    });
    let io = Io {
        events: events_rx,
        commands: commands_tx,
    };

    let optimizer = config.optimizer();
    let optimizer = ExecutableOptimizer::new(optimizer.path(), optimizer.args());

    #[cfg(feature = "http-rpc")]
    let node = {
        let node = liftnet::start(
            &config,
            transport,
            liftnet::rpc::http::HttpHandoff::new(),
            optimizer,
            io,
        );
        if let Some(ref address) = config.handoff_address {
            liftnet::rpc::http::serve(address.as_str(), node.store().clone())?;
        }
        node
    };
    #[cfg(not(feature = "http-rpc"))]
    let node = liftnet::start(&config, transport, liftnet::rpc::NoHandoff, optimizer, io);

    node.join().await
}
