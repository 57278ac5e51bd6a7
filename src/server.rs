use crate::{
    auth::Authorizer,
    config::{Config, DaemonConfig, Policy},
    error::Error,
    manager::{Event, Manager},
    publisher::LogPublisher,
    store::Store,
    udev::{self, UdevSender, UdevSource},
};
use anyhow::{Context, Result};
use clap::crate_name;
use log::{debug, info};
use std::env;
use tokio::{
    signal::unix::{signal, SignalKind},
    sync::{mpsc, oneshot},
    task,
};

/// Server is the main instance running the authorization daemon.
pub struct Server {
    config: Config,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
}

#[derive(Clone)]
/// A handle for feeding authorize requests into the running daemon, used
/// by the bus frontend.
pub struct DaemonHandle {
    tx: mpsc::UnboundedSender<Event>,
}

impl DaemonHandle {
    /// Authorize the device with the given uid and wait for the engine's
    /// completion.
    pub async fn authorize(&self, uid: &str) -> crate::error::Result<()> {
        let (tx, rx) = oneshot::channel();

        self.tx
            .send(Event::Authorize {
                uid: uid.to_string(),
                responder: tx,
            })
            .map_err(|_| Error::Failed("daemon is not running".into()))?;

        rx.await
            .map_err(|_| Error::Failed("authorization was aborted".into()))?
    }
}

impl Server {
    /// Create a new server instance.
    pub fn new(config: Config) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Server {
            config,
            events_tx,
            events_rx,
        }
    }

    /// A handle for authorize requests, valid while the server runs.
    pub fn handle(&self) -> DaemonHandle {
        DaemonHandle {
            tx: self.events_tx.clone(),
        }
    }

    /// Run the daemon until a termination signal arrives. The udev monitor
    /// delivers through `udev`; `udev_tx` is used for the startup
    /// enumeration of already attached devices.
    pub async fn start(mut self, udev_tx: UdevSender, udev: UdevSource) -> Result<()> {
        self.set_logging_verbosity()
            .context("set logging verbosity")?;

        let daemon_config =
            DaemonConfig::load(self.config.config_path()).context("load daemon configuration")?;
        let default_policy = daemon_config
            .default_policy()
            .context("read default policy")?
            .unwrap_or(Policy::Manual);
        let auth_mode = daemon_config
            .auth_mode()
            .context("read auth mode")?
            .unwrap_or_default();

        info!(
            "Starting daemon (policy: {}, mode: {})",
            default_policy,
            auth_mode.to_names()
        );

        let store = Store::open(self.config.store_path()).context("open identity store")?;

        let (authorizer, mut auth_rx) = Authorizer::new();
        let mut manager = Manager::new(
            store,
            default_policy,
            auth_mode,
            authorizer,
            LogPublisher::default(),
        )
        .context("create manager")?;

        let n = udev::enumerate(self.config.bus_path(), &udev_tx)
            .context("enumerate attached devices")?;
        debug!("Enumerated {} device(s) at startup", n);

        // Bridge the blocking udev channel into the main loop.
        let events_tx = self.events_tx.clone();
        task::spawn_blocking(move || {
            while let Some(event) = udev.recv() {
                if events_tx.send(Event::Udev(event)).is_err() {
                    break;
                }
            }
            debug!("Stopped udev bridge");
        });

        // Handle shutdown based on signals
        let mut shutdown_terminate = signal(SignalKind::terminate())?;
        let mut shutdown_interrupt = signal(SignalKind::interrupt())?;

        loop {
            tokio::select! {
                Some(event) = self.events_rx.recv() => manager.dispatch(event),
                Some(done) = auth_rx.recv() => manager.finish_authorize(done),
                _ = shutdown_interrupt.recv() => {
                    info!("Got interrupt signal, shutting down server");
                    break;
                }
                _ = shutdown_terminate.recv() => {
                    info!("Got termination signal, shutting down server");
                    break;
                }
            }
        }

        self.cleanup()
    }

    /// Initialize the logger and set the verbosity to the provided level.
    fn set_logging_verbosity(&self) -> Result<()> {
        // Set the logging verbosity via the env
        env::set_var(
            "RUST_LOG",
            format!("{}={}", crate_name!(), self.config.log_level()),
        );

        // Initialize the logger, which may already be set up by the host
        // process embedding the daemon.
        if env_logger::try_init().is_err() {
            debug!("Logger was already initialized");
        }

        Ok(())
    }

    /// Cleanup the server before exiting. The store and journal are
    /// flushed per mutation, so there is nothing left to persist.
    fn cleanup(self) -> Result<()> {
        debug!("Cleaning up server");
        Ok(())
    }
}
