//! The authorization engine.
//!
//! Authorizing a device means writing the requested level to the
//! `authorized` sysfs attribute. The kernel may hold that write for
//! hundreds of milliseconds up to seconds while the controller negotiates
//! link training and key exchange, so the write runs on a blocking worker.
//! The worker receives an owned snapshot of the device (uid, syspath,
//! level) and posts an owned result back to the main loop; it never touches
//! the device entity itself.

use crate::{
    device::Status,
    error::{Error, Result},
    sysfs::SysfsDir,
};
use derive_builder::Builder;
use getset::{CopyGetters, Getters};
use log::{debug, warn};
use tokio::{sync::mpsc, task};

/// The default authorization level written to sysfs.
pub const DEFAULT_LEVEL: char = '1';

#[derive(Builder, Clone, CopyGetters, Debug, Getters)]
#[builder(pattern = "owned", setter(into))]
/// An owned snapshot of everything the worker needs.
pub struct AuthRequest {
    #[get = "pub"]
    /// The uid the opened directory must prove to carry.
    uid: String,

    #[get = "pub"]
    /// The sysfs directory of the device at request time.
    syspath: std::path::PathBuf,

    #[get_copy = "pub"]
    #[builder(default = "DEFAULT_LEVEL")]
    /// The level character written to the `authorized` attribute.
    level: char,
}

#[derive(Debug)]
/// The completion posted back to the main loop.
pub struct AuthResult {
    pub uid: String,
    pub outcome: Result<Status>,
}

/// Perform the authorization on the calling (worker) thread. On success the
/// resulting device status is read back from the same directory handle.
pub fn authorize_blocking(request: &AuthRequest) -> Result<Status> {
    let dir = SysfsDir::open(request.syspath())?;

    // The path may have been reused by the kernel since the request was
    // snapshotted; the opened handle must prove the identity first.
    dir.verify_unique_id(request.uid())?;

    dir.write_attr_char("authorized", request.level())
        .map_err(|e| match e {
            Error::IdentityMismatch { .. } => e,
            Error::NotFound(m) => Error::NotFound(m),
            e => Error::Failed(format!("failed to authorize device: {}", e)),
        })?;

    let authorized = dir
        .read_attr("authorized")
        .ok()
        .and_then(|v| v.trim().parse::<i32>().ok())
        .unwrap_or(0);
    let have_key = dir.read_attr("key").map_or(false, |k| !k.is_empty());

    Ok(Status::from_sysfs(authorized, have_key))
}

/// Dispatches authorization requests to the blocking worker pool and posts
/// completions onto a channel drained by the main loop.
#[derive(Debug)]
pub struct Authorizer {
    tx: mpsc::UnboundedSender<AuthResult>,
}

impl Authorizer {
    /// Create the authorizer and the completion receiver for the main loop.
    pub fn new() -> (Authorizer, mpsc::UnboundedReceiver<AuthResult>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Authorizer { tx }, rx)
    }

    /// Hand one request to the worker pool. The completion arrives on the
    /// receiver returned by [`Authorizer::new`]; an authorization in flight
    /// cannot be cancelled.
    pub fn submit(&self, request: AuthRequest) {
        let tx = self.tx.clone();

        debug!(
            "Authorizing '{}' at {} (level '{}')",
            request.uid(),
            request.syspath().display(),
            request.level()
        );

        task::spawn_blocking(move || {
            let outcome = authorize_blocking(&request);
            let result = AuthResult {
                uid: request.uid().clone(),
                outcome,
            };

            if tx.send(result).is_err() {
                warn!("Authorization completed but the daemon is gone");
            }
        });
    }
}
