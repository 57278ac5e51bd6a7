//! The manager owns the domain list and the device table, routes udev
//! events and authorize requests, and persists results through the store.
//!
//! Everything here runs on the main loop; the only suspension point of the
//! daemon is between submitting an authorization to the worker pool and
//! receiving its completion. A remove event that arrives in that window
//! marks the device as pending-removal and the table removal happens in
//! the completion handler.

use crate::{
    auth::{AuthRequestBuilder, AuthResult, Authorizer, DEFAULT_LEVEL},
    config::{AuthMode, Policy},
    device::{Device, Status},
    domain::{Domain, DomainList, Security},
    error::{Error, Result},
    journal::Op,
    publisher::Publisher,
    store::{DeviceEntry, DomainEntry, Store},
    udev::{Action, DeviceHandle, UdevEvent},
};
use log::{debug, error, info, warn};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::oneshot;

/// Completion channel for one authorize request.
pub type AuthResponder = oneshot::Sender<Result<()>>;

/// The events the main loop feeds into the manager.
pub enum Event {
    /// A hot-plug event from the udev source.
    Udev(UdevEvent),

    /// An authorize request from the publisher.
    Authorize { uid: String, responder: AuthResponder },
}

/// The central daemon state.
pub struct Manager<P: Publisher> {
    default_policy: Policy,
    auth_mode: AuthMode,
    store: Store,
    devices: HashMap<String, Device>,
    domains: DomainList,
    authorizer: Authorizer,
    publisher: P,
    responders: HashMap<String, AuthResponder>,
}

impl<P: Publisher> Manager<P> {
    /// Create the manager. The store is checked for integrity by loading
    /// all persisted records once.
    pub fn new(
        mut store: Store,
        default_policy: Policy,
        auth_mode: AuthMode,
        authorizer: Authorizer,
        publisher: P,
    ) -> Result<Self> {
        let known = store.load_devices()?;
        info!("Store holds {} device record(s)", known.len());

        Ok(Self {
            default_policy: default_policy.resolve(Policy::Manual),
            auth_mode,
            store,
            devices: HashMap::new(),
            domains: DomainList::default(),
            authorizer,
            publisher,
            responders: HashMap::new(),
        })
    }

    /// The device table entry for one uid.
    pub fn device(&self, uid: &str) -> Option<&Device> {
        self.devices.get(uid)
    }

    /// The number of attached devices.
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// The ordered domain list.
    pub fn domains(&self) -> &DomainList {
        &self.domains
    }

    /// The identity store.
    pub fn store_mut(&mut self) -> &mut Store {
        &mut self.store
    }

    /// Process one event to completion.
    pub fn dispatch(&mut self, event: Event) {
        match event {
            Event::Udev(ev) => {
                if let Err(e) = self.handle_udev(ev) {
                    error!("Could not handle udev event: {}", e);
                }
            }
            Event::Authorize { uid, responder } => {
                self.begin_authorize(&uid, Some(responder));
            }
        }
    }

    fn handle_udev(&mut self, ev: UdevEvent) -> Result<()> {
        let dev = ev.device.as_ref();

        if ev.action == Action::Remove {
            return self.removed(dev);
        }

        let devtype = dev.devtype();
        let is_domain = match devtype.as_deref() {
            Some(crate::udev::DEVTYPE_DOMAIN) => true,
            Some(crate::udev::DEVTYPE_DEVICE) => false,
            _ => {
                debug!("Ignoring '{}' (devtype {:?})", dev.sysname(), devtype);
                return Ok(());
            }
        };

        match (ev.action, is_domain) {
            (Action::Add, true) => self.domain_added(dev),
            (Action::Add, false) => self.device_added(dev),
            (_, true) => self.domain_changed(dev),
            (_, false) => self.device_changed(dev),
        }
    }

    /// Route a remove event. The attributes of a removed device may be
    /// unreadable already, so the tracked entities decide what the handle
    /// referred to.
    fn removed(&mut self, dev: &dyn DeviceHandle) -> Result<()> {
        match dev.devtype().as_deref() {
            Some(crate::udev::DEVTYPE_DOMAIN) => self.domain_removed(dev),
            Some(crate::udev::DEVTYPE_DEVICE) => self.device_removed(dev),
            _ if self.domains.find_id(dev.sysname()).is_some() => self.domain_removed(dev),
            _ => self.device_removed(dev),
        }
    }

    fn domain_added(&mut self, dev: &dyn DeviceHandle) -> Result<()> {
        let uid = dev
            .attribute("unique_id")
            .ok_or_else(|| Error::Udev("could not get unique_id for domain".into()))?;

        if self.domains.find_uid(&uid).is_some() {
            debug!("Domain '{}' already known, updating", uid);
            return self.domain_changed(dev);
        }

        let mut domain = Domain::new_from_udev(dev, &uid)?;

        if let Some(entry) = self.store.get_domain(&uid)? {
            domain.set_stored(true);
            self.reconcile_bootacl(&domain, &entry)?;
        }

        info!(
            "Added domain {} (security: {})",
            domain,
            domain.security()
        );

        let pos = self.domains.insert(domain);
        if let Some(domain) = self.domains.get(pos) {
            self.publisher.domain_added(domain);
        }

        Ok(())
    }

    /// The boot ACL may have been rewritten by the firmware while the
    /// daemon was not running; the implied device additions and removals
    /// go into the journal in one atomic diff.
    fn reconcile_bootacl(&mut self, domain: &Domain, stored: &DomainEntry) -> Result<()> {
        let live = match domain.bootacl() {
            Some(live) => live,
            None => return Ok(()),
        };

        if stored.bootacl() == live {
            return Ok(());
        }

        let diff = bootacl_diff(stored.bootacl(), live);
        info!(
            "Boot ACL of domain '{}' drifted, journaling {} change(s)",
            domain.uid(),
            diff.len()
        );

        let entry = DomainEntry::new(domain.security(), live.clone());
        self.store
            .update_domain_bootacl(domain.uid(), &entry, &diff)
    }

    fn domain_changed(&mut self, dev: &dyn DeviceHandle) -> Result<()> {
        let id = dev.sysname().to_string();

        let domain = self
            .domains
            .find_id_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("domain '{}'", id)))?;

        if !domain.update_from_sysfs(dev)? {
            return Ok(());
        }

        let stored = domain.stored();
        let entry = domain
            .bootacl()
            .as_ref()
            .map(|acl| DomainEntry::new(domain.security(), acl.clone()));

        let domain = self.domains.find_id(&id).expect("domain vanished");
        self.publisher.domain_changed(domain);

        if stored {
            if let Some(entry) = entry {
                let uid = domain.uid().clone();
                self.store.put_domain(&uid, &entry)?;
            }
        }

        Ok(())
    }

    fn domain_removed(&mut self, dev: &dyn DeviceHandle) -> Result<()> {
        let id = dev.sysname();

        match self.domains.remove_id(id) {
            Some(domain) => {
                info!("Removed domain {}", domain);
                self.publisher.domain_removed(domain.uid());
                Ok(())
            }
            None => Err(Error::NotFound(format!("domain '{}'", id))),
        }
    }

    fn device_added(&mut self, dev: &dyn DeviceHandle) -> Result<()> {
        let uid = dev
            .attribute("unique_id")
            .ok_or_else(|| Error::Udev("could not get unique_id for device".into()))?;

        if let Some(device) = self.devices.get_mut(&uid) {
            // Re-plug of a known device: bind to the existing entry.
            device.set_pending_removal(false);
            let changed = device.update_from_sysfs(dev)?;

            debug!("Device '{}' re-attached at {}", uid, dev.syspath().display());
            if changed {
                self.publisher.device_changed(device);
            }
        } else {
            let device = Device::new_from_udev(dev)?;
            info!("Added device {} ({})", device, device.status());

            self.publisher.device_added(&device);
            self.devices.insert(uid.clone(), device);
        }

        // Auto-authorize when the stored policy asks for it.
        let entry = self.store.get_device(&uid)?;
        let policy = match entry {
            Some(entry) => entry.policy().resolve(self.default_policy),
            None => return Ok(()),
        };

        if policy != Policy::Auto {
            return Ok(());
        }

        if !self.auth_mode.contains(AuthMode::ENABLED) {
            info!("Authorization disabled, not authorizing '{}'", uid);
            return Ok(());
        }

        let status = self.devices[&uid].status();
        if status.can_authorize() {
            self.begin_authorize(&uid, None);
        }

        Ok(())
    }

    fn device_changed(&mut self, dev: &dyn DeviceHandle) -> Result<()> {
        let uid = match dev.attribute("unique_id") {
            Some(uid) => uid,
            None => return Err(Error::Udev("could not get unique_id for device".into())),
        };

        let device = self
            .devices
            .get_mut(&uid)
            .ok_or_else(|| Error::NotFound(format!("device '{}'", uid)))?;

        if device.update_from_sysfs(dev)? {
            self.publisher.device_changed(device);
        }

        Ok(())
    }

    fn device_removed(&mut self, dev: &dyn DeviceHandle) -> Result<()> {
        let uid = match dev.attribute("unique_id") {
            Some(uid) => uid,
            None => {
                // Attributes may be gone on removal; fall back to the path.
                let syspath = dev.syspath();
                match self
                    .devices
                    .values()
                    .find(|d| d.syspath().as_deref() == Some(syspath))
                {
                    Some(device) => device.uid().clone(),
                    None => {
                        return Err(Error::NotFound(format!(
                            "device at {}",
                            syspath.display()
                        )))
                    }
                }
            }
        };

        let device = self
            .devices
            .get_mut(&uid)
            .ok_or_else(|| Error::NotFound(format!("device '{}'", uid)))?;

        if device.status() == Status::Authorizing {
            // The worker is still busy; defer until its completion runs.
            info!("Device '{}' removed while authorizing, deferring", uid);
            device.set_pending_removal(true);
            device.detach();
            return Ok(());
        }

        info!("Removed device {}", device);
        self.devices.remove(&uid);
        self.publisher.device_removed(&uid);

        Ok(())
    }

    /// Start an authorization. Failures to even start are reported through
    /// the responder (if any) and logged.
    pub fn begin_authorize(&mut self, uid: &str, responder: Option<AuthResponder>) {
        match self.try_begin_authorize(uid) {
            Ok(()) => {
                if let Some(responder) = responder {
                    self.responders.insert(uid.to_string(), responder);
                }
            }
            Err(e) => {
                error!("Cannot authorize '{}': {}", uid, e);
                if let Some(responder) = responder {
                    let _ = responder.send(Err(e));
                }
            }
        }
    }

    fn try_begin_authorize(&mut self, uid: &str) -> Result<()> {
        let level = self.level_for(uid);

        let device = self
            .devices
            .get_mut(uid)
            .ok_or_else(|| Error::NotFound(format!("device '{}'", uid)))?;

        let syspath = device
            .syspath()
            .clone()
            .ok_or_else(|| Error::Failed(format!("device '{}' has no sysfs path", uid)))?;

        device.transition(Status::Authorizing)?;
        self.publisher.device_changed(device);

        let request = AuthRequestBuilder::default()
            .uid(uid)
            .syspath(syspath)
            .level(level)
            .build()
            .map_err(|e| Error::Failed(e.to_string()))?;

        self.authorizer.submit(request);
        Ok(())
    }

    /// The level character to write: secure authorization is used when the
    /// owning domain advertises it and the daemon is configured for it.
    fn level_for(&self, uid: &str) -> char {
        if !self.auth_mode.contains(AuthMode::SECURE) {
            return DEFAULT_LEVEL;
        }

        let syspath = match self.devices.get(uid).and_then(|d| d.syspath().clone()) {
            Some(path) => path,
            None => return DEFAULT_LEVEL,
        };

        let secure = self
            .domains
            .iter()
            .find(|dom| syspath.starts_with(dom.syspath()))
            .map_or(false, |dom| dom.security() == Security::Secure);

        if secure {
            '2'
        } else {
            DEFAULT_LEVEL
        }
    }

    /// Handle one completion from the worker pool. Invoked on the main
    /// loop; this is the only place a device leaves `authorizing`.
    pub fn finish_authorize(&mut self, done: AuthResult) {
        let responder = self.responders.remove(&done.uid);

        let device = match self.devices.get_mut(&done.uid) {
            Some(device) => device,
            None => {
                warn!("Authorization completed for unknown device '{}'", done.uid);
                respond(responder, Err(Error::NotFound(format!("device '{}'", done.uid))));
                return;
            }
        };

        if device.pending_removal() {
            info!(
                "Device '{}' was removed during authorization, dropping result",
                done.uid
            );
            self.devices.remove(&done.uid);
            self.publisher.device_removed(&done.uid);
            respond(
                responder,
                Err(Error::Failed("device was removed during authorization".into())),
            );
            return;
        }

        match done.outcome {
            Ok(status) => {
                if let Err(e) = device.transition(status) {
                    error!("Authorization state bug for '{}': {}", done.uid, e);
                }

                info!("Authorized device {} ({})", device, device.status());
                self.publisher.device_changed(device);

                if let Err(e) = self.persist_authorized(&done.uid) {
                    error!("Could not persist device '{}': {}", done.uid, e);
                }

                respond(responder, Ok(()));
            }
            Err(e) => {
                if let Err(te) = device.transition(Status::AuthError) {
                    error!("Authorization state bug for '{}': {}", done.uid, te);
                }

                error!("Authorization of '{}' failed: {}", done.uid, e);
                self.publisher.device_changed(device);
                respond(responder, Err(e));
            }
        }
    }

    /// After a successful authorization a device that is not yet stored is
    /// persisted under the daemon's default policy; stored devices keep
    /// their record (and the journal stays quiet).
    fn persist_authorized(&mut self, uid: &str) -> Result<()> {
        if self.store.has_device(uid) {
            return Ok(());
        }

        self.store
            .put_device(uid, &DeviceEntry::new(self.default_policy))
    }
}

/// Invoke one responder exactly once, ignoring a hung-up caller.
fn respond(responder: Option<AuthResponder>, result: Result<()>) {
    if let Some(responder) = responder {
        let _ = responder.send(result);
    }
}

/// The journal diff implied by a boot ACL change: uids that appeared are
/// added, uids that vanished are removed. Free slots are ignored.
fn bootacl_diff(old: &[String], new: &[String]) -> BTreeMap<String, Op> {
    let mut diff = BTreeMap::new();

    for uid in new.iter().filter(|u| !u.is_empty()) {
        if !old.contains(uid) {
            diff.insert(uid.clone(), Op::Added);
        }
    }

    for uid in old.iter().filter(|u| !u.is_empty()) {
        if !new.contains(uid) {
            diff.insert(uid.clone(), Op::Removed);
        }
    }

    diff
}
