//! Discovery orchestration: one-shot sessions, continuous search, mapping
//! renewal and release.

mod events;
mod registry;

pub use events::{DiscoveryEvent, EventBus};
pub use registry::DeviceRegistry;

use crate::cancel::Cancellation;
use crate::config::DiscoveryConfig;
use crate::device::{DeviceKey, NatDevice};
use crate::error::{Error, Result};
use crate::net::{AddressProvider, SystemInterfaces};
use crate::pmp::PmpSearcher;
use crate::searcher::Searcher;
use crate::upnp::UpnpSearcher;
use std::collections::HashSet;
use std::ops::BitOr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Which protocols a discovery session searches with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortMapper(u8);

impl PortMapper {
    pub const PMP: PortMapper = PortMapper(0b01);
    pub const UPNP: PortMapper = PortMapper(0b10);
    pub const ALL: PortMapper = PortMapper(0b11);

    pub fn contains(self, other: PortMapper) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for PortMapper {
    type Output = PortMapper;

    fn bitor(self, rhs: PortMapper) -> PortMapper {
        PortMapper(self.0 | rhs.0)
    }
}

/// Lifecycle of continuous discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    Idle,
    Searching,
    Stopped,
}

/// State shared between the discoverer and its background tasks.
struct Shared {
    config: DiscoveryConfig,
    registry: DeviceRegistry,
    events: EventBus,
    state: watch::Sender<DiscoveryState>,
    timed_out: AtomicBool,
}

impl Shared {
    /// Register a device and announce it if it is new. Returns the
    /// registered instance, which may predate `device`.
    async fn found(&self, device: NatDevice) -> NatDevice {
        let (device, added) = self.registry.register(device).await;
        if added {
            self.events.publish(DiscoveryEvent::DeviceFound(device.clone()));
        }
        device
    }
}

#[derive(Default)]
struct Tasks {
    session: Option<Cancellation>,
    poll: Option<JoinHandle<()>>,
    renewal: Option<JoinHandle<()>>,
}

/// Finds NAT devices and keeps the mappings created on them alive.
///
/// Discovery runs either as bounded one-shot sessions
/// ([`discover_device`](NatDiscoverer::discover_device),
/// [`discover_devices`](NatDiscoverer::discover_devices)) or continuously
/// between [`start`](NatDiscoverer::start) and [`stop`](NatDiscoverer::stop).
/// Both feed the same registry.
pub struct NatDiscoverer {
    shared: Arc<Shared>,
    provider: Arc<dyn AddressProvider>,
    tasks: Mutex<Tasks>,
}

impl NatDiscoverer {
    /// A discoverer using the host's network interfaces.
    pub fn new(config: DiscoveryConfig) -> Self {
        NatDiscoverer::with_provider(config, Arc::new(SystemInterfaces))
    }

    pub fn with_provider(config: DiscoveryConfig, provider: Arc<dyn AddressProvider>) -> Self {
        let (state, _rx) = watch::channel(DiscoveryState::Idle);
        NatDiscoverer {
            shared: Arc::new(Shared {
                config,
                registry: DeviceRegistry::new(),
                events: EventBus::default(),
                state,
                timed_out: AtomicBool::new(false),
            }),
            provider,
            tasks: Mutex::new(Tasks::default()),
        }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.shared.config
    }

    /// Receive discovery events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.shared.events.subscribe()
    }

    pub fn state(&self) -> DiscoveryState {
        *self.shared.state.borrow()
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.shared.registry
    }

    /// Every device found so far.
    pub async fn devices(&self) -> Vec<NatDevice> {
        self.shared.registry.devices().await
    }

    pub async fn device(&self, key: &DeviceKey) -> Option<NatDevice> {
        self.shared.registry.get(key).await
    }

    fn build_searchers(&self, mappers: PortMapper) -> Result<Vec<Arc<dyn Searcher>>> {
        let mut searchers: Vec<Arc<dyn Searcher>> = Vec::new();
        let mut last_error = None;

        if mappers.contains(PortMapper::UPNP) {
            match UpnpSearcher::new(self.provider.as_ref(), &self.shared.config) {
                Ok(searcher) => searchers.push(Arc::new(searcher)),
                Err(e) => {
                    tracing::warn!("UPnP search unavailable: {}", e);
                    last_error = Some(e);
                }
            }
        }
        if mappers.contains(PortMapper::PMP) {
            match PmpSearcher::new(self.provider.as_ref(), &self.shared.config) {
                Ok(searcher) => searchers.push(Arc::new(searcher)),
                Err(e) => {
                    tracing::warn!("NAT-PMP search unavailable: {}", e);
                    last_error = Some(e);
                }
            }
        }

        match (searchers.is_empty(), last_error) {
            (true, Some(e)) => Err(e),
            _ => Ok(searchers),
        }
    }

    /// Find one device with every protocol, giving up after the configured
    /// one-shot timeout.
    pub async fn discover_device(&self) -> Result<NatDevice> {
        let token = Cancellation::with_timeout(self.shared.config.one_shot_timeout);
        self.discover_device_with(PortMapper::ALL, token).await
    }

    /// Find one device. The session ends as soon as any searcher finds one,
    /// or when `token` is cancelled.
    pub async fn discover_device_with(
        &self,
        mappers: PortMapper,
        token: Cancellation,
    ) -> Result<NatDevice> {
        self.run_session(mappers, token, true)
            .await?
            .into_iter()
            .next()
            .ok_or(Error::DeviceNotFound)
    }

    /// Find every device that answers before `token` is cancelled.
    pub async fn discover_devices(
        &self,
        mappers: PortMapper,
        token: Cancellation,
    ) -> Result<Vec<NatDevice>> {
        let devices = self.run_session(mappers, token, false).await?;
        if devices.is_empty() {
            return Err(Error::DeviceNotFound);
        }
        Ok(devices)
    }

    async fn run_session(
        &self,
        mappers: PortMapper,
        token: Cancellation,
        first_only: bool,
    ) -> Result<Vec<NatDevice>> {
        let searchers = self.build_searchers(mappers)?;
        self.ensure_renewal().await;

        let handles: Vec<_> = searchers
            .into_iter()
            .map(|searcher| {
                let shared = self.shared.clone();
                let token = token.clone();
                tokio::spawn(run_one_shot(searcher, shared, token, first_only))
            })
            .collect();

        let mut seen = HashSet::new();
        let mut devices = Vec::new();
        for handle in handles {
            match handle.await {
                Ok(found) => {
                    for device in found {
                        if seen.insert(device.key()) {
                            devices.push(device);
                        }
                    }
                }
                Err(e) => tracing::error!("Search task failed: {}", e),
            }
        }
        Ok(devices)
    }

    /// Start continuous discovery in the background. Does nothing if it is
    /// already running.
    pub async fn start(&self) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        if self.state() == DiscoveryState::Searching {
            return Ok(());
        }

        let searchers = self.build_searchers(PortMapper::ALL)?;
        let token = Cancellation::new();
        self.shared.timed_out.store(false, Ordering::SeqCst);
        self.shared.state.send_replace(DiscoveryState::Searching);

        tracing::info!("Starting continuous discovery with {} searchers", searchers.len());
        tasks.poll = Some(tokio::spawn(poll_loop(
            searchers,
            self.shared.clone(),
            token.clone(),
        )));
        tasks.session = Some(token);
        drop(tasks);

        self.ensure_renewal().await;
        Ok(())
    }

    /// Stop continuous discovery and wait for the background loop to exit.
    /// Found devices stay registered.
    pub async fn stop(&self) {
        let (session, poll) = {
            let mut tasks = self.tasks.lock().await;
            (tasks.session.take(), tasks.poll.take())
        };
        if let Some(token) = session {
            token.cancel();
        }
        if let Some(handle) = poll {
            if let Err(e) = handle.await {
                tracing::error!("Discovery loop failed: {}", e);
            }
        }
        if self.state() != DiscoveryState::Idle {
            self.shared.state.send_replace(DiscoveryState::Stopped);
        }
    }

    /// Wait until continuous discovery has found a device.
    ///
    /// Fails with [`Error::DiscoveryTimeout`] if discovery timed out first and
    /// with [`Error::DeviceNotFound`] if it was stopped or never started.
    pub async fn wait_for_device(&self) -> Result<NatDevice> {
        let mut events = self.subscribe();
        loop {
            if let Some(device) = self.devices().await.into_iter().next() {
                return Ok(device);
            }
            if self.shared.timed_out.load(Ordering::SeqCst) {
                return Err(Error::DiscoveryTimeout);
            }
            if self.state() != DiscoveryState::Searching {
                return Err(Error::DeviceNotFound);
            }
            match events.recv().await {
                Ok(DiscoveryEvent::DeviceFound(device)) => return Ok(device),
                Ok(DiscoveryEvent::TimedOut) => return Err(Error::DiscoveryTimeout),
                Ok(DiscoveryEvent::Error { .. }) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return Err(Error::DeviceNotFound),
            }
        }
    }

    async fn ensure_renewal(&self) {
        let mut tasks = self.tasks.lock().await;
        if tasks.renewal.is_some() {
            return;
        }
        tasks.renewal = Some(tokio::spawn(renewal_loop(self.shared.clone())));
    }

    /// Run one renewal pass over every registered device now.
    pub async fn renew_mappings(&self) -> usize {
        renew_all(&self.shared).await
    }

    /// Delete every leased mapping this discoverer's devices created, best
    /// effort. Returns how many were deleted.
    pub async fn release_all(&self) -> usize {
        let mut released = 0;
        for device in self.shared.registry.devices().await {
            released += device.release_all().await;
        }
        if released > 0 {
            tracing::info!("Released {} mappings", released);
        }
        released
    }

    /// Stop discovery and renewal, then release all leased mappings.
    pub async fn shutdown(&self) {
        self.stop().await;
        if let Some(renewal) = self.tasks.lock().await.renewal.take() {
            renewal.abort();
        }
        self.release_all().await;
    }
}

impl Drop for NatDiscoverer {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut();
        if let Some(token) = tasks.session.take() {
            token.cancel();
        }
        if let Some(renewal) = tasks.renewal.take() {
            renewal.abort();
        }
    }
}

/// Probe with one searcher until `token` is cancelled. In first-only mode the
/// first find cancels `token` for the whole session.
async fn run_one_shot(
    searcher: Arc<dyn Searcher>,
    shared: Arc<Shared>,
    token: Cancellation,
    first_only: bool,
) -> Vec<NatDevice> {
    let mut found = Vec::new();
    while !token.is_cancelled() {
        for device in searcher.receive().await {
            found.push(shared.found(device).await);
        }
        if first_only && !found.is_empty() {
            token.cancel();
            break;
        }

        if let Err(e) = searcher.search().await {
            tracing::debug!("{} search failed: {}", searcher.name(), e);
        }

        tokio::select! {
            _ = tokio::time::sleep(shared.config.tick_interval) => {}
            _ = token.cancelled() => break,
        }
    }
    found
}

/// The continuous discovery loop: every tick, each searcher drains its
/// sockets and then probes if due.
async fn poll_loop(searchers: Vec<Arc<dyn Searcher>>, shared: Arc<Shared>, token: Cancellation) {
    let started = Instant::now();
    let mut found_any = false;

    while !token.is_cancelled() {
        for searcher in &searchers {
            for device in searcher.receive().await {
                found_any = true;
                shared.found(device).await;
            }
            if let Err(e) = searcher.search().await {
                tracing::warn!("{} search failed: {}", searcher.name(), e);
                shared.events.publish(DiscoveryEvent::Error {
                    searcher: searcher.name(),
                    message: e.to_string(),
                });
            }
        }

        if let Some(timeout) = shared.config.discovery_timeout {
            if !found_any && started.elapsed() >= timeout {
                tracing::info!("Discovery timed out after {:?}", timeout);
                shared.timed_out.store(true, Ordering::SeqCst);
                shared.state.send_replace(DiscoveryState::Stopped);
                shared.events.publish(DiscoveryEvent::TimedOut);
                token.cancel();
                break;
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(shared.config.tick_interval) => {}
            _ = token.cancelled() => break,
        }
    }
    tracing::debug!("Discovery loop exited");
}

async fn renewal_loop(shared: Arc<Shared>) {
    let mut ticker = tokio::time::interval(shared.config.renewal_period);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        renew_all(&shared).await;
    }
}

async fn renew_all(shared: &Shared) -> usize {
    let threshold: Duration = shared.config.renew_threshold;
    let mut renewed = 0;
    for device in shared.registry.devices().await {
        renewed += device.renew_mappings(threshold).await;
    }
    renewed
}
