//! Service liveness tracking.
//!
//! `ServiceTable` owns the handle and current proxy of every hardware
//! service. Everyone may read it; only the health monitor (and the
//! orchestrator at startup) changes connection state.
//!
//! `HealthMonitor` pings each live service on a fixed interval. A service that
//! misses `failure_threshold` consecutive pings is marked unreachable; an
//! unreachable service is reconnected every cycle and restored on the first
//! successful ping.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::adapters::{Incubator, Microscope, ProxyRef, RoboticArm, ServiceConnector, PONG};
use crate::config::HealthSettings;
use crate::domain::{Connection, ServiceHandle, ServiceKind};

/// Connection changes broadcast by the monitor
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServiceEvent {
    Lost { name: String, kind: ServiceKind },
    Recovered { name: String, kind: ServiceKind },
}

#[derive(Debug, Clone)]
struct ServiceEntry {
    handle: ServiceHandle,
    proxy: Option<ProxyRef>,
}

/// Handles and proxies for all configured services
#[derive(Debug, Clone, Default)]
pub struct ServiceTable {
    inner: Arc<RwLock<BTreeMap<String, ServiceEntry>>>,
}

impl ServiceTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, ServiceEntry>> {
        self.inner.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, ServiceEntry>> {
        self.inner.write().unwrap_or_else(|p| p.into_inner())
    }

    /// Register a service; live if a proxy was established
    pub(crate) fn register(&self, name: &str, kind: ServiceKind, proxy: Option<ProxyRef>) {
        let connection = if proxy.is_some() {
            Connection::Live
        } else {
            Connection::Unreachable
        };
        let mut handle = ServiceHandle::new(name, kind, connection);
        handle.last_health_check = Some(Utc::now());
        self.write()
            .insert(name.to_string(), ServiceEntry { handle, proxy });
    }

    pub fn handles(&self) -> Vec<ServiceHandle> {
        self.read().values().map(|e| e.handle.clone()).collect()
    }

    pub fn handle(&self, name: &str) -> Option<ServiceHandle> {
        self.read().get(name).map(|e| e.handle.clone())
    }

    pub fn is_live(&self, name: &str) -> bool {
        self.read()
            .get(name)
            .map(|e| e.handle.is_live())
            .unwrap_or(false)
    }

    /// Proxy of a service that is currently live
    pub fn live_proxy(&self, name: &str) -> Option<ProxyRef> {
        self.read()
            .get(name)
            .filter(|e| e.handle.is_live())
            .and_then(|e| e.proxy.clone())
    }

    pub fn live_incubator(&self, name: &str) -> Option<Arc<dyn Incubator>> {
        self.live_proxy(name).and_then(|p| p.as_incubator())
    }

    pub fn live_robotic_arm(&self, name: &str) -> Option<Arc<dyn RoboticArm>> {
        self.live_proxy(name).and_then(|p| p.as_robotic_arm())
    }

    pub fn live_microscope(&self, name: &str) -> Option<Arc<dyn Microscope>> {
        self.live_proxy(name).and_then(|p| p.as_microscope())
    }

    fn proxy(&self, name: &str) -> Option<ProxyRef> {
        self.read().get(name).and_then(|e| e.proxy.clone())
    }

    fn record_success(&self, name: &str) {
        if let Some(entry) = self.write().get_mut(name) {
            entry.handle.consecutive_failures = 0;
            entry.handle.last_health_check = Some(Utc::now());
        }
    }

    /// Count a failed probe. Returns true if this flipped the service to unreachable.
    pub(crate) fn record_failure(&self, name: &str, threshold: u32) -> bool {
        let mut table = self.write();
        let Some(entry) = table.get_mut(name) else {
            return false;
        };
        let handle = &mut entry.handle;
        handle.consecutive_failures = handle.consecutive_failures.saturating_add(1);
        handle.last_health_check = Some(Utc::now());

        if handle.is_live() && handle.consecutive_failures >= threshold {
            handle.connection = Connection::Unreachable;
            entry.proxy = None;
            return true;
        }
        false
    }

    fn restore(&self, name: &str, proxy: ProxyRef) {
        if let Some(entry) = self.write().get_mut(name) {
            entry.handle.connection = Connection::Live;
            entry.handle.consecutive_failures = 0;
            entry.handle.last_health_check = Some(Utc::now());
            entry.proxy = Some(proxy);
        }
    }
}

async fn ping_ok(proxy: &ProxyRef, ping_timeout: Duration) -> Result<(), String> {
    match timeout(ping_timeout, proxy.ping()).await {
        Ok(Ok(reply)) if reply == PONG => Ok(()),
        Ok(Ok(reply)) => Err(format!("unexpected ping reply '{}'", reply)),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!("no ping reply within {:?}", ping_timeout)),
    }
}

/// Periodic prober for every service in the table
#[derive(Clone)]
pub struct HealthMonitor {
    services: ServiceTable,
    connector: Arc<dyn ServiceConnector>,
    settings: HealthSettings,
    ping_timeout: Duration,
    events: broadcast::Sender<ServiceEvent>,
}

impl HealthMonitor {
    pub fn new(
        services: ServiceTable,
        connector: Arc<dyn ServiceConnector>,
        settings: HealthSettings,
        ping_timeout: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            services,
            connector,
            settings,
            ping_timeout,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.events.subscribe()
    }

    /// Probe every service once, concurrently
    pub async fn probe_cycle(&self) {
        let mut probes = JoinSet::new();
        for handle in self.services.handles() {
            let monitor = self.clone();
            probes.spawn(async move { monitor.probe(handle).await });
        }

        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok(Some(event)) => {
                    // No subscribers is fine
                    let _ = self.events.send(event);
                }
                Ok(None) => {}
                Err(e) => error!(error = %e, "Health probe panicked"),
            }
        }
    }

    async fn probe(&self, handle: ServiceHandle) -> Option<ServiceEvent> {
        let name = handle.name.as_str();

        match handle.connection {
            Connection::Live => {
                let result = match self.services.proxy(name) {
                    Some(proxy) => ping_ok(&proxy, self.ping_timeout).await,
                    None => Err("no proxy".to_string()),
                };

                match result {
                    Ok(()) => {
                        debug!(service = name, "Ping ok");
                        self.services.record_success(name);
                        None
                    }
                    Err(reason) => {
                        warn!(
                            service = name,
                            failures = handle.consecutive_failures + 1,
                            threshold = self.settings.failure_threshold,
                            %reason,
                            "Health check failed"
                        );
                        if self
                            .services
                            .record_failure(name, self.settings.failure_threshold)
                        {
                            error!(service = name, "Service unreachable; dispatch gated");
                            Some(ServiceEvent::Lost {
                                name: handle.name.clone(),
                                kind: handle.kind,
                            })
                        } else {
                            None
                        }
                    }
                }
            }
            Connection::Unreachable => {
                let connected = timeout(self.ping_timeout, self.connector.connect(handle.kind, name))
                    .await
                    .map_err(|_| format!("connect timed out after {:?}", self.ping_timeout))
                    .and_then(|r| r.map_err(|e| e.to_string()));

                let result = match connected {
                    Ok(proxy) => ping_ok(&proxy, self.ping_timeout).await.map(|_| proxy),
                    Err(reason) => Err(reason),
                };

                match result {
                    Ok(proxy) => {
                        self.services.restore(name, proxy);
                        info!(service = name, "Service reconnected");
                        Some(ServiceEvent::Recovered {
                            name: handle.name.clone(),
                            kind: handle.kind,
                        })
                    }
                    Err(reason) => {
                        debug!(service = name, %reason, "Reconnect attempt failed");
                        self.services
                            .record_failure(name, self.settings.failure_threshold);
                        None
                    }
                }
            }
        }
    }

    /// Probe on the configured interval until `stop` fires
    pub async fn run(self, mut stop: watch::Receiver<bool>) {
        let mut ticker = interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            interval_s = self.settings.interval.as_secs_f64(),
            threshold = self.settings.failure_threshold,
            "Health monitor started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => self.probe_cycle().await,
                _ = stop.changed() => break,
            }
        }

        info!("Health monitor stopped");
    }
}
