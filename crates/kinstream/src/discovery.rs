// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Local-network server discovery.
//!
//! Servers announce themselves under a fixed DNS-SD service type; browsers
//! observe announcements and map them to control endpoints. The DNS-SD/mDNS
//! machinery itself is an external collaborator behind the
//! [`ServiceResponder`] seam; this module owns the streaming-level
//! semantics:
//!
//! - the advertisement carries only "here is a Kinect server" (instance name
//!   and control port); per-device endpoints always travel in `me` payloads,
//!   never in TXT records;
//! - a browser pairs every add with exactly one remove per name, and a
//!   remove always precedes a re-add of the same name;
//! - responder callbacks arrive on the responder's own observer thread, so
//!   the observer registered there holds only a weak handle to the browser
//!   and no-ops once the browser is gone.
//!
//! [`local::LocalResponder`] is an in-process responder used by tests and
//! same-process demos.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::Result;

/// DNS-SD service type for Kinect v2 stream servers.
pub const SERVICE_TYPE: &str = "_kinect2._tcp.local.";

/// A discovered stream server.
///
/// Immutable once created; destroyed when the advertisement is withdrawn.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ServerInfo {
    /// Server-provided human-readable name, unique within a browse session.
    pub name: String,
    /// Control endpoint URI (`tcp://host:port`) to hand to a client.
    pub endpoint: String,
}

/// One service advertisement.
#[derive(Clone, Debug)]
pub struct ServiceRegistration {
    /// Service type, [`SERVICE_TYPE`] for stream servers.
    pub service_type: String,
    /// Fully-qualified instance name, `<name>.<service_type>`.
    pub instance: String,
    /// Address the control endpoint is bound to.
    pub address: IpAddr,
    /// Control endpoint port.
    pub port: u16,
    /// TXT record; empty by contract.
    pub txt: BTreeMap<String, String>,
}

impl ServiceRegistration {
    /// Advertisement for a stream server's control endpoint.
    pub fn stream_server(name: &str, address: IpAddr, port: u16) -> Self {
        Self {
            service_type: SERVICE_TYPE.to_string(),
            instance: format!("{}.{}", name, SERVICE_TYPE),
            address,
            port,
            txt: BTreeMap::new(),
        }
    }
}

// ============================================================================
// Responder seam
// ============================================================================

/// Callbacks a responder delivers to a browse registration.
///
/// Invoked on the responder's background observer thread; implementations
/// must be `Send + Sync` and must not block.
pub trait BrowseObserver: Send + Sync {
    /// An advertisement appeared and resolved to an address and port.
    fn service_resolved(&self, service_type: &str, instance: &str, address: IpAddr, port: u16);

    /// An advertisement was withdrawn.
    fn service_removed(&self, service_type: &str, instance: &str);
}

/// The external DNS-SD/mDNS implementation.
///
/// Registrations are keyed by instance name; registering an instance twice
/// withdraws the first advertisement. Browse registrations live as long as
/// the responder; observers that outlive their owners are expected to no-op
/// (see [`ServerBrowser`]).
pub trait ServiceResponder: Send + Sync {
    /// Publish an advertisement.
    fn register(&self, registration: ServiceRegistration) -> Result<()>;

    /// Withdraw an advertisement by instance name.
    fn unregister(&self, instance: &str) -> Result<()>;

    /// Observe advertisements of one service type. Already-known services
    /// are replayed to the new observer.
    fn browse(&self, service_type: &str, observer: Arc<dyn BrowseObserver>) -> Result<()>;
}

// ============================================================================
// Browser
// ============================================================================

/// Callbacks emitted by a [`ServerBrowser`].
///
/// Invoked on the responder's observer thread; must be `Send + Sync` and
/// must not block.
pub trait BrowserListener: Send + Sync {
    /// A stream server appeared on the network.
    fn on_add_server(&self, info: &ServerInfo);

    /// A stream server withdrew.
    fn on_remove_server(&self, info: &ServerInfo);
}

struct BrowserInner {
    listener: Arc<dyn BrowserListener>,
    /// Known servers keyed by fully-qualified instance name.
    servers: Mutex<BTreeMap<String, ServerInfo>>,
}

/// Observer registered with the responder. Holds a weak handle so the
/// responder's thread never keeps a dropped browser alive.
struct WeakObserver {
    inner: Weak<BrowserInner>,
}

impl BrowseObserver for WeakObserver {
    fn service_resolved(&self, service_type: &str, instance: &str, address: IpAddr, port: u16) {
        let inner = match self.inner.upgrade() {
            Some(inner) => inner,
            None => return,
        };
        // Skip types we don't know about.
        if service_type != SERVICE_TYPE {
            return;
        }

        log::info!("service discovered: {}", instance);
        let short_name = instance
            .strip_suffix(&format!(".{}", SERVICE_TYPE))
            .unwrap_or(instance);

        // The advertised port is the control endpoint by contract.
        let info = ServerInfo {
            name: short_name.to_string(),
            endpoint: format!("tcp://{}:{}", address, port),
        };

        let previous = inner.servers.lock().insert(instance.to_string(), info.clone());
        if let Some(previous) = previous {
            // Never two adds without an intervening remove for one name.
            inner.listener.on_remove_server(&previous);
        }
        inner.listener.on_add_server(&info);
    }

    fn service_removed(&self, service_type: &str, instance: &str) {
        let inner = match self.inner.upgrade() {
            Some(inner) => inner,
            None => return,
        };
        if service_type != SERVICE_TYPE {
            return;
        }

        log::info!("service removed: {}", instance);
        let removed = inner.servers.lock().remove(instance);
        match removed {
            Some(info) => inner.listener.on_remove_server(&info),
            None => log::warn!("ignoring removal of unknown server {}", instance),
        }
    }
}

/// Watches the network for stream servers.
///
/// Keep the browser alive for as long as notifications are wanted; dropping
/// it silences the underlying browse registration.
pub struct ServerBrowser {
    inner: Arc<BrowserInner>,
}

impl ServerBrowser {
    /// Start browsing for stream servers on `responder`.
    pub fn new(
        responder: &Arc<dyn ServiceResponder>,
        listener: Arc<dyn BrowserListener>,
    ) -> Result<Self> {
        let inner = Arc::new(BrowserInner {
            listener,
            servers: Mutex::new(BTreeMap::new()),
        });
        responder.browse(
            SERVICE_TYPE,
            Arc::new(WeakObserver {
                inner: Arc::downgrade(&inner),
            }),
        )?;
        Ok(Self { inner })
    }

    /// Snapshot of currently-known servers.
    pub fn servers(&self) -> Vec<ServerInfo> {
        self.inner.servers.lock().values().cloned().collect()
    }
}

// ============================================================================
// In-process responder
// ============================================================================

pub mod local {
    //! In-process service registry implementing [`ServiceResponder`].
    //!
    //! Useful for tests and demos where server and browser share a process.
    //! Callbacks are pumped through a dedicated observer thread, matching
    //! the delivery model of a real mDNS library.

    use super::*;
    use crossbeam::channel::{unbounded, Sender};
    use std::collections::HashMap;
    use std::thread::JoinHandle;

    enum RegistryEvent {
        Registered(ServiceRegistration),
        Unregistered(String),
        NewObserver {
            service_type: String,
            observer: Arc<dyn BrowseObserver>,
        },
    }

    /// In-process responder with its own observer thread.
    pub struct LocalResponder {
        events_tx: Sender<RegistryEvent>,
        thread: Mutex<Option<JoinHandle<()>>>,
    }

    impl LocalResponder {
        pub fn new() -> Arc<dyn ServiceResponder> {
            let (events_tx, events_rx) = unbounded();

            let thread = std::thread::Builder::new()
                .name("local-discovery".to_string())
                .spawn(move || {
                    let mut services: HashMap<String, ServiceRegistration> = HashMap::new();
                    let mut observers: Vec<(String, Arc<dyn BrowseObserver>)> = Vec::new();

                    for event in events_rx.iter() {
                        match event {
                            RegistryEvent::Registered(reg) => {
                                if let Some(prev) = services.remove(&reg.instance) {
                                    notify_removed(&observers, &prev);
                                }
                                notify_resolved(&observers, &reg);
                                services.insert(reg.instance.clone(), reg);
                            }
                            RegistryEvent::Unregistered(instance) => {
                                if let Some(prev) = services.remove(&instance) {
                                    notify_removed(&observers, &prev);
                                } else {
                                    log::warn!(
                                        "unregister of unknown service {}",
                                        instance
                                    );
                                }
                            }
                            RegistryEvent::NewObserver {
                                service_type,
                                observer,
                            } => {
                                // Replay existing services to the newcomer.
                                for reg in services.values() {
                                    if reg.service_type == service_type {
                                        observer.service_resolved(
                                            &reg.service_type,
                                            &reg.instance,
                                            reg.address,
                                            reg.port,
                                        );
                                    }
                                }
                                observers.push((service_type, observer));
                            }
                        }
                    }
                })
                .ok();

            Arc::new(LocalResponder {
                events_tx,
                thread: Mutex::new(thread),
            })
        }
    }

    fn notify_resolved(
        observers: &[(String, Arc<dyn BrowseObserver>)],
        reg: &ServiceRegistration,
    ) {
        for (service_type, observer) in observers {
            if *service_type == reg.service_type {
                observer.service_resolved(
                    &reg.service_type,
                    &reg.instance,
                    reg.address,
                    reg.port,
                );
            }
        }
    }

    fn notify_removed(
        observers: &[(String, Arc<dyn BrowseObserver>)],
        reg: &ServiceRegistration,
    ) {
        for (service_type, observer) in observers {
            if *service_type == reg.service_type {
                observer.service_removed(&reg.service_type, &reg.instance);
            }
        }
    }

    impl ServiceResponder for LocalResponder {
        fn register(&self, registration: ServiceRegistration) -> Result<()> {
            self.events_tx
                .send(RegistryEvent::Registered(registration))
                .map_err(|_| crate::error::Error::Discovery("responder stopped".into()))
        }

        fn unregister(&self, instance: &str) -> Result<()> {
            self.events_tx
                .send(RegistryEvent::Unregistered(instance.to_string()))
                .map_err(|_| crate::error::Error::Discovery("responder stopped".into()))
        }

        fn browse(&self, service_type: &str, observer: Arc<dyn BrowseObserver>) -> Result<()> {
            self.events_tx
                .send(RegistryEvent::NewObserver {
                    service_type: service_type.to_string(),
                    observer,
                })
                .map_err(|_| crate::error::Error::Discovery("responder stopped".into()))
        }
    }

    impl Drop for LocalResponder {
        fn drop(&mut self) {
            // Closing the channel ends the observer thread.
            let (dead_tx, _) = unbounded();
            self.events_tx = dead_tx;
            if let Some(handle) = self.thread.lock().take() {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::local::LocalResponder;
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct RecordingListener {
        events: StdMutex<Vec<(String, ServerInfo)>>,
    }

    impl RecordingListener {
        fn events(&self) -> Vec<(String, ServerInfo)> {
            self.events.lock().unwrap().clone()
        }

        fn wait_for(&self, count: usize) -> Vec<(String, ServerInfo)> {
            let deadline = Instant::now() + Duration::from_secs(5);
            loop {
                let events = self.events();
                if events.len() >= count || Instant::now() >= deadline {
                    return events;
                }
                std::thread::sleep(Duration::from_millis(5));
            }
        }
    }

    impl BrowserListener for RecordingListener {
        fn on_add_server(&self, info: &ServerInfo) {
            self.events
                .lock()
                .unwrap()
                .push(("add".to_string(), info.clone()));
        }

        fn on_remove_server(&self, info: &ServerInfo) {
            self.events
                .lock()
                .unwrap()
                .push(("remove".to_string(), info.clone()));
        }
    }

    fn register_server(responder: &Arc<dyn ServiceResponder>, name: &str, port: u16) {
        responder
            .register(ServiceRegistration::stream_server(
                name,
                "127.0.0.1".parse().unwrap(),
                port,
            ))
            .unwrap();
    }

    #[test]
    fn test_add_remove_roundtrip() {
        let responder = LocalResponder::new();
        let listener = Arc::new(RecordingListener::default());
        let _browser = ServerBrowser::new(&responder, listener.clone()).unwrap();

        register_server(&responder, "S1", 4100);
        let events = listener.wait_for(1);
        assert_eq!(events[0].0, "add");
        assert_eq!(events[0].1.name, "S1");
        assert_eq!(events[0].1.endpoint, "tcp://127.0.0.1:4100");

        responder
            .unregister(&format!("S1.{}", SERVICE_TYPE))
            .unwrap();
        let events = listener.wait_for(2);
        assert_eq!(events[1].0, "remove");
        assert_eq!(events[1].1, events[0].1);
    }

    #[test]
    fn test_reregister_pairs_remove_before_add() {
        let responder = LocalResponder::new();
        let listener = Arc::new(RecordingListener::default());
        let browser = ServerBrowser::new(&responder, listener.clone()).unwrap();

        register_server(&responder, "S1", 4200);
        listener.wait_for(1);
        register_server(&responder, "S1", 4201);

        let events = listener.wait_for(3);
        let kinds: Vec<&str> = events.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(kinds, vec!["add", "remove", "add"]);
        assert_eq!(events[2].1.endpoint, "tcp://127.0.0.1:4201");
        assert_eq!(browser.servers().len(), 1);
    }

    #[test]
    fn test_existing_services_replayed_to_new_browser() {
        let responder = LocalResponder::new();
        register_server(&responder, "S1", 4300);

        let listener = Arc::new(RecordingListener::default());
        let _browser = ServerBrowser::new(&responder, listener.clone()).unwrap();
        let events = listener.wait_for(1);
        assert_eq!(events[0].1.name, "S1");
    }

    #[test]
    fn test_dropped_browser_no_ops() {
        let responder = LocalResponder::new();
        let listener = Arc::new(RecordingListener::default());
        let browser = ServerBrowser::new(&responder, listener.clone()).unwrap();

        register_server(&responder, "S1", 4400);
        listener.wait_for(1);

        drop(browser);
        register_server(&responder, "S2", 4401);

        // The responder keeps running; the weak observer swallows the event.
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(listener.events().len(), 1);
    }

    #[test]
    fn test_foreign_service_types_filtered() {
        let responder = LocalResponder::new();
        let listener = Arc::new(RecordingListener::default());
        let _browser = ServerBrowser::new(&responder, listener.clone()).unwrap();

        responder
            .register(ServiceRegistration {
                service_type: "_http._tcp.local.".to_string(),
                instance: "web._http._tcp.local.".to_string(),
                address: "127.0.0.1".parse().unwrap(),
                port: 80,
                txt: BTreeMap::new(),
            })
            .unwrap();
        register_server(&responder, "S1", 4500);

        let events = listener.wait_for(1);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].1.name, "S1");
    }
}
