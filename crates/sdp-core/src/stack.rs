//! The per-device SDP stack: owns the socket registry, routes fabric events
//! and runs the background sweep.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use sdp_config::ConfigManager;
use sdp_proto::Hello;
use sdp_verbs::{CmEvent, EndpointId, Fabric, FabricEvent};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::SdpConfig;
use crate::conn::{Connection, Role};
use crate::error::SdpError;
use crate::listener::ListenState;
use crate::registry::{Registered, SocketRegistry};
use crate::runtime::BackgroundRunner;
use crate::socket::{SdpListener, SdpSocket};
use crate::state::TcpState;

struct StackInner {
    fabric: Arc<dyn Fabric>,
    registry: Arc<SocketRegistry>,
    config: Arc<ConfigManager<SdpConfig>>,
    runtime: Handle,
}

/// Sockets over one fabric device.
///
/// Must be created inside a tokio runtime. Fabric events are consumed by a
/// dispatcher task; a periodic sweep polls every connection as a fallback
/// for missed completion notifications and drives interrupt moderation.
pub struct SdpStack {
    inner: Arc<StackInner>,
    runner: Mutex<Option<BackgroundRunner>>,
}

impl SdpStack {
    pub fn new(fabric: Arc<dyn Fabric>, config: SdpConfig) -> Result<Self, SdpError> {
        Self::with_config_manager(fabric, Arc::new(ConfigManager::new(config)))
    }

    /// Build a stack whose hot-updatable settings follow `config`.
    pub fn with_config_manager(
        fabric: Arc<dyn Fabric>,
        config: Arc<ConfigManager<SdpConfig>>,
    ) -> Result<Self, SdpError> {
        config.get().check()?;
        let runtime = Handle::try_current().map_err(|_| {
            SdpError::InvalidArgument("SdpStack requires a tokio runtime".into())
        })?;

        let inner = Arc::new(StackInner {
            fabric,
            registry: Arc::new(SocketRegistry::new()),
            config,
            runtime,
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        inner.fabric.set_event_sink(tx);

        let mut runner = BackgroundRunner::new();
        let dispatcher = inner.clone();
        runner.spawn(move |mut shutdown| async move {
            loop {
                tokio::select! {
                    event = rx.recv() => match event {
                        Some(event) => dispatcher.dispatch(event),
                        None => break,
                    },
                    _ = shutdown.changed() => break,
                }
            }
            debug!("event dispatcher stopped");
        });

        let period = inner.clone();
        let sweeper = inner.clone();
        runner.spawn_periodic(
            move || period.config.get().poll_interval(),
            move || {
                let inner = sweeper.clone();
                async move { inner.sweep() }
            },
        );

        info!(device = %inner.fabric.device(), "sdp stack started");
        Ok(Self {
            inner,
            runner: Mutex::new(Some(runner)),
        })
    }

    /// Open a connection to `addr`, waiting up to the connect timeout.
    pub async fn connect(&self, addr: SocketAddr) -> Result<SdpSocket, SdpError> {
        let inner = &self.inner;
        let config = inner.config.load_full();
        let deadline = Instant::now() + config.connect_timeout();
        let ep = inner.fabric.create_endpoint()?;
        let conn = Connection::new(
            ep,
            Role::Active,
            TcpState::SynSent,
            inner.fabric.clone(),
            inner.registry.clone(),
            config,
            inner.runtime.clone(),
        );
        if let Err(e) = inner
            .registry
            .insert(ep, Registered::Socket(conn.clone()))
        {
            conn.destroy();
            return Err(e);
        }
        debug!(%ep, %addr, "connecting");
        if let Err(e) = inner.fabric.resolve_addr(ep, addr) {
            conn.destroy();
            return Err(e.into());
        }
        conn.wait_connected(deadline).await?;
        Ok(SdpSocket::new(conn))
    }

    /// Listen on `addr`. Port 0 picks an ephemeral port; an unspecified IP
    /// binds the device address.
    pub fn listen(&self, addr: SocketAddr, backlog: usize) -> Result<SdpListener, SdpError> {
        let inner = &self.inner;
        let ep = inner.fabric.create_endpoint()?;
        let local = match inner.fabric.listen(ep, addr) {
            Ok(local) => local,
            Err(e) => {
                inner.fabric.destroy_endpoint(ep);
                return Err(e.into());
            }
        };
        let ls = Arc::new(ListenState::new(
            ep,
            local,
            backlog,
            inner.fabric.clone(),
            inner.registry.clone(),
        ));
        if let Err(e) = inner
            .registry
            .insert(ep, Registered::Listener(ls.clone()))
        {
            inner.fabric.destroy_endpoint(ep);
            return Err(e);
        }
        info!(listener = %ep, addr = %local, backlog, "listening");
        Ok(SdpListener::new(ls))
    }

    pub fn config(&self) -> &Arc<ConfigManager<SdpConfig>> {
        &self.inner.config
    }

    /// Registered sockets and listeners.
    pub fn socket_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Abort every connection, close every listener and stop the
    /// background tasks.
    pub async fn shutdown(&self) {
        let runner = self.runner.lock().take();
        let Some(runner) = runner else {
            return;
        };
        let entries = self.inner.registry.shutdown();
        let count = entries.len();
        for entry in entries {
            match entry {
                Registered::Socket(conn) => conn.abort(),
                Registered::Listener(ls) => ls.close(),
            }
        }
        runner.shutdown().await;
        info!(sockets = count, "sdp stack shut down");
    }
}

impl Drop for SdpStack {
    fn drop(&mut self) {
        if let Some(runner) = self.runner.lock().as_ref() {
            runner.stop();
        }
    }
}

impl StackInner {
    fn dispatch(&self, event: FabricEvent) {
        match event {
            FabricEvent::Completion { endpoint, cq } => match self.registry.get(endpoint) {
                Some(Registered::Socket(conn)) => {
                    conn.poll_once();
                }
                _ => trace!(ep = %endpoint, ?cq, "completion for unknown endpoint"),
            },
            FabricEvent::Cm {
                endpoint,
                event: CmEvent::DeviceRemoval,
            } => self.on_device_removal(endpoint),
            FabricEvent::Cm {
                endpoint,
                event:
                    CmEvent::ConnectRequest {
                        child,
                        private_data,
                        peer,
                    },
            } => self.on_connect_request(endpoint, child, private_data, peer),
            FabricEvent::Cm { endpoint, event } => match self.registry.get(endpoint) {
                Some(Registered::Socket(conn)) => conn.handle_cm_event(event),
                Some(Registered::Listener(_)) => {
                    debug!(ep = %endpoint, event = event.name(), "ignoring event on listener")
                }
                None => trace!(ep = %endpoint, event = event.name(), "event for unknown endpoint"),
            },
        }
    }

    /// A passive open: admit the child into the listener's backlog and
    /// answer its HELLO, or refuse it.
    fn on_connect_request(
        &self,
        listener: EndpointId,
        child: EndpointId,
        private_data: Bytes,
        peer: SocketAddr,
    ) {
        let ls = match self.registry.get(listener) {
            Some(Registered::Listener(ls)) => ls,
            _ => {
                debug!(%listener, %child, "connect request without a listener");
                self.refuse(child);
                return;
            }
        };
        let hello = match Hello::decode(&private_data) {
            Ok(hello) => hello,
            Err(e) => {
                warn!(%listener, %peer, error = %e, "bad HELLO");
                self.refuse(child);
                return;
            }
        };
        if !ls.has_room() {
            debug!(%listener, %peer, "backlog full, refusing connection");
            self.refuse(child);
            return;
        }

        let conn = Connection::new(
            child,
            Role::Passive,
            TcpState::SynRecv,
            self.fabric.clone(),
            self.registry.clone(),
            self.config.load_full(),
            self.runtime.clone(),
        );
        if let Err(e) = self.registry.insert(child, Registered::Socket(conn.clone())) {
            debug!(%child, error = %e, "refusing connection");
            self.refuse(child);
            return;
        }
        if !ls.add_pending(conn.clone()) {
            self.reject_child(&conn);
            return;
        }
        debug!(%listener, %child, %peer, bufs = hello.bufs, "connect request");
        if let Err(e) = conn.accept_hello(&hello, Arc::downgrade(&ls)) {
            warn!(%child, %peer, error = %e, "accept failed");
            self.reject_child(&conn);
        }
    }

    fn refuse(&self, child: EndpointId) {
        if let Err(e) = self.fabric.reject(child) {
            debug!(%child, error = %e, "reject failed");
        }
        self.fabric.destroy_endpoint(child);
    }

    fn reject_child(&self, conn: &Connection) {
        if let Err(e) = self.fabric.reject(conn.ep) {
            debug!(child = %conn.ep, error = %e, "reject failed");
        }
        conn.reset(SdpError::ConnectionReset);
    }

    fn on_device_removal(&self, endpoint: EndpointId) {
        let conns = self.registry.connections();
        let listeners = self.registry.listeners();
        if conns.is_empty() && listeners.is_empty() {
            return;
        }
        warn!(
            ep = %endpoint,
            device = %self.fabric.device(),
            sockets = conns.len(),
            listeners = listeners.len(),
            "device removed, tearing down"
        );
        for conn in conns {
            conn.handle_cm_event(CmEvent::DeviceRemoval);
        }
        for ls in listeners {
            ls.close();
        }
    }

    fn sweep(&self) {
        let config = self.config.get();
        let now = Instant::now();
        for conn in self.registry.connections() {
            conn.poll_once();
            if config.moderation_enabled {
                conn.sample_moderation(&config, now);
            }
        }
    }
}
