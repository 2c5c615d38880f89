use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use chorus_protocol::control::{ControlMessage, PeerDescriptor};

use super::link::{Command, LinkState, PeerLink};
use super::{DestroyInfo, MessageTransport, PeerHandle, PeerShared, PeerState, RpcHandlers};

#[derive(Debug, Clone)]
pub enum ManagerEvent {
    PeerChange { uuid: Uuid, state: PeerState },
    ConnectedPeer { uuid: Uuid },
    /// First time this stable uuid has connected in this process.
    NewConnectedPeer { uuid: Uuid },
    /// Inbound control traffic from a promoted peer, re-emitted for
    /// embedder subscribers.
    ControllerMessage { uuid: Uuid, message: ControlMessage },
}

pub(crate) enum Resolution {
    Promote { is_new: bool },
    DropNewcomer,
}

/// Registry of peers keyed by stable uuid. Links and sinks hold
/// handles and look peers up here rather than owning each other;
/// destruction clears the slot.
pub struct PeerManager {
    registry: Mutex<Registry>,
    events: broadcast::Sender<ManagerEvent>,
    handlers: Arc<RpcHandlers>,
    local: PeerHandle,
    no_response_timeout: Duration,
}

#[derive(Default)]
struct Registry {
    /// Live links keyed by connection, including not-yet-promoted ones.
    connections: HashMap<Uuid, PeerHandle>,
    /// Stable uuid of a promoted peer to its connection key.
    by_uuid: HashMap<Uuid, Uuid>,
    /// Stable uuids that have connected at least once.
    seen: HashSet<Uuid>,
}

impl PeerManager {
    pub fn new(local: PeerDescriptor, no_response_timeout: Duration) -> Arc<PeerManager> {
        let handlers = Arc::new(RpcHandlers::default());
        let local = PeerHandle::new_local(local, handlers.clone());
        let (events, _) = broadcast::channel(64);

        Arc::new(PeerManager {
            registry: Mutex::new(Registry::default()),
            events,
            handlers,
            local,
            no_response_timeout,
        })
    }

    /// The distinguished peer representing this process.
    pub fn local(&self) -> &PeerHandle {
        &self.local
    }

    pub fn rpc_handlers(&self) -> &Arc<RpcHandlers> {
        &self.handlers
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.events.subscribe()
    }

    pub fn get(&self, uuid: Uuid) -> Option<PeerHandle> {
        if self.local.uuid() == Some(uuid) {
            return Some(self.local.clone());
        }

        let registry = self.registry.lock().unwrap();
        let conn_key = registry.by_uuid.get(&uuid)?;
        registry.connections.get(conn_key).cloned()
    }

    pub fn connected_peers(&self) -> Vec<PeerHandle> {
        let registry = self.registry.lock().unwrap();
        registry
            .connections
            .values()
            .filter(|peer| peer.state() == PeerState::Connected)
            .cloned()
            .collect()
    }

    /// Wires a freshly established collaborator channel into a peer in
    /// `Connecting` state and introduces ourselves. The peer reaches
    /// `Connected` once its info arrives and survives duplicate
    /// resolution. Must be called within a tokio runtime.
    pub fn accept_connection(
        self: &Arc<Self>,
        transport: Box<dyn MessageTransport>,
        inbound: mpsc::UnboundedReceiver<ControlMessage>,
    ) -> PeerHandle {
        let conn_key = Uuid::new_v4();
        let shared = PeerShared::new(false, PeerState::Connecting, self.handlers.clone());

        let (commands_tx, commands_rx) = mpsc::unbounded_channel::<Command>();
        let handle = PeerHandle { shared: shared.clone(), commands: commands_tx };

        let hello = ControlMessage::PeerInfo {
            peer: self.local.descriptor().expect("local peer has a descriptor"),
            shared_state: None,
        };
        if let Err(e) = transport.send(&hello) {
            log::warn!("introducing ourselves on new link: {e}");
        }

        self.registry.lock().unwrap().connections.insert(conn_key, handle.clone());

        let link = PeerLink {
            state: LinkState {
                shared,
                manager: self.clone(),
                transport,
                handlers: self.handlers.clone(),
                conn_key,
                pending: HashMap::new(),
                init_probes_left: 0,
            },
            inbound,
            commands: commands_rx,
            no_response_timeout: self.no_response_timeout,
        };

        tokio::spawn(link.run());

        handle
    }

    /// Duplicate resolution on peer info: a connection claiming a
    /// stable uuid that is already live either is a duplicate of the
    /// same process (drop the newcomer) or a restarted process
    /// (displace the incumbent).
    pub(crate) fn resolve_peer_info(&self, conn_key: Uuid, descriptor: &PeerDescriptor) -> Resolution {
        let mut registry = self.registry.lock().unwrap();

        if self.local.uuid() == Some(descriptor.uuid) {
            log::warn!("peer claims our own uuid {}, dropping", descriptor.uuid);
            return Resolution::DropNewcomer;
        }

        if let Some(&incumbent_key) = registry.by_uuid.get(&descriptor.uuid) {
            if incumbent_key != conn_key {
                let incumbent = registry.connections.get(&incumbent_key).cloned();

                if let Some(incumbent) = incumbent.filter(|peer| peer.state() != PeerState::Deleted) {
                    if incumbent.instance_uuid() == Some(descriptor.instance_uuid) {
                        return Resolution::DropNewcomer;
                    }

                    // a new process of the same peer has appeared
                    log::info!("peer {} restarted, displacing previous instance", descriptor.uuid);
                    incumbent.destroy(DestroyInfo {
                        advertise_destroy: true,
                        can_try_reconnect: false,
                    });
                }
            }
        }

        let is_new = registry.seen.insert(descriptor.uuid);
        registry.by_uuid.insert(descriptor.uuid, conn_key);

        Resolution::Promote { is_new }
    }

    pub(crate) fn notify_connected(&self, uuid: Uuid, is_new: bool) {
        let _ = self.events.send(ManagerEvent::PeerChange { uuid, state: PeerState::Connected });
        let _ = self.events.send(ManagerEvent::ConnectedPeer { uuid });
        if is_new {
            let _ = self.events.send(ManagerEvent::NewConnectedPeer { uuid });
        }
    }

    pub(crate) fn emit_controller_message(&self, uuid: Uuid, message: ControlMessage) {
        let _ = self.events.send(ManagerEvent::ControllerMessage { uuid, message });
    }

    pub(crate) fn unregister(&self, conn_key: Uuid, _info: DestroyInfo) {
        let mut registry = self.registry.lock().unwrap();

        let Some(handle) = registry.connections.remove(&conn_key) else { return };

        if let Some(uuid) = handle.uuid() {
            if registry.by_uuid.get(&uuid) == Some(&conn_key) {
                registry.by_uuid.remove(&uuid);
            }

            let _ = self.events.send(ManagerEvent::PeerChange { uuid, state: PeerState::Deleted });
        }
    }
}
