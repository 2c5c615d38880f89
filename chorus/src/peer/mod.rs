pub mod link;
pub mod manager;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use uuid::Uuid;

use chorus_core::timesync::TimeSync;
use chorus_protocol::control::{ControlMessage, PeerDescriptor};

use self::link::Command;

/// Lifecycle of a peer. Transitions only move forward; `Deleted` is
/// terminal and a reconnecting peer always gets a fresh descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    Connected,
    Deleted,
}

impl PeerState {
    pub fn can_transition_to(self, next: PeerState) -> bool {
        matches!(
            (self, next),
            (PeerState::Connecting, PeerState::Connected)
                | (PeerState::Connecting, PeerState::Deleted)
                | (PeerState::Connected, PeerState::Deleted)
        )
    }
}

/// How a peer went away.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DestroyInfo {
    /// Other peers should be told this peer is gone (set when a
    /// restarted instance displaces the old one).
    pub advertise_destroy: bool,
    /// The link died rather than closed; a reconnect hook may retry.
    pub can_try_reconnect: bool,
}

#[derive(Debug, Clone)]
pub enum PeerEvent {
    StateChanged(PeerState),
    /// The committed clock delta moved past the update threshold.
    TimedeltaUpdated(f64),
    /// A timing probe was folded in; waiters use this to observe
    /// first-sync completion.
    TimesyncStateUpdated,
    Destroyed(DestroyInfo),
}

#[derive(Debug, Error)]
#[error("peer deleted")]
pub struct PeerGone;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("rpc rejected by peer: {0}")]
    Rejected(String),
    #[error("no handler registered for rpc type {0:?}")]
    NoHandler(String),
    #[error("peer deleted")]
    PeerGone,
    #[error("transport closed")]
    Transport,
}

#[derive(Debug, Error)]
#[error("transport closed")]
pub struct TransportError;

/// Capability handle over whatever the collaborator uses to move
/// control messages: the peer logic composes around this rather than
/// subclassing per transport.
pub trait MessageTransport: Send + 'static {
    fn send(&self, message: &ControlMessage) -> Result<(), TransportError>;
    fn close(&self);
}

pub type RpcHandler = Arc<dyn Fn(Value) -> Result<Value, String> + Send + Sync>;

/// Registry of RPC handlers, shared by every peer link (and the local
/// peer, which dispatches to it directly).
#[derive(Default)]
pub struct RpcHandlers {
    handlers: Mutex<HashMap<String, RpcHandler>>,
}

impl RpcHandlers {
    pub fn register(
        &self,
        rpc_type: &str,
        handler: impl Fn(Value) -> Result<Value, String> + Send + Sync + 'static,
    ) {
        let mut handlers = self.handlers.lock().unwrap();
        handlers.insert(rpc_type.to_string(), Arc::new(handler));
    }

    pub fn dispatch(&self, rpc_type: &str, body: Value) -> Result<Value, RpcError> {
        let handler = self.handlers.lock().unwrap().get(rpc_type).cloned();

        match handler {
            Some(handler) => handler(body).map_err(RpcError::Rejected),
            None => Err(RpcError::NoHandler(rpc_type.to_string())),
        }
    }
}

/// State shared between a peer's link task and its handles.
pub(crate) struct PeerShared {
    pub(crate) descriptor: Mutex<Option<PeerDescriptor>>,
    pub(crate) state: watch::Sender<PeerState>,
    pub(crate) timesync: Mutex<TimeSync>,
    pub(crate) events: broadcast::Sender<PeerEvent>,
    pub(crate) handlers: Arc<RpcHandlers>,
    pub(crate) is_local: bool,
}

impl PeerShared {
    pub(crate) fn new(is_local: bool, initial: PeerState, handlers: Arc<RpcHandlers>) -> Arc<PeerShared> {
        let (state, _) = watch::channel(initial);
        let (events, _) = broadcast::channel(64);

        Arc::new(PeerShared {
            descriptor: Mutex::new(None),
            state,
            timesync: Mutex::new(TimeSync::new()),
            events,
            handlers,
            is_local,
        })
    }

    /// Applies a forward-only state transition. Returns false when the
    /// transition is not allowed or is a no-op.
    pub(crate) fn set_state(&self, next: PeerState) -> bool {
        let mut changed = false;

        self.state.send_if_modified(|state| {
            if state.can_transition_to(next) {
                *state = next;
                changed = true;
            }
            changed
        });

        if changed {
            let _ = self.events.send(PeerEvent::StateChanged(next));
        }

        changed
    }

    pub(crate) fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }
}

/// Cloneable handle to one peer. The peer itself runs as a task (see
/// [`link`]); the local peer is a distinguished instance with no task,
/// always connected, whose clock delta is zero by construction.
#[derive(Clone)]
pub struct PeerHandle {
    pub(crate) shared: Arc<PeerShared>,
    pub(crate) commands: mpsc::UnboundedSender<Command>,
}

impl PeerHandle {
    pub(crate) fn new_local(descriptor: PeerDescriptor, handlers: Arc<RpcHandlers>) -> PeerHandle {
        let shared = PeerShared::new(true, PeerState::Connected, handlers);
        *shared.descriptor.lock().unwrap() = Some(descriptor);

        // no task behind the local peer; commands go nowhere
        let (commands, _) = mpsc::unbounded_channel();

        PeerHandle { shared, commands }
    }

    pub fn is_local(&self) -> bool {
        self.shared.is_local
    }

    pub fn descriptor(&self) -> Option<PeerDescriptor> {
        self.shared.descriptor.lock().unwrap().clone()
    }

    /// Stable identity, known once peer info has been exchanged.
    pub fn uuid(&self) -> Option<Uuid> {
        self.shared.descriptor.lock().unwrap().as_ref().map(|d| d.uuid)
    }

    pub fn instance_uuid(&self) -> Option<Uuid> {
        self.shared.descriptor.lock().unwrap().as_ref().map(|d| d.instance_uuid)
    }

    pub fn state(&self) -> PeerState {
        *self.shared.state.borrow()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.shared.events.subscribe()
    }

    pub async fn wait_for_connected(&self) -> Result<(), PeerGone> {
        let mut state = self.shared.state.subscribe();

        loop {
            match *state.borrow_and_update() {
                PeerState::Connected => return Ok(()),
                PeerState::Deleted => return Err(PeerGone),
                PeerState::Connecting => {}
            }

            if state.changed().await.is_err() {
                return Err(PeerGone);
            }
        }
    }

    /// True for the local peer, and for remotes whose delta window has
    /// reached the initial probe count.
    pub fn is_time_synchronized(&self) -> bool {
        if self.shared.is_local {
            return true;
        }
        self.shared.timesync.lock().unwrap().is_synchronized()
    }

    /// Completes once the peer is time-synchronized.
    pub async fn wait_for_first_time_sync(&self) -> Result<(), PeerGone> {
        let mut events = self.shared.events.subscribe();

        loop {
            if self.state() == PeerState::Deleted {
                return Err(PeerGone);
            }
            if self.is_time_synchronized() {
                return Ok(());
            }

            match events.recv().await {
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return Err(PeerGone),
            }
        }
    }

    /// This peer's clock, estimated from the local one. `precise`
    /// reads the live window median instead of the committed delta.
    pub fn current_time(&self, precise: bool) -> f64 {
        let now = chorus_util::time::now();

        if self.shared.is_local {
            return now;
        }

        let timesync = self.shared.timesync.lock().unwrap();
        let delta = if precise {
            timesync.median_delta().unwrap_or_else(|| timesync.committed_delta())
        } else {
            timesync.committed_delta()
        };

        now + delta
    }

    pub fn committed_delta(&self) -> f64 {
        if self.shared.is_local {
            return 0.0;
        }
        self.shared.timesync.lock().unwrap().committed_delta()
    }

    /// Sends an RPC and awaits the correlated response. No built-in
    /// timeout; callers wrap it when they need one.
    pub async fn send_rpc(&self, rpc_type: &str, body: Value) -> Result<Value, RpcError> {
        if self.shared.is_local {
            return self.shared.handlers.dispatch(rpc_type, body);
        }

        let (reply, response) = oneshot::channel();

        self.commands
            .send(Command::SendRpc { rpc_type: rpc_type.to_string(), body, reply })
            .map_err(|_| RpcError::PeerGone)?;

        response.await.map_err(|_| RpcError::PeerGone)?
    }

    pub fn destroy(&self, info: DestroyInfo) {
        if self.shared.is_local {
            log::warn!("refusing to destroy the local peer");
            return;
        }

        let _ = self.commands.send(Command::Destroy(info));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deleted_is_terminal() {
        for next in [PeerState::Connecting, PeerState::Connected, PeerState::Deleted] {
            assert!(!PeerState::Deleted.can_transition_to(next));
        }
    }

    #[test]
    fn transitions_only_move_forward() {
        assert!(PeerState::Connecting.can_transition_to(PeerState::Connected));
        assert!(PeerState::Connecting.can_transition_to(PeerState::Deleted));
        assert!(PeerState::Connected.can_transition_to(PeerState::Deleted));
        assert!(!PeerState::Connected.can_transition_to(PeerState::Connecting));
        assert!(!PeerState::Connecting.can_transition_to(PeerState::Connecting));
    }

    #[test]
    fn local_peer_is_synchronized_at_delta_zero() {
        let handlers = Arc::new(RpcHandlers::default());
        let descriptor = PeerDescriptor {
            uuid: Uuid::new_v4(),
            instance_uuid: Uuid::new_v4(),
            name: "local".into(),
            version: "0".into(),
            capacities: vec![],
        };

        let local = PeerHandle::new_local(descriptor, handlers);
        assert!(local.is_local());
        assert_eq!(local.state(), PeerState::Connected);
        assert!(local.is_time_synchronized());
        assert_eq!(local.committed_delta(), 0.0);

        let now = chorus_util::time::now();
        assert!((local.current_time(true) - now).abs() < 50.0);
    }

    #[tokio::test]
    async fn local_peer_dispatches_rpc_to_handlers() {
        let handlers = Arc::new(RpcHandlers::default());
        handlers.register("echo", |body| Ok(body));
        handlers.register("fail", |_| Err("nope".to_string()));

        let descriptor = PeerDescriptor {
            uuid: Uuid::new_v4(),
            instance_uuid: Uuid::new_v4(),
            name: "local".into(),
            version: "0".into(),
            capacities: vec![],
        };
        let local = PeerHandle::new_local(descriptor, handlers);

        let body = serde_json::json!({ "x": 1 });
        assert_eq!(local.send_rpc("echo", body.clone()).await.unwrap(), body);

        match local.send_rpc("fail", Value::Null).await {
            Err(RpcError::Rejected(text)) => assert_eq!(text, "nope"),
            other => panic!("unexpected {other:?}"),
        }

        assert!(matches!(
            local.send_rpc("missing", Value::Null).await,
            Err(RpcError::NoHandler(_))
        ));
    }
}
