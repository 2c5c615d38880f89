use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use chorus_core::timesync::{
    TIMEKEEP_REFRESH_INTERVAL_MS, TIMESYNC_INIT_REQUEST_COUNT, TIMESYNC_INIT_REQUEST_INTERVAL_MS,
};
use chorus_protocol::control::{ControlMessage, RpcEnvelope};

use super::manager::{PeerManager, Resolution};
use super::{DestroyInfo, MessageTransport, PeerEvent, PeerShared, PeerState, RpcError, RpcHandlers};

pub(crate) enum Command {
    SendRpc {
        rpc_type: String,
        body: Value,
        reply: oneshot::Sender<Result<Value, RpcError>>,
    },
    Destroy(DestroyInfo),
}

/// Task behind one remote peer. Owns the transport, correlates RPC
/// traffic, reflects and consumes timekeep probes, and enforces the
/// no-response watchdog. All handling for a given peer runs here, one
/// message at a time.
pub(crate) struct PeerLink {
    pub(crate) state: LinkState,
    pub(crate) inbound: mpsc::UnboundedReceiver<ControlMessage>,
    pub(crate) commands: mpsc::UnboundedReceiver<Command>,
    pub(crate) no_response_timeout: Duration,
}

pub(crate) struct LinkState {
    pub(crate) shared: Arc<PeerShared>,
    pub(crate) manager: Arc<PeerManager>,
    pub(crate) transport: Box<dyn MessageTransport>,
    pub(crate) handlers: Arc<RpcHandlers>,
    pub(crate) conn_key: Uuid,
    pub(crate) pending: HashMap<Uuid, oneshot::Sender<Result<Value, RpcError>>>,
    pub(crate) init_probes_left: usize,
}

impl PeerLink {
    pub(crate) async fn run(self) {
        let PeerLink { mut state, mut inbound, mut commands, no_response_timeout } = self;

        let mut deadline = Instant::now() + no_response_timeout;

        let mut refresh = tokio::time::interval(Duration::from_millis(TIMEKEEP_REFRESH_INTERVAL_MS));
        refresh.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut burst = tokio::time::interval(Duration::from_millis(TIMESYNC_INIT_REQUEST_INTERVAL_MS));
        burst.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let (info, send_disconnect) = loop {
            tokio::select! {
                message = inbound.recv() => match message {
                    Some(message) => {
                        // any traffic proves the peer alive
                        deadline = Instant::now() + no_response_timeout;

                        if let Some(info) = state.on_message(message) {
                            break (info, false);
                        }
                    }
                    None => {
                        log::debug!("transport dropped for peer {:?}", state.stable_uuid());
                        break (DestroyInfo { can_try_reconnect: true, ..Default::default() }, false);
                    }
                },

                command = commands.recv() => match command {
                    Some(Command::SendRpc { rpc_type, body, reply }) => {
                        state.on_send_rpc(rpc_type, body, reply);
                    }
                    Some(Command::Destroy(info)) => break (info, true),
                    None => break (DestroyInfo::default(), true),
                },

                _ = tokio::time::sleep_until(deadline) => {
                    log::warn!("peer {:?} timed out without traffic", state.stable_uuid());
                    break (DestroyInfo { can_try_reconnect: true, ..Default::default() }, false);
                }

                _ = refresh.tick() => state.send_timekeep(),

                _ = burst.tick(), if state.init_probes_left > 0 => {
                    state.init_probes_left -= 1;
                    state.send_timekeep();
                }
            }
        };

        state.finish(info, send_disconnect);
    }
}

impl LinkState {
    fn stable_uuid(&self) -> Option<Uuid> {
        self.shared.descriptor.lock().unwrap().as_ref().map(|d| d.uuid)
    }

    fn send(&self, message: &ControlMessage) {
        if let Err(e) = self.transport.send(message) {
            log::warn!("sending to peer {:?}: {e}", self.stable_uuid());
        }
    }

    fn send_timekeep(&self) {
        self.send(&ControlMessage::TimekeepRequest { sent_at: chorus_util::time::now() });
    }

    /// Handles one inbound message; returns destroy info to tear the
    /// link down.
    fn on_message(&mut self, message: ControlMessage) -> Option<DestroyInfo> {
        let outcome = match &message {
            ControlMessage::TimekeepRequest { sent_at } => {
                self.send(&ControlMessage::TimekeepResponse {
                    sent_at: *sent_at,
                    responded_at: chorus_util::time::now(),
                });
                None
            }

            ControlMessage::TimekeepResponse { sent_at, responded_at } => {
                self.on_timekeep_response(*sent_at, *responded_at);
                None
            }

            ControlMessage::PeerInfo { peer, .. } => self.on_peer_info(peer.clone()),

            ControlMessage::Disconnect => Some(DestroyInfo::default()),

            ControlMessage::Rpc(envelope) => {
                self.on_rpc(envelope.clone());
                None
            }
        };

        if outcome.is_none() {
            if let Some(uuid) = self.stable_uuid() {
                self.manager.emit_controller_message(uuid, message);
            }
        }

        outcome
    }

    fn on_timekeep_response(&mut self, sent_at: f64, responded_at: f64) {
        let received_at = chorus_util::time::now();

        let update = {
            let mut timesync = self.shared.timesync.lock().unwrap();
            timesync.record_probe(sent_at, responded_at, received_at)
        };

        if let Some(delta) = update {
            log::debug!("peer {:?} time delta now {delta:.1}ms", self.stable_uuid());
            self.shared.emit(PeerEvent::TimedeltaUpdated(delta));
        }

        self.shared.emit(PeerEvent::TimesyncStateUpdated);
    }

    fn on_peer_info(&mut self, descriptor: chorus_protocol::control::PeerDescriptor) -> Option<DestroyInfo> {
        match self.manager.resolve_peer_info(self.conn_key, &descriptor) {
            Resolution::DropNewcomer => {
                log::debug!("duplicate connection for peer {}, dropping", descriptor.uuid);
                Some(DestroyInfo::default())
            }
            Resolution::Promote { is_new } => {
                let uuid = descriptor.uuid;
                *self.shared.descriptor.lock().unwrap() = Some(descriptor);

                if self.shared.set_state(PeerState::Connected) {
                    // probe burst to populate the delta window quickly
                    self.init_probes_left = TIMESYNC_INIT_REQUEST_COUNT;
                    self.manager.notify_connected(uuid, is_new);
                }

                None
            }
        }
    }

    fn on_rpc(&mut self, envelope: RpcEnvelope) {
        if envelope.is_response {
            match self.pending.remove(&envelope.uuid) {
                Some(slot) => {
                    let result = if envelope.is_error {
                        Err(RpcError::Rejected(text_of(&envelope.body)))
                    } else {
                        Ok(envelope.body)
                    };
                    let _ = slot.send(result);
                }
                None => {
                    log::debug!("dropping rpc response with unknown uuid {}", envelope.uuid);
                }
            }
            return;
        }

        let response = match self.handlers.dispatch(&envelope.rpc_type, envelope.body) {
            Ok(body) => RpcEnvelope {
                uuid: envelope.uuid,
                rpc_type: envelope.rpc_type,
                is_response: true,
                is_error: false,
                body,
            },
            Err(error) => RpcEnvelope {
                uuid: envelope.uuid,
                rpc_type: envelope.rpc_type,
                is_response: true,
                is_error: true,
                body: Value::String(error.to_string()),
            },
        };

        self.send(&ControlMessage::Rpc(response));
    }

    fn on_send_rpc(&mut self, rpc_type: String, body: Value, reply: oneshot::Sender<Result<Value, RpcError>>) {
        let uuid = Uuid::new_v4();

        let envelope = RpcEnvelope {
            uuid,
            rpc_type,
            is_response: false,
            is_error: false,
            body,
        };

        match self.transport.send(&ControlMessage::Rpc(envelope)) {
            Ok(()) => {
                self.pending.insert(uuid, reply);
            }
            Err(_) => {
                let _ = reply.send(Err(RpcError::Transport));
            }
        }
    }

    fn finish(self, info: DestroyInfo, send_disconnect: bool) {
        if send_disconnect {
            let _ = self.transport.send(&ControlMessage::Disconnect);
        }

        // leaving Connected invalidates the delta window
        self.shared.timesync.lock().unwrap().flush();

        self.shared.set_state(PeerState::Deleted);
        self.shared.emit(PeerEvent::Destroyed(info));

        self.transport.close();
        self.manager.unregister(self.conn_key, info);

        // dropping `pending` leaves in-flight rpcs unresolved; callers
        // observe the state change instead
    }
}

fn text_of(body: &Value) -> String {
    match body {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
