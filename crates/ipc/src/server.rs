//! The IPC server.
//!
//! Listens on `.s.PGWARD_CMD.<wd_port>` in the configured socket
//! directory. Requests are dispatched into the watchdog through a client
//! handle; sockets registered for notifications receive every cluster
//! event the state machine publishes.

use std::path::PathBuf;
use std::sync::Arc;

use flume as chan;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::select;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pgward_types::ipc::{
    FailoverIndicationRequest, FailoverIpcRequest, IpcCommandType, IpcResponse,
    NodeStatusChangeRequest, NodesListResponse, OnlineRecoveryRequest, RuntimeVariableRequest,
};
use pgward_types::ipc::IpcCredentials;
use pgward_types::messages::MAX_PAYLOAD_LEN;
use pgward_watchdog::client::handle::Handle;
use pgward_watchdog::fsm::event::Event;

use crate::auth::authenticate;
use crate::Error;

/// IPC server configuration.
#[derive(Debug, Clone)]
pub struct IpcConfig {
    /// Directory the command socket is created in.
    pub socket_dir: PathBuf,
    /// The local watchdog port; part of the socket name.
    pub wd_port: u16,
    /// Key accepted from external clients, when configured.
    pub auth_key: Option<String>,
    /// Process shared key demanded from internal clients.
    pub shared_key: u32,
}

impl IpcConfig {
    /// Path of the command socket.
    pub fn socket_path(&self) -> PathBuf {
        self.socket_dir.join(format!(".s.PGWARD_CMD.{}", self.wd_port))
    }
}

/// Watchdog clients registered for notifications.
type NotifyList = Arc<Mutex<Vec<OwnedWriteHalf>>>;

/// The IPC server.
pub struct IpcServer<H> {
    config: Arc<IpcConfig>,
    handle: H,
    events: chan::Receiver<Event>,
}

impl<H: Handle + 'static> IpcServer<H> {
    pub fn new(config: IpcConfig, handle: H, events: chan::Receiver<Event>) -> Self {
        Self {
            config: Arc::new(config),
            handle,
            events,
        }
    }

    /// Run the server until cancelled. The socket file is unlinked before
    /// binding (a crashed predecessor may have left one behind) and again
    /// on clean exit.
    pub async fn run(self, cancellation: CancellationToken) -> Result<(), Error> {
        let path = self.config.socket_path();

        std::fs::remove_file(&path).ok();
        let listener = UnixListener::bind(&path)?;
        info!(target: "ipc", "listening for IPC commands on {}", path.display());

        let notify: NotifyList = Arc::new(Mutex::new(Vec::new()));

        loop {
            select! {
                _ = cancellation.cancelled() => break,
                event = self.events.recv_async() => {
                    match event {
                        Ok(event) => {
                            debug!(target: "ipc", "pushing notification: {}", event);
                            push_notification(&notify, &event).await;
                        }
                        // The state machine is gone; nothing more to push.
                        Err(_) => break,
                    }
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            let handle = self.handle.clone();
                            let config = self.config.clone();
                            let notify = notify.clone();

                            tokio::spawn(async move {
                                serve_client(stream, handle, config, notify).await;
                            });
                        }
                        Err(err) => warn!(target: "ipc", "accept error: {}", err),
                    }
                }
            }
        }

        std::fs::remove_file(&path).ok();
        Ok(())
    }
}

/// Forward one event to every registered socket, dropping the dead ones.
async fn push_notification(notify: &NotifyList, event: &Event) {
    let frame = IpcResponse::ok(&event_body(event)).encode();
    let mut list = notify.lock().await;
    let mut index = 0;

    while index < list.len() {
        if list[index].write_all(&frame).await.is_err() {
            list.remove(index);
        } else {
            index += 1;
        }
    }
}

/// The JSON body a cluster event travels as.
fn event_body(event: &Event) -> serde_json::Value {
    match event {
        Event::Initializing => serde_json::json!({ "Notification": "Initializing" }),
        Event::StateChanged { old, new } => serde_json::json!({
            "Notification": "StateChanged",
            "OldState": old,
            "NewState": new,
        }),
        Event::QuorumChanged { status } => serde_json::json!({
            "Notification": "QuorumChanged",
            "QuorumStatus": status,
        }),
        Event::EscalationChanged { escalated } => serde_json::json!({
            "Notification": "EscalationChanged",
            "Escalated": escalated,
        }),
        Event::NodeLost { node, name } => serde_json::json!({
            "Notification": "NodeLost",
            "NodeID": node,
            "NodeName": name,
        }),
        Event::NodeFound { node, name } => serde_json::json!({
            "Notification": "NodeFound",
            "NodeID": node,
            "NodeName": name,
        }),
        Event::SplitBrainDetected { node } => serde_json::json!({
            "Notification": "SplitBrainDetected",
            "NodeID": node,
        }),
        Event::SyncBackendStates => serde_json::json!({ "Notification": "SyncBackendStates" }),
        Event::InformQuarantinedNodes => {
            serde_json::json!({ "Notification": "InformQuarantinedNodes" })
        }
        Event::ExecuteFailover {
            kind,
            node_ids,
            flags,
        } => serde_json::json!({
            "Notification": "ExecuteFailover",
            "Kind": kind,
            "NodeIdList": node_ids,
            "Flags": flags,
        }),
        Event::Fatal { reason } => serde_json::json!({
            "Notification": "Fatal",
            "Reason": reason,
        }),
    }
}

/// Serve one client connection until it closes or registers for
/// notifications.
async fn serve_client<H: Handle>(
    stream: UnixStream,
    handle: H,
    config: Arc<IpcConfig>,
    notify: NotifyList,
) {
    let (mut reader, mut writer) = stream.into_split();

    loop {
        let (ty_byte, payload) = match read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(err) => {
                debug!(target: "ipc", "client read error: {}", err);
                return;
            }
        };

        let Some(ty) = IpcCommandType::from_byte(ty_byte) else {
            let response = IpcResponse::bad("unknown IPC command type");
            if writer.write_all(&response.encode()).await.is_err() {
                return;
            }
            continue;
        };

        let credentials: IpcCredentials = serde_json::from_slice(&payload).unwrap_or_default();
        if let Err(message) = authenticate(
            ty,
            &credentials,
            config.shared_key,
            config.auth_key.as_deref(),
        ) {
            warn!(target: "ipc", "authentication failed for {:?} command", ty);
            let response = IpcResponse::bad(message);
            if writer.write_all(&response.encode()).await.is_err() {
                return;
            }
            continue;
        }

        if ty == IpcCommandType::RegisterForNotification {
            let response = IpcResponse::ok(&serde_json::json!({}));
            if writer.write_all(&response.encode()).await.is_err() {
                return;
            }
            // The socket now belongs to the notification list.
            notify.lock().await.push(writer);
            return;
        }

        let response = process_request(ty, &payload, &handle).await;
        if writer.write_all(&response.encode()).await.is_err() {
            return;
        }
    }
}

/// Read one IPC frame, `Ok(None)` on a clean end of stream.
async fn read_frame(reader: &mut OwnedReadHalf) -> std::io::Result<Option<(u8, Vec<u8>)>> {
    let mut header = [0u8; 5];

    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }

    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if len > MAX_PAYLOAD_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "oversized ipc payload",
        ));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some((header[0], payload)))
}

/// Dispatch one authenticated request into the watchdog.
async fn process_request<H: Handle>(ty: IpcCommandType, payload: &[u8], handle: &H) -> IpcResponse {
    match ty {
        IpcCommandType::NodeStatusChange => {
            let request: NodeStatusChangeRequest = match serde_json::from_slice(payload) {
                Ok(request) => request,
                Err(err) => return IpcResponse::bad(format!("invalid request: {}", err)),
            };

            if let Some(message) = &request.message {
                info!(target: "ipc", "node status change: {}", message);
            }
            match handle
                .node_status_change(request.node_id, request.status)
                .await
            {
                Ok(()) => IpcResponse::ok(&serde_json::json!({})),
                Err(err) => IpcResponse::bad(err.to_string()),
            }
        }
        IpcCommandType::GetNodesList => match handle.nodes_list().await {
            Ok(response) => IpcResponse::ok::<NodesListResponse>(&response),
            Err(err) => IpcResponse::bad(err.to_string()),
        },
        IpcCommandType::GetRuntimeVariable => {
            let request: RuntimeVariableRequest = match serde_json::from_slice(payload) {
                Ok(request) => request,
                Err(err) => return IpcResponse::bad(format!("invalid request: {}", err)),
            };

            match handle.runtime_variable(request.name).await {
                Ok(value) => IpcResponse::ok(&serde_json::json!({ "ValueData": value })),
                Err(err) => IpcResponse::bad(err.to_string()),
            }
        }
        IpcCommandType::FailoverCommand => {
            let request: FailoverIpcRequest = match serde_json::from_slice(payload) {
                Ok(request) => request,
                Err(err) => return IpcResponse::bad(format!("invalid request: {}", err)),
            };

            match handle
                .failover(request.kind, request.node_ids, request.flags)
                .await
            {
                Ok(response) => response,
                Err(err) => IpcResponse::bad(err.to_string()),
            }
        }
        IpcCommandType::OnlineRecoveryCommand => {
            let request: OnlineRecoveryRequest = match serde_json::from_slice(payload) {
                Ok(request) => request,
                Err(err) => return IpcResponse::bad(format!("invalid request: {}", err)),
            };

            match handle.online_recovery(request.phase, request.node_id).await {
                Ok(response) => response,
                Err(err) => IpcResponse::bad(err.to_string()),
            }
        }
        IpcCommandType::FailoverIndication => {
            let request: FailoverIndicationRequest = match serde_json::from_slice(payload) {
                Ok(request) => request,
                Err(err) => return IpcResponse::bad(format!("invalid request: {}", err)),
            };

            match handle
                .failover_indication(request.phase, request.primary_quarantined)
                .await
            {
                Ok(()) => IpcResponse::ok(&serde_json::json!({})),
                Err(err) => IpcResponse::bad(err.to_string()),
            }
        }
        IpcCommandType::GetMasterData => match handle.master_data().await {
            Ok(response) => response,
            Err(err) => IpcResponse::bad(err.to_string()),
        },
        IpcCommandType::RegisterForNotification => {
            // Handled by the connection loop before dispatch.
            IpcResponse::bad("unexpected command")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgward_types::consensus::{FailoverKind, FailoverResult};
    use pgward_types::ipc::FailoverIpcResponse;
    use pgward_watchdog::client::handle::MockHandle;

    #[tokio::test]
    async fn failover_request_reaches_the_handle() {
        let mut handle = MockHandle::new();
        handle
            .expect_failover()
            .withf(|kind, node_ids, flags| {
                *kind == FailoverKind::NodeDown && node_ids == &[0] && *flags == 0
            })
            .returning(|_, _, _| {
                Ok(IpcResponse::ok(&FailoverIpcResponse {
                    result: FailoverResult::Proceed,
                }))
            });

        let payload = serde_json::to_vec(&serde_json::json!({
            "Kind": "NodeDown",
            "NodeIdList": [0],
            "Flags": 0,
        }))
        .unwrap();
        let response =
            process_request(IpcCommandType::FailoverCommand, &payload, &handle).await;

        assert_eq!(response.ty, pgward_types::ipc::IpcResultType::Ok);
    }

    #[tokio::test]
    async fn malformed_request_is_a_bad_result() {
        let handle = MockHandle::new();
        let response =
            process_request(IpcCommandType::FailoverCommand, b"not json", &handle).await;

        assert_eq!(response.ty, pgward_types::ipc::IpcResultType::Bad);
    }
}
