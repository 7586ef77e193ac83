use super::connection::{ConnState, VncConnection};
use super::registry::{Control, RegistryEntry};
use super::{apply_permissions, ServerState};
use crate::desktop::{AccessRights, DatagramSink, PixelBuffer, QueryResult};
use crate::server::params::ClientParams;
use crate::server::writer::UpdateWriter;
use crate::{VncError, VncVersion};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tracing::*;

const SECURITY_TYPE_NONE: u8 = 1;
const SECURITY_RESULT_OK: u32 = 0;
const SECURITY_RESULT_FAILED: u32 = 1;

/// A client on its way through the handshake
pub struct ClientHandshake<S> {
    stream: S,
    server: Arc<ServerState>,
    peer: String,
    user: Option<String>,
    version: VncVersion,
    access: AccessRights,
    datagram: Option<Box<dyn DatagramSink>>,
    entry: RegistryEntry,
    control: UnboundedReceiver<Control>,
}

impl<S> ClientHandshake<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Refuse the client, telling it why if the protocol version allows
    async fn reject(mut self, reason: &str) -> Result<VncState<S>, VncError> {
        info!("Rejecting connection from {}: {}", self.peer, reason);
        if self.version >= VncVersion::RFB38 {
            self.stream.write_u32(SECURITY_RESULT_FAILED).await?;
            write_reason(&mut self.stream, reason).await?;
            self.stream.flush().await?;
        }
        Err(VncError::PermissionDenied(reason.to_string()))
    }

    /// Wait for [`VncServer::approve_connection`](crate::VncServer::approve_connection)
    async fn wait_for_approval(&mut self) -> Result<(bool, String), VncError> {
        loop {
            match self.control.recv().await {
                Some(Control::Approve { accept, reason }) => return Ok((accept, reason)),
                Some(Control::Close(reason)) => return Ok((false, reason)),
                Some(other) => trace!("Ignoring {:?} while querying", other),
                None => {
                    return Err(VncError::ConnectionClosed(
                        "server shut down while querying".to_string(),
                    ))
                }
            }
        }
    }
}

async fn write_reason<S>(stream: &mut S, reason: &str) -> Result<(), VncError>
where
    S: AsyncWrite + Unpin,
{
    stream.write_u32(reason.len() as u32).await?;
    stream.write_all(reason.as_bytes()).await?;
    Ok(())
}

/// The identity a transport put in front of the host: `user@host:port`
fn identity(peer: &str) -> Option<String> {
    match peer.rsplit_once('@') {
        Some((user, _)) if !user.is_empty() => Some(user.to_string()),
        _ => None,
    }
}

pub enum VncState<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    Handshake(ClientHandshake<S>),
    Authenticate(ClientHandshake<S>),
    Query(ClientHandshake<S>),
    Initialise(ClientHandshake<S>),
    Connected(VncConnection<S>),
}

impl<S> VncState<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn try_start(self) -> Pin<Box<dyn Future<Output = Result<Self, VncError>> + Send>> {
        Box::pin(async move {
            match self {
                VncState::Handshake(mut hs) => {
                    VncVersion::RFB38.write(&mut hs.stream).await?;
                    hs.stream.flush().await?;
                    // the client picks, anything we do not know is 3.3
                    hs.version = VncVersion::read(&mut hs.stream).await?;
                    debug!("Client {} speaks {:?}", hs.peer, hs.version);
                    VncState::Authenticate(hs).try_start().await
                }
                VncState::Authenticate(mut hs) => {
                    // +--------------+--------------+-----------------------+
                    // | No. of bytes | Type [Value] | Description           |
                    // +--------------+--------------+-----------------------+
                    // | 1            | U8           | number-of-security-   |
                    // |              |              | types                 |
                    // | number-of-   | U8 array     | security-types        |
                    // | security-    |              |                       |
                    // | types        |              |                       |
                    // +--------------+--------------+-----------------------+
                    if hs.version == VncVersion::RFB33 {
                        hs.stream.write_u32(SECURITY_TYPE_NONE as u32).await?;
                        hs.stream.flush().await?;
                    } else {
                        hs.stream.write_all(&[1, SECURITY_TYPE_NONE]).await?;
                        hs.stream.flush().await?;
                        let choice = hs.stream.read_u8().await?;
                        if choice != SECURITY_TYPE_NONE {
                            let reason = format!("Security type {} not offered", choice);
                            return hs.reject(&reason).await;
                        }
                    }
                    trace!("No auth needed");

                    hs.user = identity(&hs.peer);
                    if let Some(perms) = hs.server.lookup_permissions(hs.user.as_deref()) {
                        apply_permissions(&mut hs.access, perms);
                    } else {
                        info!(
                            "User {:?} unknown to the permission store, no view or write access",
                            hs.user
                        );
                        hs.access.remove(AccessRights::WRITER | AccessRights::VIEW);
                    }
                    VncState::Query(hs).try_start().await
                }
                VncState::Query(mut hs) => {
                    let config = &hs.server.config;
                    if config.never_shared
                        && !config.disconnect_clients
                        && hs.server.registry.authenticated_count() > 0
                    {
                        return hs.reject("The server is already in use").await;
                    }

                    if config.query_connect && !hs.access.contains(AccessRights::NO_QUERY) {
                        let decision = hs
                            .server
                            .desktop
                            .query_connection(&hs.peer, hs.user.as_deref());
                        let (accept, reason) = match decision {
                            QueryResult::Accept => (true, String::new()),
                            QueryResult::Reject(reason) => (false, reason),
                            QueryResult::Pending => {
                                debug!("Waiting for the connection from {} to be approved", hs.peer);
                                hs.wait_for_approval().await?
                            }
                        };
                        if !accept {
                            let reason = if reason.is_empty() {
                                "Connection rejected".to_string()
                            } else {
                                reason
                            };
                            return hs.reject(&reason).await;
                        }
                    }

                    if hs.version >= VncVersion::RFB38 {
                        hs.stream.write_u32(SECURITY_RESULT_OK).await?;
                        hs.stream.flush().await?;
                    }
                    info!("Client {} authenticated as {:?}", hs.peer, hs.user);
                    VncState::Initialise(hs).try_start().await
                }
                VncState::Initialise(mut hs) => {
                    // +--------------+--------------+-------------+
                    // | No. of bytes | Type [Value] | Description |
                    // +--------------+--------------+-------------+
                    // | 1            | U8           | shared-flag |
                    // +--------------+--------------+-------------+
                    let config = &hs.server.config;
                    let mut shared = hs.stream.read_u8().await? != 0;
                    if config.always_shared || !hs.access.contains(AccessRights::NON_SHARED) {
                        shared = true;
                    }
                    if config.never_shared {
                        shared = false;
                    }

                    let registry = &hs.server.registry;
                    if !shared {
                        if config.disconnect_clients {
                            registry.close_clients("Non-shared connection requested", Some(hs.entry.id()));
                        } else if registry.authenticated_count() > 0 {
                            return Err(VncError::PermissionDenied(
                                "The server is already in use".to_string(),
                            ));
                        }
                    }
                    hs.entry.authenticated(hs.user.as_deref(), shared);

                    // changes after this point reach the client as events
                    let events = hs.server.events.subscribe();
                    let cp = {
                        let frame = hs.server.frame();
                        let mut cp = ClientParams::new(
                            frame.pb.width(),
                            frame.pb.height(),
                            frame.layout.clone(),
                            *frame.pb.format(),
                            &frame.name,
                        );
                        cp.set_cursor_pos(frame.cursor_pos);
                        cp.set_led_state(frame.led_state);
                        cp
                    };
                    let mut writer = UpdateWriter::new();
                    writer.set_datagram(hs.datagram.take());
                    writer.write_server_init(&cp);

                    Ok(VncState::Connected(VncConnection::new(
                        hs.stream,
                        hs.server,
                        hs.entry,
                        hs.control,
                        events,
                        hs.peer,
                        hs.user,
                        hs.access,
                        cp,
                        writer,
                    )))
                }
                connected @ VncState::Connected(_) => Ok(connected),
            }
        })
    }

    /// Where the client is in its life cycle
    pub fn conn_state(&self) -> ConnState {
        match self {
            VncState::Handshake(_) => ConnState::Handshaking,
            VncState::Authenticate(_) => ConnState::Authenticating,
            VncState::Query(_) => ConnState::Querying,
            VncState::Initialise(_) => ConnState::Initialising,
            VncState::Connected(conn) => conn.state(),
        }
    }

    pub fn finish(self) -> Result<VncConnection<S>, VncError> {
        if let VncState::Connected(conn) = self {
            Ok(conn)
        } else {
            Err(VncError::ConnectionClosed(
                "handshake did not complete".to_string(),
            ))
        }
    }
}

/// Builder for the server side of one connection
pub struct VncConnector<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream: S,
    server: Arc<ServerState>,
    peer: String,
    access: AccessRights,
    datagram: Option<Box<dyn DatagramSink>>,
}

impl<S> VncConnector<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(stream: S, server: Arc<ServerState>) -> Self {
        Self {
            stream,
            server,
            peer: "unknown".to_string(),
            access: AccessRights::DEFAULT,
            datagram: None,
        }
    }

    /// Remote endpoint, `user@host:port` when the transport knows the user
    pub fn set_peer(mut self, peer: &str) -> Self {
        self.peer = peer.to_string();
        self
    }

    /// Rights before the permission store is consulted
    pub fn set_access_rights(mut self, access: AccessRights) -> Self {
        self.access = access;
        self
    }

    /// Side channel for pixel data, used if the client asks for it
    pub fn set_datagram(mut self, datagram: Option<Box<dyn DatagramSink>>) -> Self {
        self.datagram = datagram;
        self
    }

    /// Register the client; the handshake starts with [`VncState::try_start`]
    pub fn build(self) -> Result<VncState<S>, VncError> {
        let (tx, control) = unbounded_channel();
        let entry = self.server.registry.register(&self.peer, tx);
        Ok(VncState::Handshake(ClientHandshake {
            stream: self.stream,
            server: self.server,
            peer: self.peer,
            user: None,
            version: VncVersion::RFB33,
            access: self.access,
            datagram: self.datagram,
            entry,
            control,
        }))
    }
}
