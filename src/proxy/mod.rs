use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use russh::{
    Channel, ChannelId, ChannelMsg, CryptoVec, Disconnect, MethodKind, MethodSet, Pty, Sig,
    client,
    keys::PublicKey,
    server::{self, Auth, Handler, Msg, Session},
};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::{
    app_log::{AppLogSink, emit_app_log},
    backend::{BackendHandler, connect_backend},
    error::ProxyError,
    permissions::{Authenticator, Permissions},
    proxy::forwarding::{ChannelPairHandle, spawn_channel_pair},
};

pub(crate) mod forwarding;

/// Process-scoped SSH intercepting proxy.
///
/// One instance serves every inbound connection. The embedding process owns
/// the listener and hands each accepted TCP connection to
/// [`SshProxy::handle_connection`], which drives the connection through its
/// entire proxied lifetime.
pub struct SshProxy {
    server_config: Arc<server::Config>,
    authenticator: Arc<dyn Authenticator>,
    log_sink: Arc<dyn AppLogSink>,
}

impl SshProxy {
    pub fn new(
        server_config: Arc<server::Config>,
        authenticator: Arc<dyn Authenticator>,
        log_sink: Arc<dyn AppLogSink>,
    ) -> Self {
        SshProxy {
            server_config,
            authenticator,
            log_sink,
        }
    }

    /// Drive one accepted inbound TCP connection through handshake, backend
    /// dialing, bidirectional forwarding, and teardown. Returns once both
    /// SSH endpoints have terminated; every failure is terminal for the
    /// session and reported through tracing only.
    pub async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        tracing::info!(%peer, "SSH client connected.");

        let backend_terminated = CancellationToken::new();
        let handler = ServerHandler {
            server: Arc::clone(&self),
            peer,
            permissions: None,
            backend: None,
            channels: HashMap::new(),
            backend_terminated: backend_terminated.clone(),
        };

        let mut session =
            match server::run_stream(Arc::clone(&self.server_config), stream, handler).await {
                Ok(session) => session,
                Err(error) => {
                    tracing::warn!(%peer, %error, "Inbound SSH handshake failed.");
                    return;
                }
            };
        let handle = session.handle();

        tokio::select! {
            result = &mut session => {
                if let Err(error) = result {
                    tracing::debug!(%peer, %error, "Inbound SSH session ended with error.");
                }
            }
            () = backend_terminated.cancelled() => {
                // The backend endpoint went away first. Disconnect the
                // inbound endpoint, then wait for its transport to finish.
                let _ = handle
                    .disconnect(
                        Disconnect::ByApplication,
                        "backend connection closed".into(),
                        "".into(),
                    )
                    .await;
                if let Err(error) = session.await {
                    tracing::debug!(%peer, %error, "Inbound SSH session ended with error.");
                }
            }
        }

        // The handler's drop has initiated backend teardown; both endpoints
        // must have terminated before the connection is finished.
        backend_terminated.cancelled().await;
        tracing::info!(%peer, "SSH client disconnected.");
    }
}

// Per-connection state for the inbound endpoint.
pub(crate) struct ServerHandler {
    // Reference to the process-scoped proxy, for its collaborators.
    server: Arc<SshProxy>,
    // The IP and port of this connection.
    peer: SocketAddr,
    // Critical options produced by authentication.
    permissions: Option<Permissions>,
    // Outbound endpoint handle, present once the backend dial succeeded.
    backend: Option<client::Handle<BackendHandler>>,
    // Live channel pairs, keyed by the inbound channel id.
    channels: HashMap<ChannelId, ChannelPairHandle>,
    // Cancelled once the backend endpoint has terminated.
    backend_terminated: CancellationToken,
}

impl ServerHandler {
    // Relay a channel request that carries a reply. The pair mirrors the
    // backend's verdict back through the session handle once it arrives, so
    // this never blocks the connection's dispatch loop; requests that never
    // reach the backend are dropped without a reply.
    fn relay_channel_request(
        &self,
        channel: ChannelId,
        msg: ChannelMsg,
        session: &mut Session,
    ) -> Result<(), ProxyError> {
        match self.channels.get(&channel) {
            Some(pair) => pair.forward_request(msg),
            None => session.channel_failure(channel)?,
        }
        Ok(())
    }

    // Relay a reply-less channel message, if its pair is still around.
    fn relay_channel_message(&self, channel: ChannelId, msg: ChannelMsg) {
        if let Some(pair) = self.channels.get(&channel) {
            pair.forward(msg);
        }
    }
}

impl Handler for ServerHandler {
    type Error = ProxyError;

    async fn auth_none(&mut self, _user: &str) -> Result<Auth, Self::Error> {
        Ok(Auth::Reject {
            proceed_with_methods: Some(MethodSet::from(
                [MethodKind::PublicKey, MethodKind::Password].as_slice(),
            )),
            partial_success: false,
        })
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        match self
            .server
            .authenticator
            .authenticate_password(user, password)
            .await
        {
            Some(permissions) => {
                tracing::info!(peer = %self.peer, %user, "SSH client authenticated with password.");
                self.permissions = Some(permissions);
                Ok(Auth::Accept)
            }
            None => {
                tracing::warn!(peer = %self.peer, %user, "Failed password authentication.");
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                    partial_success: false,
                })
            }
        }
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        match self
            .server
            .authenticator
            .authenticate_public_key(user, public_key)
            .await
        {
            Some(permissions) => {
                tracing::info!(
                    peer = %self.peer, %user, "SSH client authenticated with public key."
                );
                self.permissions = Some(permissions);
                Ok(Auth::Accept)
            }
            None => {
                tracing::warn!(peer = %self.peer, %user, "Failed public key authentication.");
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                    partial_success: false,
                })
            }
        }
    }

    // Authentication carries the backend descriptor, so the outbound dial
    // happens here. Failure closes the inbound connection; nothing is
    // retried.
    async fn auth_succeeded(&mut self, session: &mut Session) -> Result<(), Self::Error> {
        // Every accepting auth callback stores permissions first; a missing
        // value means the handshake was accepted without the authenticator,
        // and such a session must not proceed to a backend dial.
        let permissions = self
            .permissions
            .as_ref()
            .ok_or(ProxyError::InvalidPermissions)?;
        let backend = match connect_backend(
            permissions,
            session.handle(),
            self.backend_terminated.clone(),
        )
        .await
        {
            Ok(backend) => backend,
            Err(error) => {
                tracing::warn!(peer = %self.peer, %error, "Backend connection failed.");
                return Err(error);
            }
        };
        emit_app_log(permissions, self.server.log_sink.as_ref());
        self.backend = Some(backend);
        Ok(())
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(backend) = self.backend.as_mut() else {
            return Err(russh::Error::Disconnect.into());
        };
        tracing::debug!(peer = %self.peer, channel = ?channel.id(), "New session channel.");
        match backend.channel_open_session().await {
            Ok(backend_channel) => {
                let id = channel.id();
                let pair = spawn_channel_pair(channel, session.handle(), backend_channel);
                self.channels.insert(id, pair);
                Ok(true)
            }
            Err(russh::Error::ChannelOpenFailure(reason)) => {
                tracing::warn!(
                    peer = %self.peer, ?reason, "Backend rejected session channel open."
                );
                Ok(false)
            }
            Err(error) => {
                tracing::warn!(
                    peer = %self.peer, %error, "Opening session channel on backend failed."
                );
                Ok(false)
            }
        }
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(backend) = self.backend.as_mut() else {
            return Err(russh::Error::Disconnect.into());
        };
        tracing::debug!(
            peer = %self.peer,
            host = host_to_connect,
            port = port_to_connect,
            "New direct-tcpip channel."
        );
        match backend
            .channel_open_direct_tcpip(
                host_to_connect,
                port_to_connect,
                originator_address,
                originator_port,
            )
            .await
        {
            Ok(backend_channel) => {
                let id = channel.id();
                let pair = spawn_channel_pair(channel, session.handle(), backend_channel);
                self.channels.insert(id, pair);
                Ok(true)
            }
            Err(russh::Error::ChannelOpenFailure(reason)) => {
                tracing::warn!(
                    peer = %self.peer, ?reason, "Backend rejected direct-tcpip channel open."
                );
                Ok(false)
            }
            Err(error) => {
                tracing::warn!(
                    peer = %self.peer, %error, "Opening direct-tcpip channel on backend failed."
                );
                Ok(false)
            }
        }
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.relay_channel_message(
            channel,
            ChannelMsg::Data {
                data: CryptoVec::from_slice(data),
            },
        );
        Ok(())
    }

    async fn extended_data(
        &mut self,
        channel: ChannelId,
        code: u32,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.relay_channel_message(
            channel,
            ChannelMsg::ExtendedData {
                ext: code,
                data: CryptoVec::from_slice(data),
            },
        );
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.relay_channel_message(channel, ChannelMsg::Eof);
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        // Dropping the pair handle closes the backend side.
        self.channels.remove(&channel);
        Ok(())
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!(peer = %self.peer, channel = ?channel, term, "Relaying pty request.");
        let msg = ChannelMsg::RequestPty {
            want_reply: true,
            term: term.into(),
            col_width,
            row_height,
            pix_width,
            pix_height,
            terminal_modes: modes.to_vec(),
        };
        self.relay_channel_request(channel, msg, session)
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!(peer = %self.peer, channel = ?channel, "Relaying shell request.");
        let msg = ChannelMsg::RequestShell { want_reply: true };
        self.relay_channel_request(channel, msg, session)
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!(peer = %self.peer, channel = ?channel, "Relaying exec request.");
        let msg = ChannelMsg::Exec {
            want_reply: true,
            command: data.to_vec(),
        };
        self.relay_channel_request(channel, msg, session)
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!(peer = %self.peer, channel = ?channel, name, "Relaying subsystem request.");
        let msg = ChannelMsg::RequestSubsystem {
            want_reply: true,
            name: name.into(),
        };
        self.relay_channel_request(channel, msg, session)
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let msg = ChannelMsg::SetEnv {
            want_reply: true,
            variable_name: variable_name.into(),
            variable_value: variable_value.into(),
        };
        self.relay_channel_request(channel, msg, session)
    }

    async fn x11_request(
        &mut self,
        channel: ChannelId,
        single_connection: bool,
        x11_auth_protocol: &str,
        x11_auth_cookie: &str,
        x11_screen_number: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let msg = ChannelMsg::RequestX11 {
            want_reply: true,
            single_connection,
            x11_authentication_protocol: x11_auth_protocol.into(),
            x11_authentication_cookie: x11_auth_cookie.into(),
            x11_screen_number,
        };
        self.relay_channel_request(channel, msg, session)
    }

    // window-change and signal requests never carry replies.
    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.relay_channel_message(
            channel,
            ChannelMsg::WindowChange {
                col_width,
                row_height,
                pix_width,
                pix_height,
            },
        );
        session.channel_success(channel)?;
        Ok(())
    }

    async fn signal(
        &mut self,
        channel: ChannelId,
        signal: Sig,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.relay_channel_message(channel, ChannelMsg::Signal { signal });
        Ok(())
    }

    // The stack emits the global-request reply from this return value (there
    // is no deferred reply surface on the session handle), so the backend's
    // verdict has to be awaited here. This holds up the connection's
    // dispatch loop for one backend round trip.
    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(backend) = self.backend.as_mut() else {
            return Ok(false);
        };
        tracing::debug!(
            peer = %self.peer, address, port = *port, "Relaying tcpip-forward request."
        );
        match backend.tcpip_forward(address, *port).await {
            Ok(bound_port) => {
                if *port == 0 {
                    *port = bound_port;
                }
                Ok(true)
            }
            Err(error) => {
                tracing::warn!(peer = %self.peer, %error, "Backend refused tcpip-forward.");
                Ok(false)
            }
        }
    }

    // Same reply constraint as tcpip_forward above.
    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(backend) = self.backend.as_mut() else {
            return Ok(false);
        };
        tracing::debug!(
            peer = %self.peer, address, port, "Relaying cancel-tcpip-forward request."
        );
        match backend.cancel_tcpip_forward(address, port).await {
            Ok(()) => Ok(true),
            Err(error) => {
                tracing::warn!(peer = %self.peer, %error, "Backend refused cancel-tcpip-forward.");
                Ok(false)
            }
        }
    }
}

// Tear down everything this connection owns: channel pairs die with the map,
// and the outbound endpoint gets a disconnect. When no backend was ever
// established, its termination is reported immediately so the supervisor is
// not left waiting.
impl Drop for ServerHandler {
    fn drop(&mut self) {
        self.channels.clear();
        match self.backend.take() {
            Some(backend) => {
                tokio::spawn(async move {
                    let _ = backend
                        .disconnect(Disconnect::ByApplication, "session ended", "")
                        .await;
                });
            }
            None => self.backend_terminated.cancel(),
        }
    }
}
