use std::sync::Arc;

use russh::{
    Channel,
    client::{self, Msg, Session},
    keys::{PrivateKey, PrivateKeyWithHashAlg, PublicKey, decode_secret_key},
};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::{
    error::ProxyError,
    fingerprints::verify_host_key,
    permissions::PermissionsReader,
    target::{TargetConfig, resolve_target},
};

/// russh handler for the outbound endpoint of a proxied session.
///
/// Checks the backend's host key against the session's expected fingerprint
/// and bridges backend-initiated channels back onto the inbound endpoint.
/// Its drop doubles as the backend-termination signal: russh drops the
/// handler when the client session winds down.
pub(crate) struct BackendHandler {
    // Expected host key fingerprint; empty accepts any key.
    expected_fingerprint: String,
    // Handle to the inbound endpoint, for bridging backend-opened channels.
    inbound: russh::server::Handle,
    // Cancelled on drop so the session supervisor observes termination.
    terminated: CancellationToken,
}

impl Drop for BackendHandler {
    fn drop(&mut self) {
        self.terminated.cancel();
    }
}

impl client::Handler for BackendHandler {
    type Error = ProxyError;

    async fn check_server_key(&mut self, key: &PublicKey) -> Result<bool, Self::Error> {
        if self.expected_fingerprint.is_empty() {
            return Ok(true);
        }
        if verify_host_key(&self.expected_fingerprint, key) {
            Ok(true)
        } else {
            tracing::warn!(
                expected = %self.expected_fingerprint,
                "Backend host key fingerprint mismatch."
            );
            Err(ProxyError::HostKeyMismatch)
        }
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!(
            address = connected_address,
            port = connected_port,
            "Backend opened forwarded-tcpip channel."
        );
        let inbound = self.inbound.clone();
        let connected_address = connected_address.to_string();
        let originator_address = originator_address.to_string();
        tokio::spawn(async move {
            match inbound
                .channel_open_forwarded_tcpip(
                    connected_address,
                    connected_port,
                    originator_address,
                    originator_port,
                )
                .await
            {
                Ok(inbound_channel) => bridge_channel_streams(channel, inbound_channel).await,
                Err(error) => {
                    // Dropping the backend channel closes it on the peer.
                    tracing::warn!(
                        %error,
                        "Inbound endpoint refused forwarded-tcpip channel."
                    );
                }
            }
        });
        Ok(())
    }

    async fn server_channel_open_x11(
        &mut self,
        channel: Channel<Msg>,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!(
            address = originator_address,
            port = originator_port,
            "Backend opened x11 channel."
        );
        let inbound = self.inbound.clone();
        let originator_address = originator_address.to_string();
        tokio::spawn(async move {
            match inbound
                .channel_open_x11(originator_address, originator_port)
                .await
            {
                Ok(inbound_channel) => bridge_channel_streams(channel, inbound_channel).await,
                Err(error) => {
                    tracing::warn!(%error, "Inbound endpoint refused x11 channel.");
                }
            }
        });
        Ok(())
    }
}

// Backend-initiated channels carry raw byte streams, so bridging them is a
// bidirectional copy. Half-close in either direction propagates as EOF.
async fn bridge_channel_streams(
    backend_channel: Channel<Msg>,
    inbound_channel: Channel<russh::server::Msg>,
) {
    let mut backend_stream = backend_channel.into_stream();
    let mut inbound_stream = inbound_channel.into_stream();
    match tokio::io::copy_bidirectional(&mut backend_stream, &mut inbound_stream).await {
        Ok((to_inbound, to_backend)) => {
            tracing::debug!(to_inbound, to_backend, "Bridged channel completed.");
        }
        Err(error) => {
            tracing::debug!(%error, "Bridged channel ended with error.");
        }
    }
}

/// Dial and authenticate the outbound SSH connection described by the
/// session's `proxy-target-config` critical option.
///
/// Any failure here is fatal to the session; the TCP socket is dropped on
/// every failing path past the dial.
pub(crate) async fn connect_backend(
    permissions: &dyn PermissionsReader,
    inbound: russh::server::Handle,
    terminated: CancellationToken,
) -> Result<client::Handle<BackendHandler>, ProxyError> {
    let target = resolve_target(permissions)?;

    let stream = TcpStream::connect(&target.address)
        .await
        .map_err(|source| ProxyError::DialFailed {
            address: target.address.clone(),
            source,
        })?;

    let private_key = if target.private_key.is_empty() {
        None
    } else {
        Some(decode_secret_key(&target.private_key, None).map_err(ProxyError::BadPrivateKey)?)
    };

    let handler = BackendHandler {
        expected_fingerprint: target.host_fingerprint.clone(),
        inbound,
        terminated,
    };
    let config = Arc::new(client::Config::default());
    let mut handle = client::connect_stream(config, stream, handler)
        .await
        .map_err(|error| match error {
            ProxyError::Ssh(error) => ProxyError::HandshakeFailed(error),
            other => other,
        })?;

    if let Err(error) = authenticate(&mut handle, &target, private_key).await {
        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "", "")
            .await;
        return Err(error);
    }
    Ok(handle)
}

// Offer the configured authentication methods in order: public key first,
// then password, falling back to the "none" method when neither is present.
async fn authenticate(
    handle: &mut client::Handle<BackendHandler>,
    target: &TargetConfig,
    private_key: Option<PrivateKey>,
) -> Result<(), ProxyError> {
    let offer_password = !target.user.is_empty() && !target.password.is_empty();

    if let Some(key) = private_key {
        let hash_alg = if key.algorithm().is_rsa() {
            handle.best_supported_rsa_hash().await?.flatten()
        } else {
            None
        };
        let key = PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg);
        if handle
            .authenticate_publickey(target.user.clone(), key)
            .await?
            .success()
        {
            return Ok(());
        }
    } else if !offer_password {
        if handle
            .authenticate_none(target.user.clone())
            .await?
            .success()
        {
            return Ok(());
        }
        return Err(ProxyError::AuthenticationFailed {
            user: target.user.clone(),
        });
    }

    if offer_password
        && handle
            .authenticate_password(target.user.clone(), target.password.clone())
            .await?
            .success()
    {
        return Ok(());
    }

    Err(ProxyError::AuthenticationFailed {
        user: target.user.clone(),
    })
}
