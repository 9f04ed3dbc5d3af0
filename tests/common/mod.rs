#![allow(dead_code)]

use std::{
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use russh::{
    Channel, ChannelId, ChannelMsg, CryptoVec,
    client::{self, Msg},
    keys::{
        PrivateKey, PublicKey,
        ssh_key::{LineEnding, private::Ed25519Keypair},
    },
    server::{self, Auth, Handler, Session},
};
use sshgate::{AppLogSink, Authenticator, Permissions, SshProxy};
use tokio::{
    net::TcpListener,
    sync::mpsc,
    time::{sleep, timeout},
};

pub fn generate_key() -> PrivateKey {
    PrivateKey::from(Ed25519Keypair::from_seed(
        &ChaCha20Rng::try_from_os_rng().unwrap().random(),
    ))
}

pub fn key_to_openssh_pem(key: &PrivateKey) -> String {
    key.to_openssh(LineEnding::LF).unwrap().to_string()
}

/// Authenticator double that accepts any credentials and hands out a fixed
/// set of critical options.
pub struct StaticAuthenticator {
    pub permissions: Permissions,
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn authenticate_password(&self, _user: &str, _password: &str) -> Option<Permissions> {
        Some(self.permissions.clone())
    }

    async fn authenticate_public_key(&self, _user: &str, _key: &PublicKey) -> Option<Permissions> {
        Some(self.permissions.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppLogEvent {
    pub app_id: String,
    pub message: String,
    pub source: String,
    pub instance: String,
}

#[derive(Default)]
pub struct RecordingLogSink {
    pub events: Mutex<Vec<AppLogEvent>>,
}

impl AppLogSink for RecordingLogSink {
    fn send_app_log(&self, app_id: &str, message: &str, source: &str, instance: &str) {
        self.events.lock().unwrap().push(AppLogEvent {
            app_id: app_id.into(),
            message: message.into(),
            source: source.into(),
            instance: instance.into(),
        });
    }
}

/// Observable state and knobs of the in-process backend SSH server.
#[derive(Default)]
pub struct BackendState {
    // Public key accepted for authentication, if any.
    pub authorized_key: Option<PublicKey>,
    // (user, password) pair accepted for authentication, if any.
    pub password: Option<(String, String)>,
    // Refuse every session channel open when set.
    pub reject_session_channels: bool,
    // Grant tcpip-forward requests when set.
    pub allow_forwards: bool,
    // After granting a forward, open a forwarded-tcpip channel back through
    // the connection and send this payload.
    pub forward_payload: Option<Vec<u8>>,
    // Reply to exec requests with this payload, exit status 0, EOF, close.
    pub exec_reply: Option<Vec<u8>>,
    // Echo received channel data back to the sender.
    pub echo_data: bool,

    pub connections: AtomicUsize,
    pub sessions_opened: AtomicUsize,
    pub channels_closed: AtomicBool,
    pub eof_seen: AtomicBool,
}

struct TestBackendHandler {
    state: Arc<BackendState>,
}

impl Handler for TestBackendHandler {
    type Error = russh::Error;

    async fn auth_none(&mut self, _user: &str) -> Result<Auth, Self::Error> {
        Ok(Auth::Reject {
            proceed_with_methods: None,
            partial_success: false,
        })
    }

    async fn auth_publickey(
        &mut self,
        _user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        match &self.state.authorized_key {
            Some(authorized) if authorized.key_data() == public_key.key_data() => Ok(Auth::Accept),
            _ => Ok(Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            }),
        }
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        match &self.state.password {
            Some((expected_user, expected_password))
                if expected_user == user && expected_password == password =>
            {
                Ok(Auth::Accept)
            }
            _ => Ok(Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            }),
        }
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<server::Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if self.state.reject_session_channels {
            return Ok(false);
        }
        self.state.sessions_opened.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_success(channel)
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_success(channel)
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        _data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_success(channel)?;
        if let Some(reply) = &self.state.exec_reply {
            session.data(channel, CryptoVec::from_slice(reply))?;
            session.exit_status_request(channel, 0)?;
            session.eof(channel)?;
            session.close(channel)?;
        }
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if self.state.echo_data {
            session.data(channel, CryptoVec::from_slice(data))?;
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        _channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.state.eof_seen.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn channel_close(
        &mut self,
        _channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.state.channels_closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if !self.state.allow_forwards {
            return Ok(false);
        }
        if let Some(payload) = self.state.forward_payload.clone() {
            let handle = session.handle();
            let address = address.to_string();
            let port = *port;
            tokio::spawn(async move {
                if let Ok(channel) = handle
                    .channel_open_forwarded_tcpip(address, port, "127.0.0.1".to_string(), 34567)
                    .await
                {
                    let _ = channel.data(&payload[..]).await;
                    let _ = channel.eof().await;
                }
            });
        }
        Ok(true)
    }
}

/// Spawn an in-process backend SSH server; returns its listening address.
pub async fn start_test_backend(state: Arc<BackendState>, host_key: PrivateKey) -> SocketAddr {
    let config = Arc::new(server::Config {
        inactivity_timeout: Some(Duration::from_secs(3600)),
        auth_rejection_time: Duration::from_secs(3),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        keys: vec![host_key],
        ..Default::default()
    });
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            state.connections.fetch_add(1, Ordering::SeqCst);
            let handler = TestBackendHandler {
                state: Arc::clone(&state),
            };
            let config = Arc::clone(&config);
            tokio::spawn(async move {
                if let Ok(session) = server::run_stream(config, stream, handler).await {
                    let _ = session.await;
                }
            });
        }
    });
    address
}

/// Spawn the proxy behind a local listener; returns its listening address.
pub async fn start_proxy(proxy: Arc<SshProxy>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, peer)) = listener.accept().await else {
                break;
            };
            tokio::spawn(Arc::clone(&proxy).handle_connection(stream, peer));
        }
    });
    address
}

/// Build a proxy whose authenticator hands out the given permissions.
pub fn build_proxy(permissions: Permissions, log_sink: Arc<RecordingLogSink>) -> Arc<SshProxy> {
    let server_config = Arc::new(server::Config {
        inactivity_timeout: Some(Duration::from_secs(3600)),
        auth_rejection_time: Duration::from_secs(3),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        keys: vec![generate_key()],
        ..Default::default()
    });
    Arc::new(SshProxy::new(
        server_config,
        Arc::new(StaticAuthenticator { permissions }),
        log_sink,
    ))
}

/// SSH client double for the inbound side; accepts any host key.
pub struct TestClient {
    pub forwarded_data: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

impl TestClient {
    pub fn new() -> Self {
        TestClient {
            forwarded_data: None,
        }
    }
}

impl client::Handler for TestClient {
    type Error = anyhow::Error;

    async fn check_server_key(&mut self, _key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        mut channel: Channel<Msg>,
        _connected_address: &str,
        _connected_port: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        if let Some(tx) = self.forwarded_data.clone() {
            tokio::spawn(async move {
                while let Some(msg) = channel.wait().await {
                    if let ChannelMsg::Data { data } = msg {
                        let _ = tx.send(data.to_vec());
                    }
                }
            });
        }
        Ok(())
    }
}

/// Connect an inbound test client to the proxy and authenticate with the
/// given key.
pub async fn connect_client(
    proxy_address: SocketAddr,
    key: PrivateKey,
    handler: TestClient,
) -> client::Handle<TestClient> {
    let mut session = client::connect(Default::default(), proxy_address, handler)
        .await
        .expect("Failed to connect to proxy");
    let hash_alg = session.best_supported_rsa_hash().await.unwrap().flatten();
    assert!(
        session
            .authenticate_publickey(
                "user",
                russh::keys::PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg)
            )
            .await
            .expect("SSH authentication failed")
            .success(),
        "authentication didn't succeed"
    );
    session
}

/// Like [`connect_client`], but tolerates the session being torn down while
/// authentication is still in flight, as happens when the backend dial fails.
/// Returns `None` when the transport died during authentication.
pub async fn connect_client_lenient(
    proxy_address: SocketAddr,
    key: PrivateKey,
) -> Option<client::Handle<TestClient>> {
    let mut session = client::connect(Default::default(), proxy_address, TestClient::new())
        .await
        .expect("Failed to connect to proxy");
    let hash_alg = session.best_supported_rsa_hash().await.ok()?.flatten();
    match session
        .authenticate_publickey(
            "user",
            russh::keys::PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
        )
        .await
    {
        Ok(_) => Some(session),
        Err(_) => None,
    }
}

/// Poll until `condition` holds or the timeout elapses.
pub async fn wait_for(description: &str, mut condition: impl FnMut() -> bool) {
    if timeout(Duration::from_secs(5), async {
        while !condition() {
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .is_err()
    {
        panic!("Timeout waiting for {description}.");
    }
}

/// Serialize a target config document the way authenticators do.
pub fn target_config_json(address: SocketAddr, user: &str, private_key_pem: &str) -> String {
    serde_json::json!({
        "address": address.to_string(),
        "user": user,
        "private_key": private_key_pem,
    })
    .to_string()
}
