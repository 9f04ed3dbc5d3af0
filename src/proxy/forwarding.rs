use russh::{Channel, ChannelMsg, client, server};
use tokio::sync::mpsc;

// A message relayed from the inbound endpoint. The flag marks requests whose
// backend reply must be relayed back to the originator.
type PairCommand = (ChannelMsg, bool);

/// Inbound-side handle of a channel pair. Dropping it signals that the
/// inbound channel is gone, which closes the paired backend channel.
pub(crate) struct ChannelPairHandle {
    commands: mpsc::UnboundedSender<PairCommand>,
}

impl ChannelPairHandle {
    /// Relay a reply-less message to the backend channel.
    pub(crate) fn forward(&self, msg: ChannelMsg) {
        if self.commands.send((msg, false)).is_err() {
            tracing::debug!("Channel pair already gone; dropping message.");
        }
    }

    /// Relay a request whose backend reply must be mirrored back to the
    /// originator. The reply is emitted by the pair once the backend has
    /// answered; a request that never reaches the backend gets no reply.
    pub(crate) fn forward_request(&self, msg: ChannelMsg) {
        if self.commands.send((msg, true)).is_err() {
            tracing::debug!("Channel pair already gone; dropping request.");
        }
    }
}

/// Wire an admitted inbound channel to its freshly opened backend channel.
///
/// The inbound `Channel` object is parked for the pair's lifetime; all
/// inbound events arrive through the server handler and are relayed via
/// [`ChannelPairHandle`].
pub(crate) fn spawn_channel_pair(
    inbound_channel: Channel<server::Msg>,
    inbound: server::Handle,
    backend_channel: Channel<client::Msg>,
) -> ChannelPairHandle {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    tokio::spawn(run_channel_pair(
        inbound_channel,
        inbound,
        backend_channel,
        command_rx,
    ));
    ChannelPairHandle {
        commands: command_tx,
    }
}

async fn run_channel_pair(
    inbound_channel: Channel<server::Msg>,
    inbound: server::Handle,
    mut backend_channel: Channel<client::Msg>,
    mut commands: mpsc::UnboundedReceiver<PairCommand>,
) {
    let inbound_id = inbound_channel.id();
    tracing::debug!(channel = ?inbound_id, "Channel pair started.");

    // Deliveries toward the inbound endpoint go through their own task so a
    // slow inbound session can never starve this loop. Dropping the sender
    // lets the queue drain before the inbound channel is closed.
    let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();
    tokio::spawn(deliver_to_inbound(inbound_channel, inbound, delivery_rx));

    // Replies from the backend arrive in request order, so a count of
    // reply-expecting requests in flight is enough to pair them up.
    let mut pending_replies: usize = 0;

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some((msg, wants_reply)) => {
                    match send_to_backend(&backend_channel, msg).await {
                        Ok(()) => {
                            if wants_reply {
                                pending_replies += 1;
                            }
                        }
                        Err(error) => {
                            // Dropped request: the originator stays
                            // unanswered.
                            tracing::warn!(
                                channel = ?inbound_id,
                                %error,
                                "Failed to relay message to backend channel."
                            );
                        }
                    }
                }
                None => {
                    // Inbound channel closed; close the paired channel.
                    let _ = backend_channel.close().await;
                    break;
                }
            },
            msg = backend_channel.wait() => match msg {
                Some(msg @ (ChannelMsg::Success | ChannelMsg::Failure)) => {
                    if pending_replies > 0 {
                        pending_replies -= 1;
                        if delivery_tx.send(msg).is_err() {
                            let _ = backend_channel.close().await;
                            break;
                        }
                    }
                }
                Some(ChannelMsg::Close) => {
                    let _ = backend_channel.close().await;
                    break;
                }
                None => break,
                Some(msg) => {
                    if delivery_tx.send(msg).is_err() {
                        // Inbound endpoint is gone; take the backend side
                        // down with it.
                        let _ = backend_channel.close().await;
                        break;
                    }
                }
            },
        }
    }
    tracing::debug!(channel = ?inbound_id, "Channel pair completed.");
}

// Replay backend channel messages onto the inbound endpoint. When the queue
// closes (the pair ended), close the inbound channel so the client observes
// the teardown.
async fn deliver_to_inbound(
    inbound_channel: Channel<server::Msg>,
    inbound: server::Handle,
    mut deliveries: mpsc::UnboundedReceiver<ChannelMsg>,
) {
    let id = inbound_channel.id();
    while let Some(msg) = deliveries.recv().await {
        let delivered = match msg {
            ChannelMsg::Data { data } => inbound.data(id, data).await.is_ok(),
            ChannelMsg::ExtendedData { ext, data } => {
                inbound.extended_data(id, ext, data).await.is_ok()
            }
            ChannelMsg::Eof => inbound.eof(id).await.is_ok(),
            ChannelMsg::Success => inbound.channel_success(id).await.is_ok(),
            ChannelMsg::Failure => inbound.channel_failure(id).await.is_ok(),
            ChannelMsg::ExitStatus { exit_status } => {
                inbound.exit_status_request(id, exit_status).await.is_ok()
            }
            ChannelMsg::ExitSignal {
                signal_name,
                core_dumped,
                error_message,
                lang_tag,
            } => inbound
                .exit_signal_request(id, signal_name, core_dumped, error_message, lang_tag)
                .await
                .is_ok(),
            ChannelMsg::XonXoff { client_can_do } => {
                inbound.xon_xoff_request(id, client_can_do).await.is_ok()
            }
            // Window management stays with the SSH stack.
            ChannelMsg::WindowAdjusted { .. } => true,
            msg => {
                tracing::debug!(channel = ?id, ?msg, "Ignoring backend channel message.");
                true
            }
        };
        if !delivered {
            tracing::debug!(channel = ?id, "Inbound endpoint gone; stopping delivery.");
            return;
        }
    }
    let _ = inbound.close(id).await;
}

// Translate one inbound channel message into the matching send on the
// backend channel.
async fn send_to_backend(
    backend: &Channel<client::Msg>,
    msg: ChannelMsg,
) -> Result<(), russh::Error> {
    match msg {
        ChannelMsg::Data { data } => backend.data(&data[..]).await?,
        ChannelMsg::ExtendedData { ext, data } => backend.extended_data(ext, &data[..]).await?,
        ChannelMsg::Eof => backend.eof().await?,
        ChannelMsg::Close => backend.close().await?,
        ChannelMsg::RequestPty {
            want_reply,
            term,
            col_width,
            row_height,
            pix_width,
            pix_height,
            terminal_modes,
        } => {
            backend
                .request_pty(
                    want_reply,
                    &term,
                    col_width,
                    row_height,
                    pix_width,
                    pix_height,
                    &terminal_modes,
                )
                .await?
        }
        ChannelMsg::RequestShell { want_reply } => backend.request_shell(want_reply).await?,
        ChannelMsg::Exec {
            want_reply,
            command,
        } => backend.exec(want_reply, command).await?,
        ChannelMsg::RequestSubsystem { want_reply, name } => {
            backend.request_subsystem(want_reply, &name).await?
        }
        ChannelMsg::SetEnv {
            want_reply,
            variable_name,
            variable_value,
        } => {
            backend
                .set_env(want_reply, variable_name, variable_value)
                .await?
        }
        ChannelMsg::WindowChange {
            col_width,
            row_height,
            pix_width,
            pix_height,
        } => {
            backend
                .window_change(col_width, row_height, pix_width, pix_height)
                .await?
        }
        ChannelMsg::Signal { signal } => backend.signal(signal).await?,
        ChannelMsg::RequestX11 {
            want_reply,
            single_connection,
            x11_authentication_protocol,
            x11_authentication_cookie,
            x11_screen_number,
        } => {
            backend
                .request_x11(
                    want_reply,
                    single_connection,
                    x11_authentication_protocol,
                    x11_authentication_cookie,
                    x11_screen_number,
                )
                .await?
        }
        msg => {
            tracing::debug!(?msg, "Ignoring unsupported inbound channel message.");
        }
    }
    Ok(())
}
