/// Push channel: one WebSocket per session carrying inbound activity
/// notifications and outbound send commands
use crate::error::{ChatError, Result};
use crate::messenger_types::{InboundEvent, SendCommand};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection state of the push channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Not connected (never opened, lost, or closed)
    #[default]
    Disconnected,
    /// Opening the WebSocket
    Connecting,
    /// Open and accepting commands
    Connected,
    /// Close requested locally
    Closing,
}

/// What the channel task reports to its owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    State(ConnectionState),
    Inbound(InboundEvent),
}

/// Sending side of the push channel as the engine sees it
pub trait Outbox: Send + Sync {
    /// Queue a command; rejected unless the channel is connected
    fn push(&self, command: SendCommand) -> Result<()>;

    fn state(&self) -> ConnectionState;

    /// Ask the channel to close. Idempotent.
    fn close(&self);
}

enum Outbound {
    Send(SendCommand),
    Close,
}

/// Handle to a running push channel
#[derive(Clone)]
pub struct ChannelHandle {
    outbound: mpsc::UnboundedSender<Outbound>,
    state: watch::Receiver<ConnectionState>,
}

impl Outbox for ChannelHandle {
    fn push(&self, command: SendCommand) -> Result<()> {
        let state = self.state();
        if state != ConnectionState::Connected {
            return Err(ChatError::ChannelUnavailable(format!(
                "push channel is {:?}",
                state
            )));
        }
        self.outbound
            .send(Outbound::Send(command))
            .map_err(|_| ChatError::ChannelUnavailable("push channel task has stopped".to_string()))
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn close(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }
}

/// Open the push channel for a session: `{ws_url}/ws/{credential}`
pub async fn connect(
    ws_url: &str,
    credential: &str,
    keepalive: Duration,
) -> Result<(ChannelHandle, mpsc::UnboundedReceiver<ChannelEvent>)> {
    let base = ws_url.trim_end_matches('/');
    let url = format!("{}/ws/{}", base, credential);
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);

    debug!("Opening push channel at {}/ws/…", base);
    let (ws, _response) = connect_async(url.as_str())
        .await
        .map_err(|e| ChatError::Channel(format!("connect to {} failed: {}", base, e)))?;
    info!("Push channel connected to {}", base);

    set_state(&state_tx, &events_tx, ConnectionState::Connected);

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let keepalive = keepalive.max(Duration::from_secs(1));
    tokio::spawn(run_channel(ws, outbound_rx, events_tx, state_tx, keepalive));

    Ok((
        ChannelHandle {
            outbound: outbound_tx,
            state: state_rx,
        },
        events_rx,
    ))
}

fn set_state(
    state: &watch::Sender<ConnectionState>,
    events: &mpsc::UnboundedSender<ChannelEvent>,
    next: ConnectionState,
) {
    if state.send_replace(next) != next {
        let _ = events.send(ChannelEvent::State(next));
    }
}

/// Pump commands out and notifications in until either side goes away
async fn run_channel(
    ws: WsStream,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    state: watch::Sender<ConnectionState>,
    keepalive: Duration,
) {
    let (mut write, mut read) = ws.split();
    let mut ticker = interval(keepalive);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // First tick fires immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            cmd = outbound.recv() => match cmd {
                Some(Outbound::Send(command)) => {
                    let json = match command.to_json() {
                        Ok(json) => json,
                        Err(e) => {
                            error!("Failed to serialize send command: {}", e);
                            continue;
                        }
                    };
                    debug!("Pushing send command to {}", command.to);
                    if let Err(e) = write.send(WsMessage::Text(json)).await {
                        warn!("Push channel write failed: {}", e);
                        break;
                    }
                }
                Some(Outbound::Close) | None => {
                    set_state(&state, &events, ConnectionState::Closing);
                    let _ = write.send(WsMessage::Close(None)).await;
                    info!("Push channel closed");
                    break;
                }
            },
            frame = read.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => match InboundEvent::from_json(&text) {
                    Ok(event) => {
                        debug!("Activity in conversation {}", event.conversation_id);
                        if events.send(ChannelEvent::Inbound(event)).is_err() {
                            // Nobody is listening any more
                            break;
                        }
                    }
                    Err(e) => warn!("Ignoring malformed push payload: {}", e),
                },
                Some(Ok(WsMessage::Close(frame))) => {
                    info!("Push channel closed by server: {:?}", frame);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Push channel error: {}", e);
                    break;
                }
                None => {
                    info!("Push channel stream ended");
                    break;
                }
            },
            _ = ticker.tick() => {
                if let Err(e) = write.send(WsMessage::Ping(Vec::new())).await {
                    warn!("Push channel keepalive failed: {}", e);
                    break;
                }
            }
        }
    }

    set_state(&state, &events, ConnectionState::Disconnected);
}
