// A client's connection to one relay room.
//
// The session owns a local `GraphDoc` replica and an `Awareness` map behind a
// std mutex. Callers mutate the replica directly and the resulting updates are
// queued to a driver task, which owns the socket and also integrates inbound
// frames, refreshes this client's presence and expires silent peers. When the
// socket drops, the driver reconnects with backoff and re-runs the handshake
// from the same replica, so edits made while offline reach the room.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use flowsync_common::awareness::{random_color, Awareness, AwarenessState, AwarenessUpdate};
use flowsync_common::crdt::{ClientId, GraphChange, GraphDoc, GraphSnapshot, Position};
use flowsync_common::protocol::{Frame, MessageType};
use flowsync_common::sync::SyncHandler;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::changes::DocumentChanges;

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Called with every remote peer's presence whenever it changes.
pub type PresenceCallback = Arc<dyn Fn(&[(ClientId, AwarenessState)]) + Send + Sync>;

pub const DEFAULT_AWARENESS_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Exponential backoff between reconnect attempts.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Consecutive failed attempts before the session closes; `None` retries
    /// forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(2_500),
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    fn backoff(&self, failures: u32) -> Duration {
        self.initial_backoff.saturating_mul(2u32.saturating_pow(failures)).min(self.max_backoff)
    }
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Replica id; random when unset.
    pub client_id: Option<ClientId>,
    /// Presence color; a random `#rrggbb` when unset.
    pub color: Option<String>,
    /// Peers silent for this long are dropped locally. Our own presence is
    /// re-sent every half of it.
    pub awareness_timeout: Duration,
    /// Bounds connecting plus the sync handshake, initial or reconnect.
    pub handshake_timeout: Duration,
    /// `None` closes the session the first time the socket drops.
    pub reconnect: Option<ReconnectPolicy>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            client_id: None,
            color: None,
            awareness_timeout: DEFAULT_AWARENESS_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            reconnect: Some(ReconnectPolicy::default()),
        }
    }
}

enum Command {
    Send(Frame),
    Close,
}

enum Disconnect {
    /// The caller closed or dropped the session.
    Closed,
    /// The socket failed or the relay hung up.
    Lost,
}

struct Shared {
    doc: GraphDoc,
    awareness: Awareness,
    color: String,
    /// A socket is up and past its handshake.
    online: bool,
    /// No further edits are accepted.
    closed: bool,
    subscribed: bool,
    changes: Option<mpsc::UnboundedSender<GraphSnapshot>>,
    presence_callbacks: Vec<PresenceCallback>,
}

impl Shared {
    fn publish_snapshot(&mut self) {
        if let Some(changes) = &self.changes {
            if changes.send(self.doc.snapshot()).is_err() {
                self.changes = None;
            }
        }
    }
}

#[derive(Default)]
struct Handled {
    reply: Option<Frame>,
    presence_changed: bool,
}

pub struct RoomSession {
    room_id: String,
    client_id: ClientId,
    shared: Arc<Mutex<Shared>>,
    commands: mpsc::UnboundedSender<Command>,
    driver: JoinHandle<()>,
}

impl RoomSession {
    /// Connect to `{endpoint}/{room_id}`, finish the sync handshake and
    /// announce this client's presence.
    pub async fn connect(endpoint: &str, room_id: &str, options: SessionOptions) -> Result<Self> {
        let url = room_url(endpoint, room_id)?;

        let doc = match options.client_id {
            Some(client_id) => GraphDoc::new(client_id),
            None => GraphDoc::with_random_client_id(),
        };
        let client_id = doc.client_id();
        let color = options.color.clone().unwrap_or_else(random_color);
        let mut awareness = Awareness::with_local_client(client_id);
        awareness
            .set_local_state(Some(AwarenessState::new(color.clone())), Instant::now().into_std())
            .context("failed to set initial presence")?;
        let shared = Arc::new(Mutex::new(Shared {
            doc,
            awareness,
            color,
            online: false,
            closed: false,
            subscribed: false,
            changes: None,
            presence_callbacks: Vec::new(),
        }));

        let socket = establish(&url, &shared, options.handshake_timeout).await?;
        info!(room_id, client_id, "joined relay room");

        let (commands, command_rx) = mpsc::unbounded_channel();
        let driver = Driver {
            url,
            shared: Arc::clone(&shared),
            commands: command_rx,
            awareness_timeout: options.awareness_timeout,
            handshake_timeout: options.handshake_timeout,
            reconnect: options.reconnect,
        };
        let driver = tokio::spawn(driver.run(socket));

        Ok(Self { room_id: room_id.to_string(), client_id, shared, commands, driver })
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// True while a socket to the relay is up. A session that is
    /// reconnecting reports false but still accepts edits.
    pub fn is_connected(&self) -> bool {
        let state = lock(&self.shared);
        state.online && !state.closed
    }

    /// Stream of graph snapshots, starting with the current one. Only the
    /// first call returns a stream. It stays open across reconnects and ends
    /// when the session closes.
    pub fn subscribe(&self) -> Option<DocumentChanges> {
        let mut state = lock(&self.shared);
        if state.subscribed {
            return None;
        }
        state.subscribed = true;

        let (sender, receiver) = mpsc::unbounded_channel();
        let _ = sender.send(state.doc.snapshot());
        if !state.closed {
            state.changes = Some(sender);
        }
        Some(DocumentChanges::new(receiver))
    }

    /// Apply a change to the local replica and send it to the room. While
    /// reconnecting the change stays local until the next handshake.
    pub fn mutate(&self, change: GraphChange) -> Result<()> {
        let mut state = lock(&self.shared);
        if state.closed {
            bail!("session for room `{}` is closed", self.room_id);
        }
        let update = state
            .doc
            .apply_local_change(change)
            .context("change rejected by the local replica")?;
        self.send(Frame::update(update))?;
        state.publish_snapshot();
        Ok(())
    }

    /// Publish this client's cursor, or clear it with `None`.
    pub fn set_presence(&self, cursor: Option<Position>) -> Result<()> {
        let mut state = lock(&self.shared);
        if state.closed {
            bail!("session for room `{}` is closed", self.room_id);
        }
        let next = state
            .awareness
            .local_state()
            .cloned()
            .unwrap_or_else(|| AwarenessState::new(state.color.clone()))
            .with_cursor(cursor);
        let update = state
            .awareness
            .set_local_state(Some(next), Instant::now().into_std())
            .context("presence rejected")?;
        self.send(Frame::awareness(update.encode()))
    }

    /// Register a callback for remote presence changes.
    pub fn on_peer_presence<F>(&self, callback: F)
    where
        F: Fn(&[(ClientId, AwarenessState)]) + Send + Sync + 'static,
    {
        lock(&self.shared).presence_callbacks.push(Arc::new(callback));
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        lock(&self.shared).doc.snapshot()
    }

    /// Remote peers currently present, sorted by client id.
    pub fn peers(&self) -> Vec<(ClientId, AwarenessState)> {
        lock(&self.shared).awareness.peers()
    }

    /// Withdraw this client's presence and close the socket.
    pub async fn close(self) -> Result<()> {
        let removal = {
            let mut state = lock(&self.shared);
            let removal = state.awareness.set_local_state(None, Instant::now().into_std());
            state.closed = true;
            state.changes = None;
            removal
        };
        if let Ok(removal) = removal {
            let _ = self.commands.send(Command::Send(Frame::awareness(removal.encode())));
        }
        let _ = self.commands.send(Command::Close);

        timeout(Duration::from_secs(5), self.driver)
            .await
            .context("session driver did not stop")?
            .context("session driver panicked")?;
        info!(room_id = %self.room_id, client_id = self.client_id, "left relay room");
        Ok(())
    }

    fn send(&self, frame: Frame) -> Result<()> {
        self.commands
            .send(Command::Send(frame))
            .map_err(|_| anyhow!("session for room `{}` is closed", self.room_id))
    }
}

fn room_url(endpoint: &str, room_id: &str) -> Result<Url> {
    if room_id.is_empty() {
        bail!("room id must not be empty");
    }
    let mut url =
        Url::parse(endpoint).with_context(|| format!("invalid relay endpoint `{endpoint}`"))?;
    match url.scheme() {
        "ws" | "wss" => {}
        other => bail!("unsupported relay scheme `{other}`, expected ws or wss"),
    }
    url.path_segments_mut()
        .map_err(|_| anyhow!("relay endpoint `{endpoint}` cannot carry a path"))?
        .pop_if_empty()
        .push(room_id);
    Ok(url)
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Open a socket, run Step1/Step2 from the current replica and (re)announce
/// the local presence.
async fn establish(url: &Url, shared: &Mutex<Shared>, limit: Duration) -> Result<Socket> {
    let attempt = async {
        let (mut socket, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("failed to connect to relay room at {url}"))?;

        let step1 = SyncHandler::step1(&lock(shared).doc);
        send_frame(&mut socket, step1).await?;
        handshake(&mut socket, shared).await?;

        let presence = {
            let mut state = lock(shared);
            let now = Instant::now().into_std();
            state
                .awareness
                .local_state()
                .cloned()
                .and_then(|local| state.awareness.set_local_state(Some(local), now).ok())
        };
        if let Some(update) = presence {
            send_frame(&mut socket, Frame::awareness(update.encode())).await?;
        }
        lock(shared).online = true;
        Ok::<_, anyhow::Error>(socket)
    };

    timeout(limit, attempt)
        .await
        .map_err(|_| anyhow!("connecting to {url} timed out after {limit:?}"))?
}

async fn handshake(socket: &mut Socket, shared: &Mutex<Shared>) -> Result<()> {
    let (mut synced, mut answered) = (false, false);
    while !(synced && answered) {
        let frame = next_frame(socket)
            .await?
            .ok_or_else(|| anyhow!("relay closed the connection during the handshake"))?;
        let kind = frame.kind;
        let handled = apply_frame(shared, frame)?;
        if handled.presence_changed {
            notify_presence(shared);
        }
        if let Some(reply) = handled.reply {
            send_frame(socket, reply).await?;
        }
        match kind {
            MessageType::SyncStep2 => synced = true,
            MessageType::SyncStep1 => answered = true,
            MessageType::Update | MessageType::Awareness => {}
        }
    }
    debug!("sync handshake complete");
    Ok(())
}

fn apply_frame(shared: &Mutex<Shared>, frame: Frame) -> Result<Handled> {
    let mut state = lock(shared);
    if frame.kind == MessageType::Awareness {
        let update = AwarenessUpdate::decode(&frame.payload)?;
        let change = state.awareness.apply_update(&update, Instant::now().into_std());
        return Ok(Handled { reply: None, presence_changed: !change.is_empty() });
    }

    let outcome = SyncHandler::handle(&mut state.doc, &frame)?;
    if outcome.changed {
        state.publish_snapshot();
    }
    Ok(Handled { reply: outcome.reply, presence_changed: false })
}

fn notify_presence(shared: &Mutex<Shared>) {
    let (callbacks, peers) = {
        let state = lock(shared);
        (state.presence_callbacks.clone(), state.awareness.peers())
    };
    for callback in callbacks {
        callback(&peers);
    }
}

struct Driver {
    url: Url,
    shared: Arc<Mutex<Shared>>,
    commands: mpsc::UnboundedReceiver<Command>,
    awareness_timeout: Duration,
    handshake_timeout: Duration,
    reconnect: Option<ReconnectPolicy>,
}

impl Driver {
    async fn run(mut self, mut socket: Socket) {
        loop {
            if let Disconnect::Closed = self.pump(socket).await {
                break;
            }
            self.went_offline();
            match self.reconnect().await {
                Some(next) => socket = next,
                None => break,
            }
        }

        let mut state = lock(&self.shared);
        state.online = false;
        state.closed = true;
        state.changes = None;
    }

    /// Move frames between one socket and the session until it ends.
    async fn pump(&mut self, socket: Socket) -> Disconnect {
        let (mut sink, mut stream) = socket.split();
        let mut refresh = tokio::time::interval(self.awareness_timeout / 2);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
        refresh.reset();

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Send(frame)) => {
                        if let Err(error) = send_frame(&mut sink, frame).await {
                            warn!(%error, "failed to send frame to relay");
                            return Disconnect::Lost;
                        }
                    }
                    Some(Command::Close) | None => {
                        let _ = sink.send(Message::Close(None)).await;
                        return Disconnect::Closed;
                    }
                },
                inbound = next_frame(&mut stream) => match inbound {
                    Ok(Some(frame)) => {
                        let kind = frame.kind.as_str();
                        match apply_frame(&self.shared, frame) {
                            Ok(handled) => {
                                if handled.presence_changed {
                                    notify_presence(&self.shared);
                                }
                                if let Some(reply) = handled.reply {
                                    if let Err(error) = send_frame(&mut sink, reply).await {
                                        warn!(%error, "failed to answer relay");
                                        return Disconnect::Lost;
                                    }
                                }
                            }
                            Err(error) => warn!(kind, %error, "ignoring frame from relay"),
                        }
                    }
                    Ok(None) => {
                        info!("relay closed the connection");
                        return Disconnect::Lost;
                    }
                    Err(error) => {
                        warn!(%error, "relay connection lost");
                        return Disconnect::Lost;
                    }
                },
                _ = refresh.tick() => {
                    let (refresh_frame, expired) = {
                        let mut state = lock(&self.shared);
                        let now = Instant::now().into_std();
                        let expired = state.awareness.expire(now, self.awareness_timeout);
                        let refresh_frame = state
                            .awareness
                            .local_state()
                            .cloned()
                            .and_then(|local| state.awareness.set_local_state(Some(local), now).ok())
                            .map(|update| Frame::awareness(update.encode()));
                        (refresh_frame, expired)
                    };
                    if !expired.is_empty() {
                        debug!(expired = expired.len(), "expired silent peers");
                        notify_presence(&self.shared);
                    }
                    if let Some(frame) = refresh_frame {
                        if let Err(error) = send_frame(&mut sink, frame).await {
                            warn!(%error, "failed to refresh presence");
                            return Disconnect::Lost;
                        }
                    }
                }
            }
        }
    }

    /// Forget remote presence; peers re-announce after the next handshake.
    fn went_offline(&self) {
        let had_peers = {
            let mut state = lock(&self.shared);
            state.online = false;
            let peers: Vec<ClientId> =
                state.awareness.peers().into_iter().map(|(client_id, _)| client_id).collect();
            state.awareness.remove_clients(peers).is_some()
        };
        if had_peers {
            notify_presence(&self.shared);
        }
    }

    /// Retry with backoff until a new socket finishes its handshake. `None`
    /// when reconnecting is disabled, the attempts ran out or the caller
    /// closed the session meanwhile.
    async fn reconnect(&mut self) -> Option<Socket> {
        let policy = self.reconnect.clone()?;
        let mut failures: u32 = 0;

        loop {
            if policy.max_attempts.is_some_and(|max| failures >= max) {
                warn!(url = %self.url, failures, "giving up on the relay");
                return None;
            }

            let delay = tokio::time::sleep(policy.backoff(failures));
            tokio::pin!(delay);
            loop {
                tokio::select! {
                    _ = &mut delay => break,
                    command = self.commands.recv() => match command {
                        // The next handshake carries local edits and presence.
                        Some(Command::Send(_)) => {}
                        Some(Command::Close) | None => return None,
                    },
                }
            }

            match establish(&self.url, &self.shared, self.handshake_timeout).await {
                Ok(socket) => {
                    info!(url = %self.url, failures, "reconnected to relay");
                    return Some(socket);
                }
                Err(error) => {
                    failures += 1;
                    debug!(url = %self.url, failures, %error, "reconnect attempt failed");
                }
            }
        }
    }
}

async fn send_frame<S>(sink: &mut S, frame: Frame) -> Result<()>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    sink.send(Message::Binary(frame.encode().into())).await.context("websocket send failed")
}

/// Next decodable frame, or `None` once the relay closed the socket.
async fn next_frame<S>(stream: &mut S) -> Result<Option<Frame>>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(message) = stream.next().await {
        match message.context("websocket read failed")? {
            Message::Binary(payload) => match Frame::decode(&payload) {
                Ok(frame) => return Ok(Some(frame)),
                Err(error) => warn!(%error, "dropping undecodable frame from relay"),
            },
            Message::Close(_) => return Ok(None),
            Message::Text(_) | Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
        }
    }
    Ok(None)
}
