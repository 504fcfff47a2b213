//! Real-time session channel bound to a single user.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use log::{debug, error, trace, warn};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use crate::api::events::{ClientEvent, ServerEvent};
use crate::api::models::{
    ConversationId, CreateConversation, CreateConversationResponse, MessageRequest,
    MessageResponse, UserId,
};
use crate::config::ClientConfig;
use crate::error::{ChatError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Events buffered per queue before new arrivals are dropped.
pub const INBOUND_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Connecting,
    Open,
    Closed,
}

/// Senders the reader task routes inbound events into.
#[derive(Clone)]
struct Inbound {
    created: mpsc::Sender<CreateConversationResponse>,
    messages: mpsc::Sender<MessageResponse>,
}

impl Inbound {
    fn push<T>(queue: &mpsc::Sender<T>, event: T, user_id: &UserId, what: &str) {
        match queue.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    "Session {} {} queue full ({} pending), dropping event",
                    user_id, what, INBOUND_CAPACITY
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Session {} {} queue closed, dropping event", user_id, what);
            }
        }
    }
}

/// Moves the channel to `Closed` if `open` is abandoned mid-handshake.
struct ConnectGuard {
    state: Arc<watch::Sender<ChannelState>>,
    armed: bool,
}

impl Drop for ConnectGuard {
    fn drop(&mut self) {
        if self.armed {
            self.state.send_replace(ChannelState::Closed);
        }
    }
}

/// One user's live connection to the messaging backend.
///
/// Inbound events are demultiplexed into one FIFO queue per event type, so a
/// response that arrives before its await is buffered rather than lost, and
/// overlapping awaits of the same type are served in call order. Each queue
/// holds at most [`INBOUND_CAPACITY`] unclaimed events until the channel is
/// dropped. Events past that limit are discarded with a warning.
pub struct SessionChannel {
    socket_url: Url,
    await_timeout: Duration,
    user_id: Option<UserId>,
    state: Arc<watch::Sender<ChannelState>>,
    sink: Arc<Mutex<Option<WsSink>>>,
    inbound: Inbound,
    created_rx: Mutex<mpsc::Receiver<CreateConversationResponse>>,
    messages_rx: Mutex<mpsc::Receiver<MessageResponse>>,
    recv_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SessionChannel {
    pub fn new(socket_url: Url, await_timeout: Duration) -> Self {
        let (state, _) = watch::channel(ChannelState::Idle);
        let (created_tx, created_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (messages_tx, messages_rx) = mpsc::channel(INBOUND_CAPACITY);
        Self {
            socket_url,
            await_timeout,
            user_id: None,
            state: Arc::new(state),
            sink: Arc::new(Mutex::new(None)),
            inbound: Inbound {
                created: created_tx,
                messages: messages_tx,
            },
            created_rx: Mutex::new(created_rx),
            messages_rx: Mutex::new(messages_rx),
            recv_task: std::sync::Mutex::new(None),
        }
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        Ok(Self::new(config.socket_url()?, config.await_timeout()))
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn user_id(&self) -> Option<&UserId> {
        self.user_id.as_ref()
    }

    /// Connects the socket for `user_id`.
    ///
    /// Returns once the handshake completes; the channel stays `Connecting`
    /// until the backend acks. A failed or abandoned handshake leaves the
    /// channel `Closed`.
    pub async fn open(&mut self, user_id: UserId) -> Result<()> {
        if self.state() != ChannelState::Idle {
            return Err(ChatError::AlreadyOpen);
        }

        let mut url = self.socket_url.clone();
        url.query_pairs_mut().append_pair("user_id", user_id.as_str());

        self.state.send_replace(ChannelState::Connecting);
        debug!("Connecting session for {} to {}", user_id, self.socket_url);
        let mut guard = ConnectGuard {
            state: self.state.clone(),
            armed: true,
        };

        let (ws_stream, _) = match connect_async(url.as_str()).await {
            Ok(conn) => conn,
            Err(e) => {
                error!("Session connect for {} failed: {}", user_id, e);
                return Err(ChatError::Connection(e.to_string()));
            }
        };

        let (ws_sink, ws_source) = ws_stream.split();
        *self.sink.lock().await = Some(ws_sink);

        let recv_task = {
            let user_id = user_id.clone();
            let state = self.state.clone();
            let inbound = self.inbound.clone();
            tokio::spawn(async move {
                Self::receive_loop(ws_source, user_id, state, inbound).await;
            })
        };
        if let Ok(mut slot) = self.recv_task.lock() {
            *slot = Some(recv_task);
        }
        guard.armed = false;

        self.user_id = Some(user_id);
        Ok(())
    }

    async fn receive_loop(
        mut ws_source: WsSource,
        user_id: UserId,
        state: Arc<watch::Sender<ChannelState>>,
        inbound: Inbound,
    ) {
        while let Some(msg) = ws_source.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    trace!("Session {} recv: {}", user_id, text);
                    match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(event) => Self::dispatch(event, &user_id, &state, &inbound),
                        Err(e) => warn!("Session {} skipping unparseable frame: {}", user_id, e),
                    }
                }
                Ok(Message::Close(_)) => {
                    debug!("Session {} closed by backend", user_id);
                    break;
                }
                Err(e) => {
                    error!("Session {} socket error: {}", user_id, e);
                    break;
                }
                _ => {}
            }
        }
        state.send_replace(ChannelState::Closed);
    }

    fn dispatch(
        event: ServerEvent,
        user_id: &UserId,
        state: &watch::Sender<ChannelState>,
        inbound: &Inbound,
    ) {
        match event {
            ServerEvent::Connected { user_id: acked } => {
                if acked != *user_id {
                    warn!("Session {} acked as {}", user_id, acked);
                }
                let opened = state.send_if_modified(|s| {
                    if *s == ChannelState::Connecting {
                        *s = ChannelState::Open;
                        true
                    } else {
                        false
                    }
                });
                if opened {
                    debug!("Session {} open", user_id);
                }
            }
            ServerEvent::CreateConversationResponse(resp) => {
                if resp.involves(user_id) {
                    Inbound::push(&inbound.created, resp, user_id, "create_conversation_response");
                } else {
                    debug!(
                        "Session {} ignoring conversation {} it is not part of",
                        user_id, resp.conversation_response.id
                    );
                }
            }
            ServerEvent::Message(msg) => {
                Inbound::push(&inbound.messages, msg, user_id, "message");
            }
            ServerEvent::Error { message } => {
                warn!("Session {} backend error: {}", user_id, message);
            }
        }
    }

    /// Resolves once the backend has acked the connection.
    pub async fn wait_until_ready(&self) -> Result<()> {
        let mut rx = self.state.subscribe();
        let ready = async move {
            loop {
                let current = *rx.borrow_and_update();
                match current {
                    ChannelState::Open => return Ok(()),
                    ChannelState::Idle | ChannelState::Closed => return Err(ChatError::NotConnected),
                    ChannelState::Connecting => {}
                }
                if rx.changed().await.is_err() {
                    return Err(ChatError::NotConnected);
                }
            }
        };
        tokio::time::timeout(self.await_timeout, ready)
            .await
            .map_err(|_| ChatError::Timeout("connection ack".to_string()))?
    }

    /// Emits a create-conversation frame; the result arrives through
    /// [`await_create_conversation_result`](Self::await_create_conversation_result).
    pub async fn request_create_conversation(&self, request: CreateConversation) -> Result<()> {
        request.validate()?;
        self.emit(ClientEvent::CreateConversation(request)).await
    }

    /// Next create-conversation response for a conversation this user is part of.
    pub async fn await_create_conversation_result(&self) -> Result<CreateConversationResponse> {
        self.next_event(&self.created_rx, "create_conversation_response")
            .await
    }

    pub async fn join_conversation(&self, conversation_id: ConversationId) -> Result<()> {
        self.emit(ClientEvent::JoinConversation { conversation_id }).await
    }

    pub async fn send_message(&self, request: MessageRequest) -> Result<()> {
        self.emit(ClientEvent::SendMessage(request)).await
    }

    pub async fn await_message(&self) -> Result<MessageResponse> {
        self.next_event(&self.messages_rx, "message").await
    }

    /// Closes the socket and releases pending awaits. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        let previous = self.state.send_replace(ChannelState::Closed);

        if let Ok(mut slot) = self.recv_task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }

        if let Some(mut sink) = self.sink.lock().await.take() {
            if let Err(e) = sink.close().await {
                debug!("Session close frame not delivered: {}", e);
            }
        }

        if previous != ChannelState::Closed {
            debug!(
                "Session {} disconnected",
                self.user_id.as_ref().map(UserId::as_str).unwrap_or("<unopened>")
            );
        }
    }

    async fn emit(&self, event: ClientEvent) -> Result<()> {
        if self.state() != ChannelState::Open {
            return Err(ChatError::NotConnected);
        }

        let json = serde_json::to_string(&event)?;
        trace!("Session send: {}", json);

        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(ChatError::NotConnected)?;
        if let Err(e) = sink.send(Message::Text(json)).await {
            error!("Session send of {} failed: {}", event.name(), e);
            self.state.send_replace(ChannelState::Closed);
            return Err(e.into());
        }
        Ok(())
    }

    async fn next_event<T>(
        &self,
        queue: &Mutex<mpsc::Receiver<T>>,
        what: &str,
    ) -> Result<T> {
        match self.state() {
            ChannelState::Idle | ChannelState::Closed => return Err(ChatError::NotConnected),
            ChannelState::Connecting | ChannelState::Open => {}
        }

        let on_close = closed(self.state.subscribe());
        let wait = async {
            let mut rx = queue.lock().await;
            tokio::select! {
                biased;
                event = rx.recv() => event.ok_or(ChatError::Cancelled),
                _ = on_close => Err(ChatError::Cancelled),
            }
        };

        tokio::time::timeout(self.await_timeout, wait)
            .await
            .map_err(|_| ChatError::Timeout(what.to_string()))?
    }
}

impl Drop for SessionChannel {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.recv_task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
    }
}

/// Completes once the channel reaches `Closed`.
async fn closed(mut rx: watch::Receiver<ChannelState>) {
    loop {
        if *rx.borrow_and_update() == ChannelState::Closed {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}
