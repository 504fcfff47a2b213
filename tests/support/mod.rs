//! In-process socket backend for session tests.
//!
//! Speaks the same envelope as the real backend: acks connections, answers
//! create-conversation requests (reusing an existing conversation for the
//! same participant set), and relays messages to joined sockets.

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use url::Url;

use chat_client::api::events::{ClientEvent, ServerEvent};
use chat_client::api::models::MessageText;
use chat_client::{
    Conversation, ConversationId, CreateConversation, CreateConversationResponse, Member,
    MessageId, MessageResponse, SessionChannel, UserId,
};

pub const AWAIT_TIMEOUT: Duration = Duration::from_secs(5);
pub const SHORT_TIMEOUT: Duration = Duration::from_millis(300);
pub const CLOSE_AFTER_ACK_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct TestUser {
    pub id: UserId,
    pub name: String,
}

impl TestUser {
    pub fn member(&self) -> Member {
        Member::new(self.id.clone(), self.name.clone())
    }
}

pub fn user_one() -> TestUser {
    TestUser {
        id: UserId::from("64b7f0c2a1b2c3d4e5f60001"),
        name: "userOne".to_string(),
    }
}

pub fn user_two() -> TestUser {
    TestUser {
        id: UserId::from("64b7f0c2a1b2c3d4e5f60002"),
        name: "userTwo".to_string(),
    }
}

pub fn user_three() -> TestUser {
    TestUser {
        id: UserId::from("64b7f0c2a1b2c3d4e5f60003"),
        name: "userThree".to_string(),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackendOptions {
    /// Send the `connected` ack after the handshake.
    pub send_ack: bool,
    /// Emit creation responses to every socket instead of just participants.
    pub broadcast_creations: bool,
    /// Send junk frames ahead of the ack.
    pub noise: bool,
    /// Hang up [`CLOSE_AFTER_ACK_DELAY`] after the ack.
    pub close_after_ack: bool,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            send_ack: true,
            broadcast_creations: false,
            noise: false,
            close_after_ack: false,
        }
    }
}

type Outbox = mpsc::UnboundedSender<String>;

struct StoredConversation {
    id: ConversationId,
    name: String,
    owner_id: UserId,
    owner_name: String,
    members: Vec<Member>,
    created_at: DateTime<Utc>,
    participants: BTreeSet<String>,
}

impl StoredConversation {
    /// Each participant sees the conversation named after the other side.
    fn view_for(&self, user: &UserId) -> Conversation {
        let name = if *user == self.owner_id {
            self.name.clone()
        } else {
            self.owner_name.clone()
        };
        Conversation {
            id: self.id.clone(),
            name,
            owner_id: self.owner_id.clone(),
            members: self.members.clone(),
            created_at: self.created_at,
        }
    }
}

#[derive(Default)]
struct BackendState {
    next_id: u64,
    sockets: HashMap<u64, (UserId, Outbox)>,
    rooms: HashMap<ConversationId, Vec<u64>>,
    conversations: Vec<StoredConversation>,
}

impl BackendState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn send_to(&self, conn: u64, event: &ServerEvent) {
        if let Some((_, outbox)) = self.sockets.get(&conn) {
            let _ = outbox.send(serde_json::to_string(event).unwrap());
        }
    }

    fn create_conversation(&mut self, request: CreateConversation, broadcast: bool) {
        let draft = request.conversation_request;
        let participants: BTreeSet<String> = std::iter::once(draft.owner_id.to_string())
            .chain(draft.members.iter().map(|m| m.id.to_string()))
            .collect();

        let existing = self
            .conversations
            .iter()
            .position(|c| c.participants == participants);
        let index = match existing {
            Some(index) => index,
            None => {
                let id = ConversationId::new(format!("conv-{}", self.next_id()));
                self.conversations.push(StoredConversation {
                    id,
                    name: draft.name,
                    owner_id: draft.owner_id,
                    owner_name: draft.owner_name,
                    members: draft.members,
                    created_at: draft.created_at,
                    participants,
                });
                self.conversations.len() - 1
            }
        };

        let conversation = &self.conversations[index];
        let text = request.init_message_request.text;
        for (conn, (user, _)) in &self.sockets {
            let involved = conversation.participants.contains(user.as_str());
            if !involved && !broadcast {
                continue;
            }
            let event = ServerEvent::CreateConversationResponse(CreateConversationResponse {
                conversation_response: conversation.view_for(user),
                message_response: MessageText { text: text.clone() },
            });
            self.send_to(*conn, &event);
        }
    }

    fn relay_message(&mut self, from: u64, request: chat_client::MessageRequest) {
        let id = MessageId::new(format!("msg-{}", self.next_id()));
        let event = ServerEvent::Message(MessageResponse {
            id: Some(id),
            sender_id: request.sender_id,
            conversation_id: request.conversation_id.clone(),
            text: request.text,
            created_at: request.created_at,
        });
        if let Some(room) = self.rooms.get(&request.conversation_id) {
            for conn in room.iter().filter(|c| **c != from) {
                self.send_to(*conn, &event);
            }
        }
    }

    fn drop_connection(&mut self, conn: u64) {
        self.sockets.remove(&conn);
        for room in self.rooms.values_mut() {
            room.retain(|c| *c != conn);
        }
    }
}

pub struct FakeBackend {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl FakeBackend {
    pub async fn start() -> Self {
        Self::start_with(BackendOptions::default()).await
    }

    pub async fn start_with(options: BackendOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(BackendState::default()));

        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(handle_connection(stream, state.clone(), options));
            }
        });

        Self { addr, task }
    }

    pub fn socket_url(&self) -> Url {
        Url::parse(&format!("ws://{}/socket", self.addr)).unwrap()
    }

    pub fn channel(&self) -> SessionChannel {
        self.channel_with_timeout(AWAIT_TIMEOUT)
    }

    pub fn channel_with_timeout(&self, await_timeout: Duration) -> SessionChannel {
        SessionChannel::new(self.socket_url(), await_timeout)
    }

    /// Opened and acked channel for `user`.
    pub async fn connect(&self, user: &TestUser) -> SessionChannel {
        let mut channel = self.channel();
        channel.open(user.id.clone()).await.unwrap();
        channel.wait_until_ready().await.unwrap();
        channel
    }
}

impl Drop for FakeBackend {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn handle_connection(stream: TcpStream, state: Arc<Mutex<BackendState>>, options: BackendOptions) {
    let mut user_id: Option<String> = None;
    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        user_id = req.uri().query().and_then(|query| {
            url::form_urlencoded::parse(query.as_bytes())
                .find(|(key, _)| key == "user_id")
                .map(|(_, value)| value.into_owned())
        });
        Ok(resp)
    };
    let Ok(ws) = accept_hdr_async(stream, callback).await else {
        return;
    };
    let Some(user_id) = user_id.map(UserId::from) else {
        return;
    };

    let (mut sink, mut source) = ws.split();
    let (outbox, mut outbox_rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        while let Some(text) = outbox_rx.recv().await {
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    if options.noise {
        let _ = outbox.send("not json at all".to_string());
        let _ = outbox.send(r#"{"event":"typing","data":{}}"#.to_string());
    }

    let conn = {
        let mut state = state.lock().unwrap();
        let conn = state.next_id();
        state.sockets.insert(conn, (user_id.clone(), outbox.clone()));
        conn
    };

    if options.send_ack {
        let ack = ServerEvent::Connected {
            user_id: user_id.clone(),
        };
        let _ = outbox.send(serde_json::to_string(&ack).unwrap());
    }

    if options.close_after_ack {
        tokio::time::sleep(CLOSE_AFTER_ACK_DELAY).await;
        state.lock().unwrap().drop_connection(conn);
        // the writer drains, then sends a close frame once its last sender is gone
        drop(outbox);
        let _ = writer.await;
        return;
    }

    while let Some(Ok(frame)) = source.next().await {
        let text = match frame {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let Ok(event) = serde_json::from_str::<ClientEvent>(&text) else {
            let error = ServerEvent::Error {
                message: "unrecognized frame".to_string(),
            };
            let _ = outbox.send(serde_json::to_string(&error).unwrap());
            continue;
        };
        let mut state = state.lock().unwrap();
        match event {
            ClientEvent::CreateConversation(request) => {
                state.create_conversation(request, options.broadcast_creations)
            }
            ClientEvent::JoinConversation { conversation_id } => {
                state.rooms.entry(conversation_id).or_default().push(conn);
            }
            ClientEvent::SendMessage(request) => state.relay_message(conn, request),
        }
    }

    state.lock().unwrap().drop_connection(conn);
    writer.abort();
}
