use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use chat_client::{
    ChatError, ChatService, ClientConfig, ConversationId, MessageRequest, Result, SessionChannel,
    UserId,
};

/// Command-line driver for the chat client.
#[derive(Parser)]
#[command(name = "chat-client")]
#[command(about = "Query conversations and talk to the chat socket")]
#[command(version)]
struct Cli {
    /// Config file (defaults to the platform config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// HTTP API base URL
    #[arg(long, global = true)]
    api: Option<String>,

    /// Socket URL
    #[arg(long, global = true)]
    socket: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the conversations a user belongs to
    Conversations { user_id: String },

    /// Print a conversation's message history
    Messages { conversation_id: String },

    /// Open a session and print inbound messages until Ctrl-C
    Listen {
        user_id: String,

        /// Conversations to join after connecting
        #[arg(long = "join")]
        join: Vec<String>,
    },

    /// Send one message to a conversation
    Send {
        user_id: String,
        conversation_id: String,
        text: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> std::result::Result<ClientConfig, chat_client::ConfigError> {
    let mut config = match &cli.config {
        Some(path) => ClientConfig::load_from(path)?,
        None => ClientConfig::load(),
    };
    if let Some(api) = &cli.api {
        config.api_base_url = api.clone();
    }
    if let Some(socket) = &cli.socket {
        config.socket_url = Some(socket.clone());
    }
    Ok(config)
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Conversations { user_id } => {
            let service = ChatService::from_config(&config)?;
            for conversation in service.fetch_all_conversations(&UserId::from(user_id)).await? {
                let members: Vec<&str> =
                    conversation.members.iter().map(|m| m.name.as_str()).collect();
                println!(
                    "{}\t{}\towner={}\tmembers={}",
                    conversation.id,
                    conversation.name,
                    conversation.owner_id,
                    members.join(",")
                );
            }
        }
        Commands::Messages { conversation_id } => {
            let service = ChatService::from_config(&config)?;
            let messages = service
                .fetch_all_messages(&ConversationId::from(conversation_id))
                .await?;
            for message in messages {
                println!("[{}] {}: {}", message.created_at, message.sender_id, message.text);
            }
        }
        Commands::Listen { user_id, join } => {
            let channel = open_session(&config, UserId::from(user_id)).await?;
            for conversation_id in join {
                channel.join_conversation(ConversationId::from(conversation_id)).await?;
            }
            let outcome = listen(&channel).await;
            channel.disconnect().await;
            outcome?;
        }
        Commands::Send {
            user_id,
            conversation_id,
            text,
        } => {
            let user_id = UserId::from(user_id);
            let conversation_id = ConversationId::from(conversation_id);
            let channel = open_session(&config, user_id.clone()).await?;
            channel.join_conversation(conversation_id.clone()).await?;
            let outcome = channel
                .send_message(MessageRequest::new(user_id, conversation_id, text))
                .await;
            channel.disconnect().await;
            outcome?;
        }
    }
    Ok(())
}

async fn open_session(config: &ClientConfig, user_id: UserId) -> Result<SessionChannel> {
    let mut channel = SessionChannel::from_config(config)?;
    channel.open(user_id).await?;
    if let Err(e) = channel.wait_until_ready().await {
        channel.disconnect().await;
        return Err(e);
    }
    Ok(channel)
}

async fn listen(channel: &SessionChannel) -> Result<()> {
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            next = channel.await_message() => match next {
                Ok(message) => println!(
                    "[{}] {} @ {}: {}",
                    message.created_at, message.sender_id, message.conversation_id, message.text
                ),
                Err(ChatError::Timeout(_)) => continue,
                Err(e) => return Err(e),
            },
        }
    }
}
