use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncBufReadExt;

use skadnode::{
    DispatchError, MessageEnvelope, Node, NodeConfig, Opcode, OpcodeFrame, OpcodeRegistry,
    PuzzleParams, ServiceId, WireMessage,
};

const CHAT_SERVICE_ID: ServiceId = 1000;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct ChatMessage {
    nickname: String,
    text: String,
}

impl WireMessage for ChatMessage {
    const OPCODE: Opcode = 1000;
}

#[derive(Parser, Debug)]
#[command(name = "chatroom")]
#[command(about = "A broadcast chatroom on top of skadnode services")]
struct ChatArgs {
    #[arg(long, default_value = "anon")]
    name: String,

    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    #[arg(long, default_value = "0")]
    port: u16,

    /// Comma-separated `host:port` list of peers to bootstrap from.
    #[arg(long, value_delimiter = ',')]
    peers: Vec<String>,

    #[arg(long, default_value = "12")]
    difficulty: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args = ChatArgs::parse();

    let config = NodeConfig {
        bind_addr: format!("{}:{}", args.host, args.port),
        puzzle: PuzzleParams::new(args.difficulty, args.difficulty).context("invalid difficulty")?,
        ..NodeConfig::default()
    };
    let node = Node::bind(config).await.context("failed to bind node")?;

    let mut registry = OpcodeRegistry::<ChatMessage>::new();
    registry.register::<ChatMessage>(|m| m)?;
    let registry = Arc::new(registry);

    node.add_service(CHAT_SERVICE_ID, move |envelope: MessageEnvelope| {
        let registry = registry.clone();
        async move {
            let message = registry.decode(&envelope.payload)?;
            println!(
                "\x1b[32m[{}@{}]\x1b[0m {}",
                message.nickname,
                envelope.sender.short(),
                message.text
            );
            Ok::<Option<Vec<u8>>, DispatchError>(None)
        }
    })?;
    node.start()?;

    println!("╔════════════════════════════════════════════════════════════════╗");
    println!("║                    skadnode Chatroom                           ║");
    println!("╠════════════════════════════════════════════════════════════════╣");
    println!("║ Nickname : {:<52} ║", args.name);
    println!("║ Address  : {:<52} ║", node.local_addr());
    println!("╠════════════════════════════════════════════════════════════════╣");
    println!("║ Peer id:                                                       ║");
    println!("║ {:<64} ║", node.id());
    println!("╚════════════════════════════════════════════════════════════════╝");

    if !args.peers.is_empty() {
        println!("\nBootstrapping from {} peer(s)...", args.peers.len());
        match node.bootstrap(&args.peers).await {
            Ok(connected) => println!("Connected to {connected} bootstrap peer(s)."),
            Err(e) => eprintln!("Bootstrap failed: {e}"),
        }
    }

    println!("\nCommands:");
    println!("  /peers  - List known peers");
    println!("  /quit   - Exit");
    println!("Type anything else to broadcast to every known peer.\n");

    let stdin = tokio::io::stdin();
    let mut stdin_reader = tokio::io::BufReader::new(stdin).lines();

    while let Some(line) = stdin_reader.next_line().await? {
        let line = line.trim();

        if line.is_empty() {
            continue;
        }

        if line == "/quit" {
            println!("Goodbye!");
            break;
        }

        if line == "/peers" {
            let peers = node.peers().await;
            if peers.is_empty() {
                println!("No peers known yet.");
            } else {
                println!("Known peers:");
                for peer in peers {
                    println!("  {} at {}", peer.id.short(), peer.address);
                }
            }
            continue;
        }

        let payload = OpcodeFrame::encode(&ChatMessage {
            nickname: args.name.clone(),
            text: line.to_string(),
        })?;

        let peers = node.peers().await;
        let mut delivered = 0;
        for peer in &peers {
            let envelope = MessageEnvelope::one_way(node.id(), peer.id, CHAT_SERVICE_ID, payload.clone());
            match node.send(envelope).await {
                Ok(()) => delivered += 1,
                Err(e) => eprintln!("\x1b[31m[error]\x1b[0m {}: {}", peer.id.short(), e),
            }
        }
        println!("\x1b[33m[me → {delivered}/{}]\x1b[0m {line}", peers.len());
    }

    node.shutdown().await;
    Ok(())
}
