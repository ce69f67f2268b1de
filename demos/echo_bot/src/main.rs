//! Echo Bot Example
//!
//! Reads one event per stdin line and prints the bot's replies, so the
//! dispatcher can be tried without a platform connection.
//!
//! ```text
//! hello            message in chat 1
//! 42: /ping        message in chat 42
//! ```
//!
//! # Usage
//!
//! ```bash
//! cargo run --package echo-bot -- --workers 2 --shard-by-chat
//! ```

use std::any::Any;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use clap::Parser;
use gramflow::prelude::*;
use gramflow::runtime::ConfigLoader;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(about = "Echo bot over stdin/stdout")]
struct Args {
    /// Configuration file (defaults to ./gramflow.toml if present).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Configuration profile.
    #[arg(short, long)]
    profile: Option<String>,

    /// Worker count, overriding the configuration.
    #[arg(short, long)]
    workers: Option<usize>,

    /// Pin each chat to one worker.
    #[arg(long)]
    shard_by_chat: bool,
}

// ============================================================================
// Console bot
// ============================================================================

/// Prints outbound messages instead of calling a platform.
struct ConsoleBot {
    next_message_id: AtomicI64,
}

#[async_trait]
impl Bot for ConsoleBot {
    fn id(&self) -> &str {
        "console"
    }

    async fn call_api(&self, method: &str, params: Value) -> ApiResult<Value> {
        match method {
            "send_message" => {
                let peer_id = params["chat_id"].as_i64().ok_or(ApiError::MissingPeer)?;
                let text = params["text"].as_str().unwrap_or_default();
                let id = self.send_message(peer_id, text).await?;
                Ok(json!({ "message_id": id }))
            }
            other => Err(ApiError::Platform {
                code: 404,
                message: format!("unknown method {other}"),
            }),
        }
    }

    async fn send_message(&self, peer_id: i64, text: &str) -> ApiResult<i64> {
        println!("[{peer_id}] bot: {text}");
        Ok(self.next_message_id.fetch_add(1, Ordering::Relaxed))
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn start() -> &'static str {
    "Hi! Send /help to see what I can do."
}

async fn help() -> &'static str {
    "/echo <text>  echo text\n/ping         pong\n/info         event info\nanything else is echoed"
}

async fn echo(args: CommandArgs) -> Result<String, &'static str> {
    if args.args.is_empty() {
        Err("nothing to echo")
    } else {
        Ok(args.args)
    }
}

async fn event_info(event: Arc<Event>, ChatId(chat): ChatId) -> String {
    format!(
        "event {}\nchat {chat}\nreceived {:?}",
        event.id(),
        event.timestamp()
    )
}

/// Uses the bot directly instead of returning a reply.
async fn ping(ctx: Arc<Context>, BotRef(bot): BotRef<ConsoleBot>) -> Result<(), HandlerError> {
    let chat = ctx.event().chat_id().ok_or(ApiError::MissingPeer)?;
    ctx.limiter()
        .call(chat, 1.0, || bot.send_message(chat, "pong"))
        .await
        .map_err(ApiError::from)??;
    Ok(())
}

async fn fallback(Text(text): Text) -> String {
    text
}

// ============================================================================
// Transport
// ============================================================================

/// Parses `"<chat>: <text>"`, defaulting to chat 1.
fn parse_line(line: &str) -> Event {
    let (chat, text) = line
        .split_once(':')
        .and_then(|(chat, text)| Some((chat.trim().parse().ok()?, text.trim())))
        .unwrap_or((1, line.trim()));
    Event::message(chat, text).from_id(chat).build()
}

async fn read_stdin(queue: EventQueue) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        if let Err(e) = queue.push(parse_line(&line)).await {
            warn!(error = %e, "Dropped input line");
        }
    }
    info!("stdin closed");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut loader = ConfigLoader::new();
    if let Some(path) = &args.config {
        loader = loader.file(path);
    }
    if let Some(profile) = &args.profile {
        loader = loader.profile(profile);
    }
    let mut config = loader.load()?;
    if let Some(workers) = args.workers {
        config.dispatcher.worker_count = workers;
    }
    config.dispatcher.shard_by_chat |= args.shard_by_chat;

    let bot = Arc::new(ConsoleBot {
        next_message_id: AtomicI64::new(1),
    });
    let runtime = GramflowRuntime::from_config(config, bot)?;

    runtime.use_middleware(TracingMiddleware);
    runtime
        .on(filter::command("start"))
        .name("start")
        .priority(10)
        .handler(start);
    runtime.on(filter::command("help")).name("help").handler(help);
    runtime.on(filter::command("echo")).name("echo").handler(echo);
    runtime.on(filter::command("info")).name("info").handler(event_info);
    runtime
        .on(filter::command("ping"))
        .name("ping")
        .middleware(ThrottleMiddleware::new(LimitConfig::new(0.2, 1.0)))
        .handler(ping);
    runtime
        .on(filter::message())
        .name("fallback")
        .priority(-100)
        .handler(fallback);

    info!("Type messages, one per line; Ctrl+D to quit");
    let queue = runtime.queue();
    runtime
        .run_until(async move {
            if let Err(e) = read_stdin(queue).await {
                warn!(error = %e, "stdin transport failed");
            }
        })
        .await?;

    let stats = runtime.stats();
    info!(
        processed = stats.processed,
        failed = stats.failed,
        no_match = stats.no_match,
        "Bye"
    );
    Ok(())
}
