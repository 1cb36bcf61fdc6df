use std::{io, sync::Arc};

use anyhow::{Context, Result};
use chat_broker::{
    broker::Broker,
    cli::Cli,
    message::{Message, UserId, read_message, write_message},
};
use clap::Parser;
use futures_util::future::join_all;
use serde::Serialize;
use tokio::{
    io::{BufReader, Stdout},
    select,
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

type SharedStdout = Arc<Mutex<Stdout>>;

#[derive(Serialize)]
struct Delivery<'a> {
    user: &'a str,
    message: &'a Message,
}

enum InputEnd {
    Closed,
    Interrupted,
}

enum Inbox {
    Bounded(mpsc::Receiver<Message>),
    Unbounded(mpsc::UnboundedReceiver<Message>),
}

impl Inbox {
    async fn recv(&mut self) -> Option<Message> {
        match self {
            Inbox::Bounded(rx) => rx.recv().await,
            Inbox::Unbounded(rx) => rx.recv().await,
        }
    }
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let shutdown = CancellationToken::new();
    let broker = Broker::with_config(shutdown.clone(), cli.broker_config())
        .context("invalid broker configuration")?;
    let stdout: SharedStdout = Arc::new(Mutex::new(tokio::io::stdout()));

    let mut consumers = Vec::new();
    for user in cli.unique_users() {
        let inbox = open_mailbox(&broker, &user, cli.mailbox_capacity).await;
        consumers.push(spawn_consumer(user, inbox, Arc::clone(&stdout), shutdown.clone()));
    }

    let dispatcher = tokio::spawn({
        let broker = broker.clone();
        async move { broker.run().await }
    });
    info!(users = ?broker.registered_users().await, "broker ready");

    let pumped = pump_stdin(&broker).await;
    if let Ok(InputEnd::Closed) = pumped {
        // Let everything read from stdin reach its mailbox; consumers drain
        // their inboxes before exiting.
        broker.flushed().await;
    }
    shutdown.cancel();

    dispatcher
        .await
        .context("dispatch task panicked")?
        .context("dispatch loop failed")?;
    for consumer in join_all(consumers).await {
        consumer.context("consumer task panicked")??;
    }

    pumped.map(|_| ())
}

async fn open_mailbox(broker: &Broker, user: &str, capacity: usize) -> Inbox {
    if capacity == 0 {
        let (tx, rx) = mpsc::unbounded_channel();
        broker.register_user(user, tx).await;
        Inbox::Unbounded(rx)
    } else {
        let (tx, rx) = mpsc::channel(capacity);
        broker.register_user(user, tx).await;
        Inbox::Bounded(rx)
    }
}

fn spawn_consumer(
    user: UserId,
    mut inbox: Inbox,
    stdout: SharedStdout,
    shutdown: CancellationToken,
) -> JoinHandle<Result<()>> {
    tokio::spawn(async move {
        loop {
            // Drain whatever already arrived before honouring shutdown.
            select! {
                biased;
                received = inbox.recv() => {
                    let Some(message) = received else { break };
                    emit_delivery(&stdout, &user, &message).await?;
                }
                _ = shutdown.cancelled() => break,
            }
        }
        Ok(())
    })
}

async fn emit_delivery(stdout: &SharedStdout, user: &str, message: &Message) -> Result<()> {
    let mut stdout = stdout.lock().await;
    write_message(&mut *stdout, &Delivery { user, message })
        .await
        .with_context(|| format!("failed to print delivery for {user}"))
}

async fn pump_stdin(broker: &Broker) -> Result<InputEnd> {
    let mut stdin = BufReader::new(tokio::io::stdin());

    loop {
        select! {
            line = read_message::<_, Message>(&mut stdin) => {
                match line {
                    Ok(Some(message)) => submit(broker, message).await?,
                    Ok(None) => {
                        info!("stdin closed, shutting down");
                        return Ok(InputEnd::Closed);
                    }
                    Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                        warn!(error = %err, "skipping malformed message line");
                    }
                    Err(err) => return Err(err).context("failed to read stdin"),
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                return Ok(InputEnd::Interrupted);
            }
        }
    }
}

async fn submit(broker: &Broker, message: Message) -> Result<()> {
    let message = if message.timestamp == 0 {
        Message {
            timestamp: chrono::Utc::now().timestamp(),
            ..message
        }
    } else {
        message
    };

    broker
        .send_message(message)
        .await
        .context("broker rejected message")
}
