//! Session Engine - interactive chat against a local Ollama server
//!
//! Reads prompts from stdin and streams replies to stdout. Logs go to
//! stderr as JSON.

use session_engine::llm::{ChatTransport, LoggingTransport, OllamaTransport};
use session_engine::{ConversationSession, SessionConfig, SessionEvent, SessionState, SubmitOutcome};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "session_engine=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false)
                .with_writer(std::io::stderr),
        )
        .init();

    // Configuration
    let config = SessionConfig::from_env()?;
    tracing::info!(host = %config.host, model = %config.model, "Configuration loaded");

    let ollama = OllamaTransport::new(&config.host, config.request_timeout())?;
    let transport: Arc<dyn ChatTransport> = Arc::new(LoggingTransport::new(Arc::new(ollama)));

    let (session, events) = ConversationSession::new(config, transport)?;
    let printer = tokio::spawn(print_events(ReceiverStream::new(events)));

    if let Err(e) = session.ensure_model_ready().await {
        tracing::warn!(kind = %e.kind, error = %e, "Model is not ready; requests may fail");
    }
    let connection = session.start_connection_monitor().await;

    eprintln!("Type a message. Commands: /cancel /new /status /quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match line.trim() {
                    "" => {}
                    "/quit" => break,
                    "/cancel" => session.cancel().await,
                    "/new" => {
                        if let Err(reason) = session.new_conversation().await {
                            eprintln!("[new conversation refused: {reason}]");
                        }
                    }
                    "/status" => {
                        eprintln!(
                            "[state: {} | backend: {:?} | ~{} tokens]",
                            session.state(),
                            *connection.borrow(),
                            session.estimated_tokens().await
                        );
                    }
                    text => {
                        if let SubmitOutcome::Rejected(reason) = session.submit(text).await {
                            eprintln!("[rejected: {reason}]");
                        }
                    }
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal?;
                // First Ctrl-C stops the reply, a second one at rest exits
                if session.state().is_busy() {
                    session.cancel().await;
                } else {
                    break;
                }
            }
        }
    }

    session.shutdown().await;
    // Last handle gone closes the event channel, which ends the printer
    drop(session);
    printer.await?;
    Ok(())
}

async fn print_events(mut events: ReceiverStream<SessionEvent>) {
    let mut stdout = tokio::io::stdout();
    while let Some(event) = events.next().await {
        let text = match event {
            SessionEvent::Fragment(fragment) => fragment.content,
            SessionEvent::StateChanged {
                from,
                to: SessionState::Idle,
            } if from.is_busy() => "\n".to_string(),
            SessionEvent::StateChanged { .. } => continue,
            SessionEvent::Error(error) => {
                eprintln!("\n[{}] {error}", error.kind);
                continue;
            }
        };
        if stdout.write_all(text.as_bytes()).await.is_err() || stdout.flush().await.is_err() {
            tracing::warn!("stdout closed; no longer printing replies");
            return;
        }
    }
}
