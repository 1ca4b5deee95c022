use peril::prelude::*;
use peril::protocol::routing;
use std::future::Future;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::sync::watch;

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Writes a player's log line. Empty lines are useless, so they go to the
/// dead-letter queue instead of being retried.
fn handle_game_log(log: GameLog) -> AckType {
    if log.message.trim().is_empty() {
        tracing::warn!(username = %log.username, "discarding empty game log");
        return AckType::NackDiscard;
    }
    tracing::info!(
        at = %log.current_time,
        username = %log.username,
        "{}",
        log.message
    );
    AckType::Ack
}

// ---------------------------------------------------------------------------
// Server loop
// ---------------------------------------------------------------------------

enum Command {
    Pause,
    Resume,
    Quit,
    Help,
    Unknown(String),
}

impl Command {
    fn parse(line: &str) -> Option<Self> {
        let word = line.split_whitespace().next()?;
        Some(match word {
            "pause" => Self::Pause,
            "resume" => Self::Resume,
            "quit" => Self::Quit,
            "help" => Self::Help,
            other => Self::Unknown(other.to_string()),
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Input {
    Line(String),
    Closed,
    Interrupted,
    Stopped,
}

/// Waits for the next operator line, Ctrl-C, or `stopped`, whichever
/// comes first.
async fn next_input<R>(lines: &mut Lines<R>, stopped: impl Future<Output = ()>) -> Input
where
    R: AsyncBufRead + Unpin,
{
    tokio::select! {
        line = lines.next_line() => match line {
            Ok(Some(line)) => Input::Line(line),
            Ok(None) => Input::Closed,
            Err(e) => {
                tracing::error!(error = %e, "failed to read stdin");
                Input::Closed
            }
        },
        _ = tokio::signal::ctrl_c() => Input::Interrupted,
        () = stopped => Input::Stopped,
    }
}

/// Resolves once the subscription behind `state` has terminated.
async fn terminated(mut state: watch::Receiver<SubscriptionState>) {
    // A dropped sender also means the loop is gone.
    let _ = state
        .wait_for(|s| *s == SubscriptionState::Terminated)
        .await;
}

fn print_help() {
    println!("Commands:");
    println!("  pause   pause the game for every player");
    println!("  resume  resume the game");
    println!("  quit    shut the server down");
}

async fn run<B: Broker>(client: PerilClient<B>) -> Result<(), PerilError> {
    client.provision().await?;

    let logs = Binding::new(
        EXCHANGE_PERIL_TOPIC,
        routing::GAME_LOG_QUEUE,
        routing::wildcard(routing::GAME_LOG_SLUG),
        QueueDurability::Durable,
    )?;
    let subscription = client.subscribe(&logs, handle_game_log).await?;

    let publisher = client.publisher().await?;
    publisher
        .publish(EXCHANGE_PERIL_DIRECT, PAUSE_KEY, &PlayingState { is_paused: true })
        .await?;
    tracing::info!("game paused until an operator resumes it");

    print_help();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match next_input(&mut lines, terminated(subscription.watch_state())).await {
            Input::Line(line) => line,
            Input::Closed | Input::Interrupted => break,
            Input::Stopped => {
                tracing::error!(queue = subscription.queue(), "game log subscription stopped");
                break;
            }
        };

        let Some(command) = Command::parse(&line) else {
            continue;
        };
        match command {
            Command::Pause | Command::Resume => {
                let state = PlayingState {
                    is_paused: matches!(command, Command::Pause),
                };
                if let Err(e) = publisher.publish(EXCHANGE_PERIL_DIRECT, PAUSE_KEY, &state).await
                {
                    tracing::error!(error = %e, "failed to publish playing state");
                }
            }
            Command::Quit => break,
            Command::Help => print_help(),
            Command::Unknown(word) => println!("unknown command '{word}', try 'help'"),
        }
    }

    tracing::info!("shutting down");
    client.close().await?;
    subscription.wait().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), PerilError> {
    peril::init_tracing();
    let config = PerilConfig::load()?;

    // `peril-server memory` runs against an in-process broker.
    if std::env::args().nth(1).as_deref() == Some("memory") {
        let client = PerilClientBuilder::from_config(&config).with_broker(MemoryBroker::new());
        return run(client).await;
    }

    let client = PerilClientBuilder::from_config(&config)
        .connection_name("peril-server")
        .connect()
        .await?;
    run(client).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_parse() {
        assert!(matches!(Command::parse("  pause now"), Some(Command::Pause)));
        assert!(matches!(Command::parse("quit"), Some(Command::Quit)));
        assert!(matches!(Command::parse("jump"), Some(Command::Unknown(w)) if w == "jump"));
        assert!(Command::parse("   ").is_none());
    }

    #[test]
    fn test_empty_game_log_is_discarded() {
        let log = |message: &str| GameLog {
            current_time: chrono::Utc::now(),
            message: message.to_string(),
            username: "alice".to_string(),
        };
        assert_eq!(handle_game_log(log("  ")), AckType::NackDiscard);
        assert_eq!(handle_game_log(log("alice won a war")), AckType::Ack);
    }

    #[tokio::test]
    async fn test_stopped_subscription_interrupts_idle_input() {
        // The writer stays open, so stdin never yields a line.
        let (_writer, reader) = tokio::io::duplex(64);
        let mut lines = BufReader::new(reader).lines();
        let (_tx, rx) = watch::channel(SubscriptionState::Terminated);

        let input = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            next_input(&mut lines, terminated(rx)),
        )
        .await
        .unwrap();
        assert_eq!(input, Input::Stopped);
    }

    #[tokio::test]
    async fn test_lines_pass_through_while_consuming() {
        let mut lines = BufReader::new(&b"resume\n"[..]).lines();
        let (_tx, rx) = watch::channel(SubscriptionState::Consuming);

        let input = next_input(&mut lines, terminated(rx.clone())).await;
        assert_eq!(input, Input::Line("resume".to_string()));
        let input = next_input(&mut lines, terminated(rx)).await;
        assert_eq!(input, Input::Closed);
    }
}
