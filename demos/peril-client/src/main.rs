use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::select_all;
use peril::prelude::*;
use peril::protocol::routing;
use peril::transport::BrokerChannel;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::sync::watch;

// ---------------------------------------------------------------------------
// Local army
// ---------------------------------------------------------------------------

/// This player's units, shared between the command loop and the handlers.
#[derive(Debug, Clone)]
struct Army(Arc<Mutex<Player>>);

impl Army {
    fn new(username: &str) -> Self {
        Self(Arc::new(Mutex::new(Player {
            username: username.to_string(),
            units: Default::default(),
        })))
    }

    fn lock(&self) -> MutexGuard<'_, Player> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn username(&self) -> String {
        self.lock().username.clone()
    }

    fn snapshot(&self) -> Player {
        self.lock().clone()
    }

    fn spawn(&self, rank: UnitRank, location: Location) -> u32 {
        let mut player = self.lock();
        let id = player.units.keys().next_back().map_or(1, |last| last + 1);
        player.units.insert(id, Unit { id, rank, location });
        id
    }

    /// Moves every unit to `location`; returns the move to announce.
    fn move_all(&self, location: Location) -> ArmyMove {
        let mut player = self.lock();
        for unit in player.units.values_mut() {
            unit.location = location;
        }
        ArmyMove {
            units: player.units.values().cloned().collect(),
            player: player.clone(),
            to_location: location,
        }
    }

    fn holds(&self, location: Location) -> bool {
        self.lock().units.values().any(|u| u.location == location)
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

fn handle_pause(state: PlayingState) -> AckType {
    if state.is_paused {
        println!("the game is paused");
    } else {
        println!("the game is running");
    }
    AckType::Ack
}

/// Another player's move. Landing on one of our locations means war.
async fn handle_move<C: BrokerChannel>(
    army: &Army,
    publisher: &Publisher<C>,
    mv: ArmyMove,
) -> AckType {
    let me = army.username();
    // Our own moves come back through the wildcard binding.
    if mv.player.username == me {
        return AckType::NackDiscard;
    }
    if !army.holds(mv.to_location) {
        println!("{} moved to {}", mv.player.username, mv.to_location);
        return AckType::Ack;
    }

    let war = RecognitionOfWar {
        attacker: mv.player,
        defender: army.snapshot(),
    };
    match publisher
        .publish(EXCHANGE_PERIL_TOPIC, &routing::war_key(&me), &war)
        .await
    {
        Ok(()) => AckType::Ack,
        Err(e) => {
            tracing::error!(error = %e, "failed to declare war");
            AckType::NackRequeue
        }
    }
}

/// The war queue is shared by every client; leave other players' wars for
/// them.
fn handle_war(army: &Army, war: RecognitionOfWar) -> AckType {
    let me = army.username();
    if war.attacker.username != me && war.defender.username != me {
        return AckType::NackRequeue;
    }
    println!(
        "war in progress: {} attacks {}",
        war.attacker.username, war.defender.username
    );
    AckType::Ack
}

// ---------------------------------------------------------------------------
// Command loop
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Spawn(UnitRank, Location),
    Move(Location),
    Status,
    Help,
    Quit,
    Invalid(String),
}

fn parse_location(word: &str) -> Option<Location> {
    Some(match word {
        "americas" => Location::Americas,
        "europe" => Location::Europe,
        "africa" => Location::Africa,
        "asia" => Location::Asia,
        "antarctica" => Location::Antarctica,
        "australia" => Location::Australia,
        _ => return None,
    })
}

fn parse_rank(word: &str) -> Option<UnitRank> {
    Some(match word {
        "infantry" => UnitRank::Infantry,
        "cavalry" => UnitRank::Cavalry,
        "artillery" => UnitRank::Artillery,
        _ => return None,
    })
}

impl Command {
    fn parse(line: &str) -> Option<Self> {
        let mut words = line.split_whitespace();
        let command = words.next()?;
        let args: Vec<&str> = words.collect();
        let invalid = || Self::Invalid(line.trim().to_string());
        Some(match (command, args.as_slice()) {
            ("spawn", [location, rank]) => match (parse_location(location), parse_rank(rank)) {
                (Some(location), Some(rank)) => Self::Spawn(rank, location),
                _ => invalid(),
            },
            ("move", [location]) => parse_location(location).map_or_else(invalid, Self::Move),
            ("status", []) => Self::Status,
            ("help", _) => Self::Help,
            ("quit", _) => Self::Quit,
            _ => invalid(),
        })
    }
}

fn print_help() {
    println!("Commands:");
    println!("  spawn <location> <rank>  add a unit (infantry, cavalry, artillery)");
    println!("  move <location>          move every unit and announce it");
    println!("  status                   list your units");
    println!("  quit                     leave the game");
}

#[derive(Debug, PartialEq, Eq)]
enum Input {
    Line(String),
    Closed,
    Interrupted,
    Stopped,
}

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

/// Resolves once any of `subscriptions` has terminated.
async fn any_terminated(subscriptions: &[Subscription]) {
    let waits = subscriptions.iter().map(|sub| {
        let mut state: watch::Receiver<SubscriptionState> = sub.watch_state();
        Box::pin(async move {
            let _ = state
                .wait_for(|s| *s == SubscriptionState::Terminated)
                .await;
        })
    });
    select_all(waits).await;
}

async fn run<B: Broker>(client: PerilClient<B>, username: &str) -> Result<(), PerilError> {
    client.provision().await?;
    let army = Army::new(username);
    let publisher = Arc::new(client.publisher().await?);

    let pause = Binding::new(
        EXCHANGE_PERIL_DIRECT,
        routing::pause_queue(username),
        PAUSE_KEY,
        QueueDurability::Transient,
    )?;
    let moves = Binding::new(
        EXCHANGE_PERIL_TOPIC,
        routing::army_moves_queue(username),
        routing::wildcard(routing::ARMY_MOVES_PREFIX),
        QueueDurability::Transient,
    )?;
    let wars = Binding::new(
        EXCHANGE_PERIL_TOPIC,
        routing::WAR_QUEUE,
        routing::wildcard(routing::WAR_RECOGNITIONS_PREFIX),
        QueueDurability::Durable,
    )?;

    let move_army = army.clone();
    let move_publisher = Arc::clone(&publisher);
    let war_army = army.clone();
    let subscriptions = vec![
        client.subscribe(&pause, handle_pause).await?,
        client
            .subscribe(
                &moves,
                AsyncHandler(move |mv: ArmyMove| {
                    let army = move_army.clone();
                    let publisher = Arc::clone(&move_publisher);
                    async move { handle_move(&army, &publisher, mv).await }
                }),
            )
            .await?,
        client
            .subscribe(&wars, move |war: RecognitionOfWar| handle_war(&war_army, war))
            .await?,
    ];

    println!("welcome, {username}");
    print_help();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match next_input(&mut lines, any_terminated(&subscriptions)).await {
            Input::Line(line) => line,
            Input::Closed | Input::Interrupted => break,
            Input::Stopped => {
                tracing::error!("a subscription stopped");
                break;
            }
        };

        match Command::parse(&line) {
            None => continue,
            Some(Command::Spawn(rank, location)) => {
                let id = army.spawn(rank, location);
                println!("spawned unit {id} in {location}");
            }
            Some(Command::Move(location)) => {
                let mv = army.move_all(location);
                let key = routing::army_moves_key(username);
                match publisher.publish(EXCHANGE_PERIL_TOPIC, &key, &mv).await {
                    Ok(()) => println!("moved {} unit(s) to {location}", mv.units.len()),
                    Err(e) => tracing::error!(error = %e, "failed to publish move"),
                }
            }
            Some(Command::Status) => {
                for unit in army.snapshot().units.values() {
                    println!("  #{} {:?} in {}", unit.id, unit.rank, unit.location);
                }
            }
            Some(Command::Help) => print_help(),
            Some(Command::Quit) => break,
            Some(Command::Invalid(line)) => println!("can't do '{line}', try 'help'"),
        }
    }

    tracing::info!("leaving the game");
    client.close().await?;
    for subscription in subscriptions {
        subscription.wait().await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), PerilError> {
    peril::init_tracing();
    let mut args = std::env::args().skip(1);
    let Some(username) = args.next() else {
        eprintln!("usage: peril-client <username> [memory]");
        return Ok(());
    };
    let config = PerilConfig::load()?;

    // `peril-client <name> memory` runs against an in-process broker.
    if args.next().as_deref() == Some("memory") {
        let client = PerilClientBuilder::from_config(&config).with_broker(MemoryBroker::new());
        return run(client, &username).await;
    }

    let client = PerilClientBuilder::from_config(&config)
        .connection_name(&format!("peril-client-{username}"))
        .connect()
        .await?;
    run(client, &username).await
}
