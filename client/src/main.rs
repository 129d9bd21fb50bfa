use clap::Parser;
use client::config::ClientConfig;
use client::connection::ConnectionManager;
use client::input::{parse_command, Command};
use client::session::{MoveOutcome, Session};
use log::{error, info, warn};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address, host[:port]
    server: String,

    /// Player name, used as the player id
    player: String,

    /// Pause between snapshot polls in milliseconds
    #[arg(long, default_value = "200")]
    poll_interval_ms: u64,

    /// Connection retries before giving up
    #[arg(long, default_value = "6")]
    connect_retries: u32,
}

async fn print_players(session: &Session, position: (i32, i32)) {
    println!("You ({}) are at {:?}", session.player_id(), position);

    let players = session.remote_players().await;
    let mut ids: Vec<&String> = players.keys().collect();
    ids.sort();
    for id in ids {
        println!("  {} at {:?}", id, players[id].position());
    }
    if session.is_desynchronized() {
        println!("  (view is stale: polling stopped after repeated failures)");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            // Usage problems are not failures.
            let _ = e.print();
            return Ok(());
        }
    };

    let mut config = ClientConfig::default();
    config.session.poll.interval = Duration::from_millis(args.poll_interval_ms);
    config.connect.max_retries = args.connect_retries;

    let manager = ConnectionManager::new(&args.server, args.player.clone(), config);
    info!("Connecting to {} as {}", manager.addr(), args.player);

    let session = match manager.establish().await {
        Ok(session) => session,
        Err(e) => {
            error!("Giving up: {}", e);
            std::process::exit(1);
        }
    };

    let mut position = (0, 0);
    if let MoveOutcome::Lost = session.submit_move(position.0, position.1).await {
        warn!("Initial position was not delivered");
    }

    println!("Commands: w/a/s/d move, p show players, q quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, leaving");
                break;
            }
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("Could not read stdin: {}", e);
                break;
            }
        };

        match parse_command(&line) {
            Ok(Some(Command::Move(direction))) => {
                let (row, col) = direction.apply(position.0, position.1);
                match session.submit_move(row, col).await {
                    MoveOutcome::Accepted { .. } => position = (row, col),
                    MoveOutcome::Rejected | MoveOutcome::Lost => {
                        println!("Move to {:?} did not reach the server", (row, col));
                    }
                }
            }
            Ok(Some(Command::Show)) => print_players(&session, position).await,
            Ok(Some(Command::Quit)) => break,
            Ok(None) => {}
            Err(e) => println!("{}", e),
        }
    }

    session.close().await;
    Ok(())
}
