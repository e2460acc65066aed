use clap::Parser;
use client::network::{Supervisor, SupervisorConfig};
use shared::{ClientMessage, ServerMessage, ServerMessageKind, Session};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncBufReadExt;

/// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// WebSocket URL of the planning poker server
    #[clap(short, long, default_value = "ws://127.0.0.1:8080")]
    server: String,
    /// Display name to appear under in the session
    #[clap(short, long)]
    name: String,
    /// Join code of an existing session; omit to create a new one
    #[clap(short, long)]
    join: Option<String>,
    /// Name for a newly created session
    #[clap(long, default_value = "Planning Session")]
    session_name: String,
    /// Join as an observer instead of a voter
    #[clap(short, long)]
    observer: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let mut supervisor = Supervisor::new(SupervisorConfig::new(&args.server));
    let session_id = Arc::new(Mutex::new(None::<String>));
    register_handlers(&mut supervisor, Arc::clone(&session_id));
    let handle = supervisor.handle();

    // Queued now, delivered once the connection is up
    match args.join {
        Some(code) => handle.send(ClientMessage::SessionJoin {
            join_code: code,
            participant_name: args.name.clone(),
            as_observer: args.observer,
        }),
        None => handle.send(ClientMessage::SessionCreate {
            session_name: args.session_name.clone(),
            participant_name: args.name.clone(),
        }),
    };

    let runner = tokio::spawn(async move {
        supervisor.run().await;
    });

    print_help();
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            handle.disconnect();
            break;
        }
        if line == "/help" {
            print_help();
            continue;
        }
        let Some(current) = session_id.lock().ok().and_then(|id| id.clone()) else {
            println!("Not in a session yet.");
            continue;
        };
        let message = match line.split_once(' ') {
            Some(("/start", story)) => ClientMessage::VotingStart {
                session_id: current,
                story: story.to_string(),
                description: None,
            },
            Some(("/add", title)) => ClientMessage::StoryAdd {
                session_id: current,
                title: title.to_string(),
                description: None,
            },
            None if line == "/reveal" => ClientMessage::VoteReveal {
                session_id: current,
            },
            None if line == "/reset" => ClientMessage::VoteReset {
                session_id: current,
            },
            None if line == "/next" => ClientMessage::StoryNext {
                session_id: current,
            },
            None if line == "/leave" => ClientMessage::SessionLeave {
                session_id: current,
            },
            _ if line.starts_with('/') => {
                println!("Unknown command: {}", line);
                continue;
            }
            _ => ClientMessage::VoteSelect {
                session_id: current,
                value: line.to_string(),
            },
        };
        if !handle.send(message) {
            break;
        }
    }

    handle.disconnect();
    let _ = runner.await;
    Ok(())
}

fn register_handlers(supervisor: &mut Supervisor, session_id: Arc<Mutex<Option<String>>>) {
    let bus = supervisor.bus_mut();

    let captured = Arc::clone(&session_id);
    bus.on(ServerMessageKind::SessionCreated, move |message| {
        if let ServerMessage::SessionCreated {
            session, join_code, ..
        } = message
        {
            if let Ok(mut id) = captured.lock() {
                *id = Some(session.id.clone());
            }
            println!("Session created. Share this code: {}", join_code);
            render(session);
        }
    });

    let captured = Arc::clone(&session_id);
    bus.on(ServerMessageKind::SessionJoined, move |message| {
        if let ServerMessage::SessionJoined { session, .. } = message {
            if let Ok(mut id) = captured.lock() {
                *id = Some(session.id.clone());
            }
            println!("Joined session '{}'.", session.name);
            render(session);
        }
    });

    bus.on(ServerMessageKind::SessionUpdated, |message| {
        if let ServerMessage::SessionUpdated { session } = message {
            render(session);
        }
    });

    let captured = Arc::clone(&session_id);
    bus.on(ServerMessageKind::SessionLeft, move |_| {
        if let Ok(mut id) = captured.lock() {
            *id = None;
        }
        println!("Left the session.");
    });

    bus.on(ServerMessageKind::SessionError, |message| {
        if let ServerMessage::SessionError { message, code } = message {
            println!("Error ({:?}): {}", code, message);
        }
    });

    bus.on(ServerMessageKind::ParticipantJoined, |message| {
        if let ServerMessage::ParticipantJoined { participant, .. } = message {
            println!("{} joined.", participant.name);
        }
    });

    bus.on(ServerMessageKind::ParticipantLeft, |_| {
        println!("A participant left.");
    });

    bus.on(ServerMessageKind::ParticipantVoted, |message| {
        if let ServerMessage::ParticipantVoted { value, .. } = message {
            match value {
                Some(value) => println!("A participant voted: {}", value),
                None => println!("A participant voted."),
            }
        }
    });
}

fn render(session: &Session) {
    println!("--- {} [{:?}] ---", session.name, session.status);
    if let Some(story) = &session.current_story {
        println!("Story: {}", story);
    }
    for participant in &session.participants {
        let vote = if participant.is_observer {
            "(observer)".to_string()
        } else if session.cards_revealed {
            participant
                .selected_value
                .clone()
                .unwrap_or_else(|| "-".to_string())
        } else if participant.has_voted() {
            "✓".to_string()
        } else {
            "…".to_string()
        };
        let host = if participant.id == session.host_id {
            " (host)"
        } else {
            ""
        };
        println!("  {}{}: {}", participant.name, host, vote);
    }
    if !session.story_queue.is_empty() {
        let done = session.story_queue.iter().filter(|s| s.estimated).count();
        println!("Stories estimated: {}/{}", done, session.story_queue.len());
    }
}

fn print_help() {
    println!("Deck: {}", shared::CARD_VALUES.join(" "));
    println!("Commands:");
    println!("  <value>          cast a vote (e.g. 5, 13, ?)");
    println!("  /start <story>   start voting on a story (host)");
    println!("  /add <title>     queue a story (host)");
    println!("  /next            advance to the next queued story (host)");
    println!("  /reveal          reveal all cards (host)");
    println!("  /reset           clear votes (host)");
    println!("  /leave           leave the session");
    println!("  /quit            exit");
}
