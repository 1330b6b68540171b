use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use shared::{
    domain::{Ballot, ParticipantId, SessionId, VoteId},
    protocol::{NewVote, VoteChanges},
};
use storage::{NewSession, Storage};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use voting_core::{
    compute_tally,
    config::{load_settings, prepare_database_url},
    ControllerEvent, ControllerOptions, IdentityProvider, SessionDirectory, SessionSyncController,
    StorageBackend, SyncPhase, Tally,
};

#[derive(Parser, Debug)]
struct Cli {
    /// Overrides `database_url` from voting.toml / APP__DATABASE_URL.
    #[arg(long)]
    database_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    CreateSession {
        title: String,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        linked_item: Option<String>,
    },
    CloseSession {
        session_id: SessionId,
    },
    ListSessions,
    Vote {
        session_id: SessionId,
        participant_id: ParticipantId,
        ballot: Ballot,
        #[arg(long)]
        justification: Option<String>,
    },
    Retract {
        vote_id: VoteId,
    },
    Tally {
        session_id: SessionId,
    },
    /// Follows a session live and prints every tally change until Ctrl-C.
    Watch {
        #[arg(long)]
        session: Option<SessionId>,
        #[arg(long)]
        participant: Option<ParticipantId>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let cli = Cli::parse();
    let settings = load_settings();
    let raw_url = cli.database_url.as_deref().unwrap_or(&settings.database_url);
    let database_url = prepare_database_url(raw_url)?;
    let storage = Storage::new(&database_url)
        .await
        .with_context(|| format!("failed to open voting storage at '{database_url}'"))?;

    match cli.command {
        Command::CreateSession {
            title,
            description,
            linked_item,
        } => {
            let session = storage
                .create_session(NewSession {
                    title,
                    description,
                    linked_item,
                })
                .await?;
            println!("created session_id={}", session.id);
        }
        Command::CloseSession { session_id } => match storage.close_session(session_id).await? {
            Some(session) => println!("session_id={} status={}", session.id, session.status.as_str()),
            None => bail!("voting session {session_id} does not exist"),
        },
        Command::ListSessions => {
            for session in storage.list_sessions().await? {
                println!(
                    "{}  {:<6}  {}  {}",
                    session.id,
                    session.status.as_str(),
                    session.created_at.format("%Y-%m-%d %H:%M"),
                    session.title
                );
            }
        }
        Command::Vote {
            session_id,
            participant_id,
            ballot,
            justification,
        } => {
            let vote = match storage.vote_for_participant(session_id, participant_id).await? {
                Some(existing) => {
                    storage
                        .update_vote(
                            existing.id,
                            VoteChanges {
                                ballot: Some(ballot),
                                justification,
                            },
                        )
                        .await?
                }
                None => {
                    storage
                        .insert_vote(NewVote {
                            session_id,
                            participant_id,
                            ballot,
                            justification,
                        })
                        .await?
                }
            };
            println!("recorded vote_id={} ballot={}", vote.id, vote.ballot);
        }
        Command::Retract { vote_id } => match storage.delete_vote(vote_id).await? {
            Some(vote) => println!("retracted vote_id={} from session_id={}", vote.id, vote.session_id),
            None => bail!("vote {vote_id} does not exist"),
        },
        Command::Tally { session_id } => {
            if storage.get_session(session_id).await?.is_none() {
                bail!("voting session {session_id} does not exist");
            }
            let votes = storage.list_votes(session_id).await?;
            print_tally(&compute_tally(&votes));
        }
        Command::Watch {
            session,
            participant,
        } => {
            let participant = participant.or(settings.participant_id);
            let identity: Arc<dyn IdentityProvider> = Arc::new(participant);
            let backend = Arc::new(StorageBackend::with_buffer(storage, settings.event_buffer));
            let controller = SessionSyncController::with_options(
                backend.clone(),
                identity,
                ControllerOptions::from(&settings),
            );
            watch(SessionDirectory::new(backend, controller), session).await?;
        }
    }

    Ok(())
}

async fn watch(directory: SessionDirectory, session: Option<SessionId>) -> Result<()> {
    let controller = directory.controller().clone();
    let mut events = controller.subscribe_events();

    let bound = match session {
        Some(session_id) => {
            directory.select(session_id).await?;
            Some(session_id)
        }
        None => directory.refresh().await?,
    };
    let Some(session_id) = bound else {
        println!("no voting sessions yet");
        return Ok(());
    };

    let snapshot = controller.snapshot().await;
    if let Some(session) = &snapshot.session {
        println!("watching \"{}\" ({}) status={}", session.title, session_id, session.status.as_str());
    }
    print_tally(&snapshot.tally);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("watch: interrupted");
                break;
            }
            event = events.recv() => match event {
                Ok(ControllerEvent::TallyUpdated { tally, .. }) => print_tally(&tally),
                Ok(ControllerEvent::SessionUpdated(session)) => {
                    println!("session \"{}\" is now {}", session.title, session.status.as_str());
                }
                Ok(ControllerEvent::PhaseChanged { phase: SyncPhase::Failed, .. }) => {
                    warn!(%session_id, "watch: session failed to load");
                }
                Ok(ControllerEvent::Error(err)) => eprintln!("{}", err.user_message()),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "watch: missed controller events, resyncing");
                    if let Err(err) = controller.resync().await {
                        eprintln!("{}", err.user_message());
                    }
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    controller.unbind().await;
    Ok(())
}

fn print_tally(tally: &Tally) {
    if tally.is_empty() {
        println!("no votes yet");
        return;
    }
    let parts: Vec<String> = tally
        .nonzero()
        .map(|(ballot, count)| format!("{ballot}={count} ({}%)", tally.share(ballot)))
        .collect();
    println!("{}  total={}", parts.join("  "), tally.total);
}
