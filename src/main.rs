//! reelfeed: command-line client for the reels service.
//!
//! Usage: reelfeed [--config PATH] --identity ID <command> [args]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use tracing_subscriber::EnvFilter;

use reelfeed::blob::ExternalBlob;
use reelfeed::config::Config;
use reelfeed::profile::{Aggregate, DerivedProfileView, MemberCard};
use reelfeed::service::{GatewayClient, Identity, Reel, UserProfile};
use reelfeed::{ErrorDisplay, IdentityEvent, ServiceError, Session, SessionManager};

const USAGE: &str = "\
Usage: reelfeed [--config PATH] --identity ID <command>

Commands:
  feed                          Reels from you and the people you follow
  reels                         Every reel
  profile [ID]                  Profile with follower counts (default: you)
  followers ID                  Who follows ID
  following ID                  Who ID follows
  members                       Everyone who has uploaded a reel
  follow ID                     Follow ID
  unfollow ID                   Stop following ID
  set-profile USERNAME [BIO]    Save your profile
  upload FILE [DESCRIPTION]     Upload a video";

#[derive(Debug, PartialEq)]
enum Command {
    Feed,
    Reels,
    Profile(Option<Identity>),
    Followers(Identity),
    Following(Identity),
    Members,
    Follow(Identity),
    Unfollow(Identity),
    SetProfile { username: String, bio: String },
    Upload { file: PathBuf, description: String },
}

#[derive(Debug, PartialEq)]
struct Cli {
    config: Option<PathBuf>,
    identity: Identity,
    command: Command,
}

fn parse_identity(value: Option<&String>, what: &str) -> Result<Identity> {
    let value = value.ok_or_else(|| anyhow!("Missing {}", what))?;
    value.parse().with_context(|| format!("Invalid {}", what))
}

fn parse_args(args: &[String]) -> Result<Cli> {
    let mut config = None;
    let mut identity = None;
    let mut rest = Vec::new();

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => {
                let path = iter.next().ok_or_else(|| anyhow!("--config needs a path"))?;
                config = Some(PathBuf::from(path));
            }
            "--identity" => identity = Some(parse_identity(iter.next(), "identity")?),
            _ => rest.push(arg.clone()),
        }
    }

    let identity = identity.ok_or_else(|| anyhow!("--identity is required"))?;
    let name = rest.first().ok_or_else(|| anyhow!("Missing command"))?;
    let arg = |i: usize| rest.get(i);

    let command = match name.as_str() {
        "feed" => Command::Feed,
        "reels" => Command::Reels,
        "profile" => Command::Profile(arg(1).map(|id| parse_identity(Some(id), "user")).transpose()?),
        "followers" => Command::Followers(parse_identity(arg(1), "user")?),
        "following" => Command::Following(parse_identity(arg(1), "user")?),
        "members" => Command::Members,
        "follow" => Command::Follow(parse_identity(arg(1), "user")?),
        "unfollow" => Command::Unfollow(parse_identity(arg(1), "user")?),
        "set-profile" => Command::SetProfile {
            username: arg(1).cloned().ok_or_else(|| anyhow!("Missing username"))?,
            bio: arg(2).cloned().unwrap_or_default(),
        },
        "upload" => Command::Upload {
            file: arg(1)
                .map(PathBuf::from)
                .ok_or_else(|| anyhow!("Missing video file"))?,
            description: arg(2).cloned().unwrap_or_default(),
        },
        other => bail!("Unknown command: {}", other),
    };

    Ok(Cli {
        config,
        identity,
        command,
    })
}

fn video_content_type(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_lowercase();
    match ext.as_str() {
        "mp4" | "m4v" => Some("video/mp4"),
        "webm" => Some("video/webm"),
        "mov" => Some("video/quicktime"),
        "mkv" => Some("video/x-matroska"),
        "ogv" => Some("video/ogg"),
        _ => None,
    }
}

fn render_reels(reels: &[Reel]) -> Vec<String> {
    if reels.is_empty() {
        return vec!["No reels yet.".to_string()];
    }
    reels
        .iter()
        .map(|reel| {
            format!(
                "#{:<5} {:<20} {}  {}",
                reel.id,
                reel.uploader,
                reel.description,
                reel.video.direct_url().unwrap_or("-")
            )
        })
        .collect()
}

fn print_reels(reels: &[Reel]) {
    for line in render_reels(reels) {
        println!("{}", line);
    }
}

/// Profile header, counts, follow status and the user's reels.
fn render_profile(
    user: &Identity,
    me: &Identity,
    view: &DerivedProfileView,
    reels: &[Reel],
) -> Vec<String> {
    let mut lines = Vec::new();
    match &view.profile {
        Some(profile) => {
            lines.push(format!("{} ({})", profile.username, user));
            if !profile.bio.is_empty() {
                lines.push(profile.bio.clone());
            }
        }
        None if user == me => lines.push("You have not set up a profile yet (see set-profile).".to_string()),
        None => lines.push(format!("{} has not set up a profile.", user)),
    }
    lines.push(format!(
        "{} followers, {} following",
        view.follower_count, view.following_count
    ));
    if view.is_followed_by_caller {
        lines.push(format!("You follow {}.", user));
    }
    lines.push(String::new());
    lines.push(format!("Reels ({}):", reels.len()));
    lines.extend(render_reels(reels));
    lines
}

fn print_cards(cards: &[MemberCard]) {
    if cards.is_empty() {
        println!("Nobody here yet.");
        return;
    }
    for card in cards {
        let noun = if card.follower_count == 1 { "follower" } else { "followers" };
        println!(
            "{:<20} {:<20} {} {}",
            card.profile.username, card.identity, card.follower_count, noun
        );
    }
}

/// Unwrap an aggregate that has been loaded to completion.
fn settled<T>(aggregate: Aggregate<T>) -> Result<T> {
    if let Some(error) = aggregate.error() {
        return Err(error.clone().into());
    }
    aggregate
        .value
        .ok_or_else(|| anyhow!("Request did not complete"))
}

async fn execute(session: &Session, command: Command) -> Result<()> {
    let me = session.identity().clone();
    let cache = session.cache();
    let queries = session.queries();

    match command {
        Command::Feed => {
            let entry = cache.resolve(&queries.feed()).await;
            if let Some(e) = &entry.error {
                return Err(e.clone().into());
            }
            print_reels(entry.data().map(Vec::as_slice).unwrap_or_default());
        }
        Command::Reels => {
            let entry = cache.resolve(&queries.all_reels()).await;
            if let Some(e) = &entry.error {
                return Err(e.clone().into());
            }
            print_reels(entry.data().map(Vec::as_slice).unwrap_or_default());
        }
        Command::Profile(user) => {
            let user = user.unwrap_or_else(|| me.clone());
            let reels_query = queries.reels_by_uploader(&user);
            let (view, reels) = tokio::join!(
                session.profiles().load(&user, &me),
                cache.resolve(&reels_query),
            );
            let view = settled(view)?;
            if let Some(e) = &reels.error {
                return Err(e.clone().into());
            }
            let reels = reels.data().map(Vec::as_slice).unwrap_or_default();
            for line in render_profile(&user, &me, &view, reels) {
                println!("{}", line);
            }
        }
        Command::Followers(user) => print_cards(&settled(session.profiles().load_followers(&user).await)?),
        Command::Following(user) => print_cards(&settled(session.profiles().load_following(&user).await)?),
        Command::Members => print_cards(&settled(session.profiles().load_members().await)?),
        Command::Follow(user) => {
            session.mutations().follow(&user).await?;
            println!("Now following {}.", user);
        }
        Command::Unfollow(user) => {
            session.mutations().unfollow(&user).await?;
            println!("Unfollowed {}.", user);
        }
        Command::SetProfile { username, bio } => {
            session
                .mutations()
                .save_profile(UserProfile {
                    username,
                    bio,
                    profile_picture: None,
                })
                .await?;
            println!("Profile saved.");
        }
        Command::Upload { file, description } => {
            let bytes = tokio::fs::read(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let mut video = ExternalBlob::from_bytes(bytes).with_upload_progress(|percentage| {
                eprint!("\rUploading... {:>3}%", percentage);
                if percentage == 100 {
                    eprintln!();
                }
            });
            if let Some(content_type) = video_content_type(&file) {
                video = video.with_content_type(content_type);
            }
            let id = session.mutations().upload_reel(video, description).await?;
            println!("Uploaded reel #{}.", id);
        }
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    let gateway = GatewayClient::new(&config.gateway)?;

    let mut sessions = SessionManager::new(Arc::new(gateway), config.cache.clone());
    let session = sessions
        .handle(IdentityEvent::Available(cli.identity))
        .ok_or_else(|| anyhow!("Failed to start session"))?;

    let result = execute(session, cli.command).await;
    sessions.handle(IdentityEvent::Unavailable);
    result
}

fn report(err: &anyhow::Error) {
    match err.downcast_ref::<ServiceError>().map(ServiceError::display) {
        Some(ErrorDisplay::Inline(message)) => eprintln!("Rejected: {}", message),
        Some(ErrorDisplay::Notification(message)) => eprintln!("Error: {}", message),
        None => eprintln!("Error: {:#}", err),
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("reelfeed=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = match parse_args(&args) {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("{}\n\n{}", e, USAGE);
            std::process::exit(2);
        }
    };

    if let Err(e) = run(cli).await {
        report(&e);
        std::process::exit(1);
    }
}
