use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use profiler::{
    ProfilerSession, ReportFormat, ReportOptions, load_sessions,
    report::generate_session_report,
    tree::{CallTree, folded_stacks},
};
use serde::Serialize;
use tracing::{info, info_span};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(about = "Inspects profiling sessions saved by the profiler.", long_about = None)]
struct ReportCli {
    #[command(subcommand)]
    subcommand: ReportCommand,
}

#[derive(Subcommand, Debug)]
enum ReportCommand {
    #[clap(about = "Renders the combined report of one session (the newest by default).")]
    Render {
        sessions: PathBuf,
        #[arg(short, long)]
        session: Option<String>,
        #[arg(short, long, default_value_t = ReportFormat::Text)]
        format: ReportFormat,
        #[arg(long, default_value_t = 10)]
        max_entries: usize,
        #[arg(long)]
        no_metadata: bool,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    #[clap(about = "Lists the saved sessions.")]
    List { sessions: PathBuf },
    #[clap(about = "Prints the call tree of a session's CPU profile.")]
    Flame {
        sessions: PathBuf,
        #[arg(short, long)]
        session: Option<String>,
        #[arg(long, help = "Print folded stacks instead of the tree")]
        folded: bool,
        #[arg(long, default_value_t = 0.0, help = "Hide subtrees below this percentage")]
        prune: f64,
    },
    #[clap(about = "Writes one CSV row per session.")]
    Summary { sessions: PathBuf, output: PathBuf },
}

#[derive(Debug, Serialize)]
struct SessionSummary<'s> {
    id: &'s str,
    duration_ms: f64,
    samples: usize,
    peak_memory: u64,
    requests: usize,
    failed_requests: usize,
}

impl<'s> From<&'s ProfilerSession> for SessionSummary<'s> {
    fn from(session: &'s ProfilerSession) -> Self {
        Self {
            id: &session.id,
            duration_ms: session.duration,
            samples: session
                .cpu_profile
                .as_ref()
                .map_or(0, |profile| profile.samples.len()),
            peak_memory: session
                .memory_profile
                .as_ref()
                .map_or(0, |profile| profile.peak_memory),
            requests: session
                .network_profile
                .as_ref()
                .map_or(0, |profile| profile.total_requests),
            failed_requests: session
                .network_profile
                .as_ref()
                .map_or(0, |profile| profile.failed_requests),
        }
    }
}

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    set_global_subscriber();

    let cli = ReportCli::parse();
    match cli.subcommand {
        ReportCommand::Render {
            sessions,
            session,
            format,
            max_entries,
            no_metadata,
            output,
        } => {
            let _render_span = info_span!("render", %format).entered();

            let history = read_sessions(&sessions)?;
            let session = select_session(&history, session.as_deref())?;
            let options = ReportOptions {
                format,
                include_metadata: !no_metadata,
                max_entries,
                ..Default::default()
            };
            let report = generate_session_report(session, &options)?;

            match output {
                Some(path) => {
                    fs::write(&path, &report.content)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    info!(session_id = %session.id, path = %path.display(), "report written");
                }
                None => println!("{}", report.content),
            }
        }
        ReportCommand::List { sessions } => {
            let history = read_sessions(&sessions)?;
            info!("{} sessions in {}", history.len(), sessions.display());

            for session in &history {
                let summary = SessionSummary::from(session);
                info!(
                    session_id = summary.id,
                    duration_ms = summary.duration_ms,
                    profiles = session.profile_count(),
                    samples = summary.samples,
                    peak_memory = summary.peak_memory,
                    requests = summary.requests,
                    "session"
                );
            }
        }
        ReportCommand::Flame {
            sessions,
            session,
            folded,
            prune,
        } => {
            let history = read_sessions(&sessions)?;
            let session = select_session(&history, session.as_deref())?;
            let profile = session
                .cpu_profile
                .as_ref()
                .with_context(|| format!("session {} has no CPU profile", session.id))?;

            if folded {
                print!("{}", folded_stacks(profile));
            } else {
                let mut tree = CallTree::from_profile(profile);
                tree.prune(prune);
                print!("{tree}");
            }
        }
        ReportCommand::Summary { sessions, output } => {
            let history = read_sessions(&sessions)?;

            let mut writer = csv::Writer::from_path(&output)
                .with_context(|| format!("failed to create {}", output.display()))?;
            for session in &history {
                writer.serialize(SessionSummary::from(session))?;
            }
            writer.flush()?;

            info!("wrote {} rows to {}", history.len(), output.display());
        }
    }

    Ok(())
}

fn read_sessions(path: &Path) -> anyhow::Result<Vec<ProfilerSession>> {
    load_sessions(path).with_context(|| format!("failed to load sessions from {}", path.display()))
}

fn select_session<'h>(
    history: &'h [ProfilerSession],
    id: Option<&str>,
) -> anyhow::Result<&'h ProfilerSession> {
    match id {
        Some(id) => match history.iter().find(|session| session.id == id) {
            Some(session) => Ok(session),
            None => bail!("session {id} not found"),
        },
        None => history.last().context("the file contains no sessions"),
    }
}

fn set_global_subscriber() {
    let default_env_filter = EnvFilter::try_new("profiler_report=info,profiler=info")
        .expect("hard-coded env filter should be valid");

    let env_filter = EnvFilter::try_from_default_env().unwrap_or(default_env_filter);

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_file(false)
        .with_line_number(false);

    #[cfg(not(feature = "structured_logging"))]
    let subscriber = subscriber.pretty();
    #[cfg(feature = "structured_logging")]
    let subscriber = subscriber.json();

    subscriber.finish().init();
}
