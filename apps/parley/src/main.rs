use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use futures_util::future::join_all;
use parley_core::config::{Config, IceServer};
use parley_core::matchmaking::{MatchAssignment, MatchOutcome, Matchmaker, StaticMatchmaker};
use parley_core::media::SyntheticMediaSource;
use parley_core::peer::WebRtcConnector;
use parley_core::session::{SessionContext, SessionController, SessionStatus};
use parley_core::signal::{MatchId, Participant};
use parley_core::telemetry::{self, LogConfig, LogLevel};
use parley_core::timer::{BusTimerStore, TimerStore, TimerSync};
use signal_bus::{Bus, LocalBus};
use tokio::sync::watch;
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(
    name = "parley",
    about = "Peer-to-peer debate sessions over WebRTC",
    version
)]
struct Cli {
    #[command(flatten)]
    logging: LoggingArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        global = true,
        env = "PARLEY_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        global = true,
        env = "PARLEY_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    file: Option<PathBuf>,
}

impl LoggingArgs {
    fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Pair two local participants over an in-process bus with synthetic media
    Demo(DemoArgs),
}

#[derive(Args, Debug)]
struct DemoArgs {
    #[arg(long, default_value = "m1")]
    match_id: String,

    #[arg(long, default_value = "Pineapple belongs on pizza")]
    topic: String,

    #[arg(long, default_value = "alice")]
    first: String,

    #[arg(long, default_value = "bob")]
    second: String,

    #[arg(
        long = "stun",
        value_name = "URL",
        help = "STUN server to use instead of the configured list (repeatable)"
    )]
    stun: Vec<String>,

    #[arg(long, help = "Use host candidates only")]
    no_stun: bool,

    #[arg(long, value_name = "MS", help = "Delay before re-acquiring devices on retry")]
    retry_delay_ms: Option<u64>,

    #[arg(long, default_value_t = 20, help = "Seconds to wait for both sides to connect")]
    connect_timeout: u64,

    #[arg(long, default_value_t = 5, help = "Seconds to keep the call up once connected")]
    hold: u64,

    #[arg(long, help = "Run the debate timer alongside the call")]
    timer: bool,
}

impl DemoArgs {
    fn apply(&self, config: &mut Config) {
        if !self.stun.is_empty() {
            config.ice_servers = self.stun.iter().map(IceServer::stun).collect();
        }
        if self.no_stun {
            config.ice_servers.clear();
        }
        if let Some(ms) = self.retry_delay_ms {
            config.retry_delay = Duration::from_millis(ms);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let log_config = cli.logging.to_config();
    telemetry::init(&log_config).context("logging initialization failed")?;
    debug!(log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");

    match cli.command {
        Command::Demo(args) => run_demo(args).await,
    }
}

async fn run_demo(args: DemoArgs) -> anyhow::Result<()> {
    let mut config = Config::from_env().context("invalid PARLEY_* environment")?;
    args.apply(&mut config);

    let bus: Arc<dyn Bus> = Arc::new(LocalBus::new());
    let ctx = SessionContext {
        bus: Arc::clone(&bus),
        media: Arc::new(SyntheticMediaSource::new()),
        peers: Arc::new(WebRtcConnector::new()),
        config: config.clone(),
    };
    let matchmaker = StaticMatchmaker::new(MatchId::new(args.match_id.clone()), args.topic.clone());

    let first = Participant::new(args.first.clone());
    let second = Participant::new(args.second.clone());
    let assignment = assignment_for(&matchmaker, &first).await?;
    if assignment != assignment_for(&matchmaker, &second).await? {
        bail!("participants were assigned different matches");
    }
    println!(
        "match {} - topic: {}",
        assignment.match_id, assignment.topic
    );

    let sessions = [
        SessionController::start(assignment.match_id.clone(), first, ctx.clone()),
        SessionController::start(assignment.match_id.clone(), second, ctx),
    ];

    let timers = if args.timer {
        let timers = sessions
            .iter()
            .map(|session| {
                let store: Arc<dyn TimerStore> = Arc::new(BusTimerStore::new(
                    Arc::clone(&bus),
                    config.timer_namespace.clone(),
                    session.participant().clone(),
                ));
                let sync = Arc::new(TimerSync::new(assignment.match_id.clone(), Some(store)));
                let task = Arc::clone(&sync).spawn();
                (sync, task)
            })
            .collect::<Vec<_>>();
        Some(timers)
    } else {
        None
    };

    let connect_timeout = Duration::from_secs(args.connect_timeout);
    let connected = tokio::select! {
        result = tokio::time::timeout(connect_timeout, wait_all_settled(&sessions)) => {
            result.unwrap_or(false)
        }
        _ = tokio::signal::ctrl_c() => false,
    };

    for session in &sessions {
        let snapshot = session.snapshot();
        let remote = if snapshot.remote_video_missing() {
            "opponent camera off".to_string()
        } else {
            format!("{} remote tracks", snapshot.remote_media.tracks().len())
        };
        match &snapshot.error {
            Some(err) => println!(
                "{}: {:?} ({}) - {}",
                session.participant(),
                snapshot.status,
                remote,
                err.user_message()
            ),
            None => println!("{}: {:?} ({})", session.participant(), snapshot.status, remote),
        }
    }

    if connected {
        info!(hold_secs = args.hold, "call established");
        if let Some(timers) = timers.as_ref() {
            if let Some((sync, _)) = timers.first() {
                sync.start().await;
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(args.hold)) => {}
            _ = tokio::signal::ctrl_c() => {}
        }
        if let Some(timers) = timers.as_ref() {
            for ((sync, _), session) in timers.iter().zip(&sessions) {
                println!(
                    "{} timer: {} ({})",
                    session.participant(),
                    sync.display(),
                    sync.progress()
                );
            }
        }
    }

    for (_, task) in timers.into_iter().flatten() {
        task.abort();
    }
    for session in &sessions {
        session.stop().await;
    }

    if !connected {
        bail!("sessions did not connect within {}s", args.connect_timeout);
    }
    Ok(())
}

async fn assignment_for(
    matchmaker: &dyn Matchmaker,
    participant: &Participant,
) -> anyhow::Result<MatchAssignment> {
    match matchmaker.request(participant).await? {
        MatchOutcome::Matched(assignment) => Ok(assignment),
        MatchOutcome::Waiting => bail!("no match available for {participant}"),
    }
}

/// Waits until every session is connected or has failed; true when all connected.
async fn wait_all_settled(sessions: &[SessionController]) -> bool {
    let settled = sessions.iter().map(|session| {
        let mut updates: watch::Receiver<_> = session.watch();
        async move {
            let connected = match updates
                .wait_for(|snapshot| {
                    snapshot.status == SessionStatus::Connected || snapshot.error.is_some()
                })
                .await
            {
                Ok(snapshot) => snapshot.status == SessionStatus::Connected,
                Err(_) => false,
            };
            connected
        }
    });
    join_all(settled).await.into_iter().all(|connected| connected)
}
