use anyhow::{anyhow, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::info;

use workflow_orchestrator::cache::{CacheTtls, MokaCache};
use workflow_orchestrator::config::WorkflowOrchestratorConfig;
use workflow_orchestrator::events::{
    EventCoordinator, EventListener, ProcessEvent, TimerEvent, EVENT_MESSAGE, EVENT_SIGNAL,
    EVENT_TIMER,
};
use workflow_orchestrator::orchestration::{
    ApprovalAggregator, ApprovalRequest, ApprovalVote, EventNotifier, LoggingNotifier, Notifier,
    OrchestrationDriver, RateLimitedNotifier, RunRegistry, SignalBridge, SignalHub,
};
use workflow_orchestrator::store::Repositories;
use workflow_orchestrator::{
    init_repositories, init_telemetry, orchestration_metrics, shutdown_telemetry, time_operation,
    InstanceLifecycleService, Intake, ShutdownCoordinator,
};

#[derive(Parser)]
#[command(name = "workflow-orchestrator")]
#[command(about = "Asynchronous workflow orchestration core")]
#[command(long_about = "Workflow Orchestrator drives process and task instances through their \
                       lifecycles, coordinates signals and timers, and aggregates multi-party \
                       approvals against deadlines.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect or create configuration files
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Run approval workflows locally
    Approval {
        #[command(subcommand)]
        action: ApprovalAction,
    },
    /// Exercise the timer scheduler
    Timer {
        #[command(subcommand)]
        action: TimerAction,
    },
    /// Run the orchestrator on JSON-line commands from stdin until EOF or ctrl-c
    Serve,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Write a default configuration file
    Init {
        /// Destination file
        #[arg(long, default_value = "workflow-orchestrator.toml")]
        path: PathBuf,
        /// Overwrite an existing file
        #[arg(long, help = "Overwrite the file if it already exists")]
        force: bool,
    },
}

#[derive(Subcommand)]
enum ApprovalAction {
    /// Run one approval with scripted votes and print the result
    Simulate {
        /// Approver ids, in order
        #[arg(long = "approver", required = true, help = "Approver id (repeat for more approvers)")]
        approvers: Vec<String>,
        /// Scripted vote as approver=approve|reject[:comment]
        #[arg(long = "vote", help = "Vote such as alice=approve:looks good")]
        votes: Vec<String>,
        /// Every approver must approve
        #[arg(long, help = "Require every approver to approve")]
        require_all: bool,
        /// Seconds before the approval times out
        #[arg(long, default_value = "5")]
        deadline_secs: u64,
    },
}

#[derive(Subcommand)]
enum TimerAction {
    /// Schedule a timer and print each firing
    Demo {
        /// Milliseconds until the first firing
        #[arg(long, default_value = "500")]
        delay_ms: u64,
        /// ISO-8601 repeat rule such as R3/PT1S
        #[arg(long)]
        repeat: Option<String>,
        /// Stop after this many firings
        #[arg(long, default_value = "3")]
        max_fires: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Config { action } => match action {
            ConfigAction::Show => config_show_command(),
            ConfigAction::Init { path, force } => config_init_command(path, force),
        },
        Commands::Approval {
            action:
                ApprovalAction::Simulate {
                    approvers,
                    votes,
                    require_all,
                    deadline_secs,
                },
        } => tokio::runtime::Runtime::new()?.block_on(async {
            approval_simulate_command(approvers, votes, require_all, deadline_secs).await
        }),
        Commands::Timer {
            action:
                TimerAction::Demo {
                    delay_ms,
                    repeat,
                    max_fires,
                },
        } => tokio::runtime::Runtime::new()?
            .block_on(async { timer_demo_command(delay_ms, repeat, max_fires).await }),
        Commands::Serve => tokio::runtime::Runtime::new()?.block_on(async { serve_command().await }),
    }
}

fn load_config() -> Result<WorkflowOrchestratorConfig> {
    WorkflowOrchestratorConfig::load_env_file()?;
    WorkflowOrchestratorConfig::load()
}

fn config_show_command() -> Result<()> {
    let config = load_config()?;
    print!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

fn config_init_command(path: PathBuf, force: bool) -> Result<()> {
    if path.exists() && !force {
        return Err(anyhow!(
            "{} already exists (use --force to overwrite)",
            path.display()
        ));
    }
    WorkflowOrchestratorConfig::default().save_to_file(&path)?;
    println!("✅ Wrote default configuration to {}", path.display());
    Ok(())
}

fn parse_vote(raw: &str) -> Result<ApprovalVote> {
    let (approver, rest) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("vote '{}' must look like approver=approve[:comment]", raw))?;
    let (decision, comments) = match rest.split_once(':') {
        Some((decision, comments)) => (decision, comments.to_string()),
        None => (rest, String::new()),
    };
    let approved = match decision.to_ascii_lowercase().as_str() {
        "approve" | "yes" | "true" => true,
        "reject" | "no" | "false" => false,
        other => return Err(anyhow!("unknown decision '{}' in vote '{}'", other, raw)),
    };

    Ok(ApprovalVote {
        approver: approver.to_string(),
        approved,
        comments,
    })
}

async fn approval_simulate_command(
    approvers: Vec<String>,
    votes: Vec<String>,
    require_all: bool,
    deadline_secs: u64,
) -> Result<()> {
    let config = load_config()?;
    init_telemetry(&config.observability)?;
    let votes = votes
        .iter()
        .map(|v| parse_vote(v))
        .collect::<Result<Vec<_>>>()?;

    time_operation!("approval_simulate");
    let aggregator = ApprovalAggregator::new(
        Arc::new(LoggingNotifier),
        Arc::new(SignalHub::new(config.orchestration.signal_buffer)),
        Arc::new(RunRegistry::new()),
    );
    let request = ApprovalRequest {
        request_id: format!("simulated-{}", uuid::Uuid::new_v4()),
        requestor: "cli".to_string(),
        approvers,
        content: serde_json::json!({ "source": "approval simulate" }),
        deadline: Duration::from_secs(deadline_secs),
        require_all,
    };
    let request_id = request.request_id.clone();

    println!("🗳️  Running approval {} ({} scripted votes)", request_id, votes.len());
    let handle = aggregator.start_approval(request)?;
    for vote in votes {
        let approver = vote.approver.clone();
        if !aggregator.submit_vote(&request_id, vote)? {
            println!("   ⏭️  Vote from {} arrived after the approval closed", approver);
        }
    }

    let result = handle.await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    shutdown_telemetry();
    Ok(())
}

/// Forwards timer events to the demo loop.
struct TimerPrinter {
    fired: mpsc::UnboundedSender<ProcessEvent>,
}

#[async_trait]
impl EventListener for TimerPrinter {
    fn name(&self) -> &str {
        "timer-printer"
    }

    async fn on_event(&self, event: &ProcessEvent) -> Result<()> {
        self.fired.send(event.clone())?;
        Ok(())
    }
}

async fn timer_demo_command(delay_ms: u64, repeat: Option<String>, max_fires: usize) -> Result<()> {
    let config = load_config()?;
    init_telemetry(&config.observability)?;

    let repos = Repositories::in_memory();
    let events = EventCoordinator::new(
        repos.events.clone(),
        Arc::new(MokaCache::new(config.cache.max_capacity)),
        CacheTtls::from(&config.cache),
    );
    let (tx, mut rx) = mpsc::unbounded_channel();
    events.register_listener(EVENT_TIMER, Arc::new(TimerPrinter { fired: tx }));

    let due = chrono::Utc::now() + chrono::Duration::milliseconds(delay_ms as i64);
    let mut timer = TimerEvent::new("demo-timer", "demo-instance", due);
    timer.repeat = repeat;
    events.schedule_timer(timer).await?;
    println!("⏰ Scheduled demo-timer for {}", due.to_rfc3339());

    let mut fired = 0;
    while fired < max_fires {
        let next = tokio::time::timeout(Duration::from_secs(3600), rx.recv()).await;
        match next {
            Ok(Some(event)) => {
                fired += 1;
                let occurrence = event.payload.get("occurrence").cloned().unwrap_or_default();
                println!("   🔔 Fired (occurrence {}) at {:?}", occurrence, event.timestamp);
                if !events.is_timer_active("demo-timer") {
                    break;
                }
            }
            Ok(None) | Err(_) => break,
        }
    }

    events.cancel_timer("demo-timer").await?;
    println!("✅ Timer demo finished after {} firing(s)", fired);
    orchestration_metrics().log_stats();
    shutdown_telemetry();
    Ok(())
}

async fn serve_command() -> Result<()> {
    let config = load_config()?;
    init_telemetry(&config.observability)?;

    let repos = init_repositories(config.database.as_ref()).await?;
    let cache = Arc::new(MokaCache::new(config.cache.max_capacity));
    let ttls = CacheTtls::from(&config.cache);
    let events = EventCoordinator::new(repos.events.clone(), cache.clone(), ttls);
    let signals = Arc::new(SignalHub::new(config.orchestration.signal_buffer));
    let runs = Arc::new(RunRegistry::new());

    events.set_correlator(signals.clone());
    events.register_listener(
        EVENT_SIGNAL,
        Arc::new(SignalBridge::new(signals.clone())),
    );
    events.register_listener(
        EVENT_MESSAGE,
        Arc::new(SignalBridge::new(signals.clone())),
    );

    let notifier: Arc<dyn Notifier> = Arc::new(RateLimitedNotifier::new(
        Arc::new(EventNotifier::new(events.clone())),
        &config.notifications,
    ));
    let driver = OrchestrationDriver::new(
        repos.runs.clone(),
        notifier.clone(),
        signals.clone(),
        runs.clone(),
        config.orchestration.clone(),
    );
    let approvals = ApprovalAggregator::new(notifier, signals.clone(), runs.clone())
        .with_run_store(repos.runs.clone(), config.orchestration.retry.clone());
    let definitions = repos.definitions.clone();
    let lifecycle = InstanceLifecycleService::new(repos, cache, ttls)
        .with_events(events.clone())
        .with_signals(signals)
        .with_run_registry(runs.clone());
    let (intake, mut reports) = Intake::new(definitions, lifecycle, driver, approvals, events.clone());

    if config.observability.metrics_enabled {
        tokio::spawn(async {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                orchestration_metrics().log_stats();
            }
        });
    }

    info!("Workflow orchestrator reading commands from stdin");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => {
                    if let Some(reply) = intake.handle_line(&line).await {
                        println!("{}", reply);
                    }
                }
                None => {
                    info!("Command input closed");
                    break;
                }
            },
            Some(report) = reports.recv() => println!("{}", report),
            _ = &mut ctrl_c => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    ShutdownCoordinator::new(runs, events)
        .shutdown_all_services()
        .await?;
    intake.finish().await;
    drop(intake);
    while let Some(report) = reports.recv().await {
        println!("{}", report);
    }
    shutdown_telemetry();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_vote_with_comment() {
        let vote = parse_vote("alice=approve:looks good").unwrap();
        assert_eq!(vote.approver, "alice");
        assert!(vote.approved);
        assert_eq!(vote.comments, "looks good");
    }

    #[test]
    fn test_parse_vote_rejects_unknown_decision() {
        assert!(parse_vote("bob=maybe").is_err());
        assert!(parse_vote("bob").is_err());
    }
}
