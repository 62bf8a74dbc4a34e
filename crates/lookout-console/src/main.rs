use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use lookout_client::{
    ClientConfig, ConnectOutcome, HttpGateway, RosterEvent, RosterPoller, SessionConfig,
    SessionHandle, SessionManager, Shutdown, StopOutcome,
};
use lookout_core::agent::AgentRecord;
use lookout_core::liveness::classify;
use lookout_core::metrics::{format_percent, format_uptime};
use lookout_core::time::epoch_secs;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = ClientConfig::load();
    config.validate();

    let gateway = match HttpGateway::from_config(&config) {
        Ok(gateway) => gateway,
        Err(e) => {
            tracing::error!(error = %e, "failed to build gateway client");
            std::process::exit(1);
        },
    };

    if let Some(password) = config.auth.password.as_deref() {
        match gateway.login(password).await {
            Ok(true) => tracing::info!("signed in"),
            Ok(false) => tracing::warn!("gateway rejected the password"),
            Err(e) => tracing::warn!(error = %e, "sign-in failed"),
        }
    }

    let shutdown = Shutdown::new();
    let manager = SessionManager::with_shutdown(
        gateway.clone(),
        SessionConfig::from_client_config(&config),
        shutdown.clone(),
    );

    let (roster_tx, mut roster_rx) = mpsc::unbounded_channel();
    let poller = RosterPoller::new(gateway.clone(), config.poll_interval());
    tokio::spawn(poller.run(roster_tx, shutdown.listener()));

    println!("lookout — commands: list, connect <agent>, stop <agent>, delete <agent>, quit");

    let mut roster: Vec<AgentRecord> = Vec::new();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            event = roster_rx.recv() => match event {
                Some(RosterEvent::Snapshot(agents)) => roster = agents,
                Some(RosterEvent::Error(e)) => tracing::warn!(error = %e, "roster refresh failed"),
                Some(RosterEvent::Unauthenticated) => {
                    eprintln!("session expired — sign in again");
                    break;
                },
                None => break,
            },
            line = stdin.next_line() => match line {
                Ok(Some(line)) => {
                    if !run_command(line.trim(), &manager, &gateway, &roster).await {
                        break;
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "stdin error");
                    break;
                },
            },
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            },
        }
    }

    // Process-wide unload: every live session tears down.
    manager.shutdown().await;
}

/// Returns false when the console should exit.
async fn run_command(
    line: &str,
    manager: &SessionManager<HttpGateway>,
    gateway: &HttpGateway,
    roster: &[AgentRecord],
) -> bool {
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("list"), None) => print_roster(roster),
        (Some("connect"), Some(agent)) => connect(manager, agent).await,
        (Some("stop"), Some(agent)) => match manager.stop(agent).await {
            Ok(StopOutcome::Stopped) => println!("{agent}: session stopped"),
            Ok(StopOutcome::AlreadyReleased) => {
                println!("{agent}: forwarder not found or already stopped");
            },
            Ok(StopOutcome::NotActive) => println!("{agent}: no active session"),
            Err(e) => eprintln!("{agent}: error stopping session: {e}"),
        },
        (Some("delete"), Some(agent)) => match gateway.delete_agent(agent).await {
            Ok(message) => println!("{message}"),
            Err(e) => eprintln!("{agent}: delete failed: {e}"),
        },
        (Some("quit") | Some("exit"), None) => return false,
        (None, _) => {},
        _ => println!("commands: list, connect <agent>, stop <agent>, delete <agent>, quit"),
    }
    true
}

async fn connect(manager: &SessionManager<HttpGateway>, agent: &str) {
    match manager.connect(agent).await {
        Ok(ConnectOutcome::Connected(handle)) => {
            let lines = handle.subscribe_lines();
            for line in handle.transcript() {
                println!("[{agent}] {line}");
            }
            tokio::spawn(follow_session(handle, lines));
        },
        Ok(ConnectOutcome::AlreadyActive) => println!("{agent}: connection already active"),
        Err(e) => eprintln!("{agent}: connect failed: {e}"),
    }
}

/// Print transcript lines as they arrive until the session ends.
async fn follow_session(handle: SessionHandle, mut lines: broadcast::Receiver<String>) {
    let agent = handle.agent().to_string();
    loop {
        tokio::select! {
            line = lines.recv() => match line {
                Ok(line) => println!("[{agent}] {line}"),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(agent = %agent, skipped = n, "transcript output lagging");
                },
                Err(broadcast::error::RecvError::Closed) => break,
            },
            state = handle.wait_terminal() => {
                println!("[{agent}] session {state}");
                break;
            },
        }
    }
}

fn print_roster(roster: &[AgentRecord]) {
    if roster.is_empty() {
        println!("no agents reported");
        return;
    }
    let now = epoch_secs();
    for a in roster {
        println!(
            "{:<20} {:<8} uptime {:<12} cpu {:<8} mem {:<8} disk {:<8} temp {}",
            a.name,
            classify(a.polled_time, now).label(),
            format_uptime(a.uptime),
            format_percent(a.cpu_usage),
            format_percent(a.memory_usage),
            format_percent(a.disk_usage),
            a.temperature
                .map(|t| format!("{t}°C"))
                .unwrap_or_else(|| "N/A".to_string()),
        );
    }
}
