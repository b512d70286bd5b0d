//! obs-remote - remote control session for an obs-websocket server
//!
//! Usage:
//!   obs-remote                         Connect, keep state in sync, print changes
//!   obs-remote --input Mic/Aux         Also track an audio input
//!   obs-remote --discover-inputs       Track every audio input
//!   obs-remote call GetVersion         Send one request and print the response

mod cli;

use anyhow::{bail, Context, Result};
use clap::Parser;
use cli::{Cli, Command};
use obs_remote::config::{self, Config};
use obs_remote::error::Error;
use obs_remote::logging;
use obs_remote::reconcile::{queries, ReconcileLoop};
use obs_remote::session::{
    ReconnectPolicy, SessionEvent, SessionHandle, SessionManager, SessionState,
};
use obs_remote::transport::websocket::WebSocketTransport;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, trace, warn};

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_tracing(cli.verbose);

    let mut config = match &cli.config {
        Some(path) => config::load_from(path),
        None => config::load(),
    };
    cli.apply(&mut config);
    config.validate()?;

    let rt = tokio::runtime::Runtime::new().map_err(|e| Error::Runtime { source: e })?;

    match cli.command {
        Some(Command::Call { request_type, data }) => {
            rt.block_on(run_call(config, &request_type, data.as_deref()))
        }
        None => rt.block_on(run_headless(config)),
    }
}

async fn run_headless(config: Config) -> Result<()> {
    let session = SessionManager::spawn(
        WebSocketTransport::new(),
        config.session_config(),
        config.reconnect,
    );
    let sync = ReconcileLoop::spawn(session.clone(), config.reconcile_config());

    let mut events = session.subscribe();
    let mut changes = sync.subscribe();

    let target = config.target();
    eprintln!("Connecting to {}", target.url());
    if let Err(e) = session.connect(target).await {
        if !(e.is_transient() && config.reconnect.enabled) {
            return Err(e).context("connect failed");
        }
        warn!("{}, retrying in background", e);
    }

    let result = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break Ok(());
            }

            event = events.recv() => {
                if session_ended(&event, session.state()) {
                    break Err(anyhow::anyhow!("session ended"));
                }
                match event {
                    Ok(event) => log_event(&event),
                    Err(RecvError::Lagged(missed)) => warn!("Missed {} session events", missed),
                    Err(RecvError::Closed) => break Ok(()),
                }
            }

            change = changes.recv() => match change {
                // Meter levels arrive many times per second
                Ok(change) if queries::is_level(&change.name) => {
                    trace!("{} = {}", change.name, change.value)
                }
                Ok(change) => println!("{} = {}", change.name, change.value),
                Err(RecvError::Lagged(missed)) => warn!("Missed {} parameter changes", missed),
                Err(RecvError::Closed) => break Ok(()),
            },
        }
    };

    session.disconnect().await;
    result
}

/// Whether the session has stopped for good
///
/// Once Idle, nothing reconnects on its own. A lagged receiver may have
/// missed the transition, so the current state is checked instead.
fn session_ended(event: &Result<SessionEvent, RecvError>, state: SessionState) -> bool {
    match event {
        Ok(SessionEvent::StateChanged(SessionState::Idle)) => true,
        Err(RecvError::Lagged(_)) => state == SessionState::Idle,
        _ => false,
    }
}

fn log_event(event: &SessionEvent) {
    match event {
        SessionEvent::StateChanged(state) => debug!("Session {}", state),
        SessionEvent::Connected => info!("Connected"),
        SessionEvent::Disconnected => info!("Disconnected"),
        SessionEvent::ConnectFailed(e) => warn!("Connect failed: {}", e),
        SessionEvent::ConnectionLost(e) => warn!("Connection lost: {}", e),
        SessionEvent::ReconnectScheduled { attempt, delay } => {
            info!("Reconnect attempt {} in {} ms", attempt, delay.as_millis())
        }
        SessionEvent::ReconnectExhausted => warn!("Giving up reconnecting"),
        SessionEvent::Remote { name, .. } if name == queries::INPUT_VOLUME_METERS => {}
        SessionEvent::Remote { name, .. } => debug!("Event {}", name),
    }
}

async fn run_call(config: Config, request_type: &str, data: Option<&str>) -> Result<()> {
    let data: Option<Value> = data
        .map(serde_json::from_str)
        .transpose()
        .context("request data is not valid JSON")?;

    let session = SessionManager::spawn(
        WebSocketTransport::new(),
        config.session_config(),
        ReconnectPolicy::disabled(),
    );
    session
        .connect(config.target())
        .await
        .context("connect failed")?;

    let response = call(&session, request_type, data).await;
    session.disconnect().await;

    println!("{}", serde_json::to_string_pretty(&response?)?);
    Ok(())
}

async fn call(session: &SessionHandle, request_type: &str, data: Option<Value>) -> Result<Value> {
    match session.request(request_type, data).await {
        Ok(response) => Ok(response),
        Err(e) => bail!("{} failed: {}", request_type, e),
    }
}
