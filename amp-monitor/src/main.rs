//! Amplifier Monitor
//!
//! Keeps sessions open to the configured amplifiers, routes their gain and
//! mute readings to display channels, and logs every event until Ctrl-C.

mod cli;
mod settings;

use amp_router::{DeviceAddress, RouterEvent, RouterHandle};
use amp_sim::{VirtualAmpServer, VirtualAmplifier};
use anyhow::{Context, Result};
use clap::Parser;
use cli::Cli;
use settings::Settings;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Include all our crates in the default filter
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "amp_monitor=info,amp_protocol=info,amp_router=info,amp_sim=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    info!("Starting amp-monitor");

    let path = match cli.config.clone() {
        Some(path) => path,
        None => Settings::settings_path().context("Could not determine settings path")?,
    };
    let mut settings = Settings::load_from(&path);
    info!("Using settings {}", path.display());

    if let Some(device) = cli.device.clone() {
        settings.assignments.set_default_address(Some(device));
    }
    for assignment in &cli.assignments {
        assignment
            .apply(&mut settings.assignments)
            .with_context(|| format!("Invalid assignment for {}", assignment.channel))?;
    }
    settings.remember_devices();

    if cli.save {
        settings.save_to(&path)?;
        info!("Saved settings to {}", path.display());
    }

    // The loopback port changes every run, so it is never saved
    let simulator = if cli.simulate {
        let amp = VirtualAmplifier::from_config(&settings.simulator);
        let server = VirtualAmpServer::bind_port(amp, settings.simulator.port)
            .await
            .context("Failed to start virtual amplifier")?;
        settings
            .assignments
            .set_default_address(Some(DeviceAddress::new("127.0.0.1", server.port())));
        Some(server)
    } else {
        None
    };

    if settings.assignments.default_address().is_none() {
        warn!("No default device; unassigned channels will not report");
    }

    let (router, router_task) =
        RouterHandle::spawn(settings.router.clone(), Default::default());
    let mut events = router.subscribe();
    router.load_assignments(settings.assignments.clone()).await?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                if let Err(e) = result {
                    warn!("Failed to listen for Ctrl-C: {}", e);
                }
                info!("Shutting down");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => report(&event, cli.json),
                Err(RecvError::Lagged(n)) => warn!("Event log fell behind, skipped {} events", n),
                Err(RecvError::Closed) => break,
            }
        }
    }

    if let Err(e) = router.shutdown().await {
        debug!("Router already stopped: {}", e);
    }
    router_task.await.context("Router task failed")?;

    if let Some(server) = simulator {
        server.shutdown().await;
    }

    Ok(())
}

/// Log one outbound event, or print it as a JSON line
fn report(event: &RouterEvent, json: bool) {
    if json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{}", line),
            Err(e) => warn!("Failed to encode event: {}", e),
        }
        return;
    }

    match event {
        RouterEvent::Status { connected, address } => {
            let state = if *connected { "connected" } else { "disconnected" };
            info!("{} {}", address, state);
        }
        RouterEvent::SessionState { address, state } => {
            debug!("Session {} is {}", address, state);
        }
        RouterEvent::ChannelSample { channel, level, .. } => {
            info!("{} gain {}", channel, level);
        }
        RouterEvent::MuteSample { slot, muted, .. } => {
            info!("{} {}", slot, if *muted { "muted" } else { "unmuted" });
        }
        RouterEvent::Error { source, message } => {
            warn!("{}: {}", source, message);
        }
    }
}
