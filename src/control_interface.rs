use crate::controller::{OutputController, Status};
use crate::error::Error;
use crate::waveform::WaveSpec;
use crate::ControlCommand;
use anyhow::{anyhow, Result};
use std::sync::Arc;
use tokio::sync::broadcast::Sender as BroadcastSender;
use tokio::sync::mpsc::Receiver;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const STATUS_INTERVAL: Duration = Duration::from_millis(500);

/// Applies control commands until the command channel closes, then parks
/// every output. A status snapshot is broadcast after each command and
/// every `STATUS_INTERVAL`, so a finished ramp shows up without a request.
pub async fn control_interface(
    controller: Arc<OutputController>,
    mut control_rx: Receiver<ControlCommand>,
    status_tx: BroadcastSender<Status>,
) -> Result<()> {
    info!("control interface started");
    let mut status_timer = interval(STATUS_INTERVAL);
    status_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            command = control_rx.recv() => {
                let Some(command) = command else {
                    break;
                };
                match apply_command(&controller, command.clone()).await {
                    Ok(()) => info!("{:?} applied", command),
                    Err(e) if e.is_fatal() => {
                        error!("{:?} failed: {}, shutting down outputs", command, e);
                        if let Err(shutdown) = controller.shutdown().await {
                            error!("shutdown after consistency failure incomplete: {}", shutdown);
                        }
                        return Err(anyhow!("control interface aborted: {}", e));
                    }
                    Err(e) => warn!("{:?} rejected: {}", command, e),
                }
                publish(&status_tx, controller.status());
            },
            _ = status_timer.tick() => {
                publish(&status_tx, controller.status());
            }
        }
    }

    info!("control channel closed, parking outputs");
    controller.shutdown().await?;
    info!("control interface completed");
    Ok(())
}

fn publish(status_tx: &BroadcastSender<Status>, status: Status) {
    if let Err(e) = status_tx.send(status) {
        debug!("no status subscribers: {}", e);
    }
}

async fn apply_command(controller: &OutputController, command: ControlCommand) -> Result<(), Error> {
    match command {
        ControlCommand::SetConstant(channel, value) => {
            controller.apply(channel, WaveSpec::Constant(value)).await
        }
        ControlCommand::StartWave {
            channel,
            shape,
            min,
            max,
            frequency,
        } => {
            controller
                .apply(channel, WaveSpec::periodic(shape, min, max, frequency))
                .await
        }
        ControlCommand::StartRamp {
            channel,
            start,
            end,
            duration,
        } => controller.apply(channel, WaveSpec::ramp(start, end, duration)).await,
        ControlCommand::StartTable {
            channel,
            values,
            frequency,
        } => controller.apply(channel, WaveSpec::table(values, frequency)).await,
        ControlCommand::Stop(channel) => controller.channel(channel).stop().await,
        ControlCommand::StartRelaySwitching(frequency) => {
            controller.start_relay_switching(frequency).await
        }
        ControlCommand::SetRelay(on) => controller.set_relay(on).await,
        ControlCommand::PulseRelay(duration) => controller.pulse_relay(duration).await,
        ControlCommand::StopRelay => controller.stop_relay().await,
        ControlCommand::StopAll => controller.stop_all().await,
    }
}
