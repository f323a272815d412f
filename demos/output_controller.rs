use output_controller::{
    control_interface, ChannelKind, ControlCommand, ControllerConfig, OutputController,
    SimulatedBoard, WaveShape,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    info!("Starting output controller demo on the simulated board");

    let board = Arc::new(SimulatedBoard::new());
    let controller = Arc::new(
        OutputController::start(ControllerConfig::default(), board.clone(), board.clone()).await?,
    );

    let (control_tx, control_rx) = mpsc::channel(10);
    let (status_tx, mut status_rx) = broadcast::channel(16);

    let interface_task = tokio::spawn(control_interface(controller.clone(), control_rx, status_tx));

    info!("Sending control commands...");
    control_tx
        .send(ControlCommand::StartWave {
            channel: ChannelKind::Voltage,
            shape: WaveShape::Sine,
            min: 0.0,
            max: 3.3,
            frequency: 1.0,
        })
        .await?;
    control_tx
        .send(ControlCommand::StartRamp {
            channel: ChannelKind::Current,
            start: 4.0,
            end: 20.0,
            duration: Duration::from_secs(2),
        })
        .await?;
    control_tx.send(ControlCommand::StartRelaySwitching(2.0)).await?;

    // out of range, logged and ignored
    control_tx
        .send(ControlCommand::SetConstant(ChannelKind::Voltage, 5.0))
        .await?;

    sleep(Duration::from_secs(3)).await;

    while let Ok(status) = status_rx.try_recv() {
        info!("Status: {:?}", status);
    }
    info!(
        "Board saw {} voltage, {} current and {} relay writes",
        board.voltages().len(),
        board.currents().len(),
        board.relay_levels().len()
    );

    control_tx.send(ControlCommand::StopAll).await?;
    drop(control_tx);

    match interface_task.await? {
        Ok(()) => info!("Output controller demo completed"),
        Err(e) => error!("Control interface error: {}", e),
    }
    Ok(())
}
