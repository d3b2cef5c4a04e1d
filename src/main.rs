use std::sync::Arc;

use seaguard::components::{
    BusMonitor, Camera, ChatGateway, ChatSink, Commands, Controller, LogSink, MotionSensor,
    PictureManager, PlaceholderCapture, SimulatedProbe,
};
use seaguard::{ConnectionError, LocalBroker, Mesh, MeshConfig};
use tokio::io::{AsyncBufReadExt, BufReader};

async fn start_mesh(
    name: &str,
    config: &MeshConfig,
    broker: &LocalBroker,
) -> Result<Mesh, ConnectionError> {
    Mesh::start(name, config, Arc::new(broker.clone())).await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    env_logger::init();

    let config = MeshConfig::from_env();

    let probe = if config.debug_mode {
        log::warn!("DEBUG MODE ENABLED - simulated motion is frequent and the bus monitor is on");
        SimulatedProbe::new(0.02, 0.1)
    } else {
        SimulatedProbe::default()
    };

    let broker = LocalBroker::new();

    let manager = start_mesh("picture-manager", &config, &broker).await?;
    manager.install(
        PictureManager::new(&config.picture_folder)
            .with_retention(config.retention_days, config.cleanup_interval()),
    )?;

    let camera = start_mesh("camera", &config, &broker).await?;
    camera.install(Camera::new(&config.picture_folder, PlaceholderCapture))?;

    let controller = start_mesh("controller", &config, &broker).await?;
    controller.install(Controller)?;

    let sink: Arc<dyn ChatSink> = Arc::new(LogSink);
    let bot = start_mesh("bot", &config, &broker).await?;
    bot.install(
        ChatGateway::new(sink.clone(), config.default_picture())
            .with_heartbeat(config.chat_heartbeat_interval()),
    )?;
    let commands = Commands::new(sink.clone(), bot.requester(), config.default_picture());

    let mut meshes = vec![manager, camera, controller, bot];

    if config.debug_mode {
        let monitor = start_mesh("monitor", &config, &broker).await?;
        monitor.install(BusMonitor::new())?;
        meshes.push(monitor);
    }

    let sensor = start_mesh("pir-sensor", &config, &broker).await?;
    sensor.install(MotionSensor::new(
        probe,
        config.sensor_poll_interval(),
        config.heartbeat_interval(),
    ))?;
    meshes.push(sensor);

    sink.send_text("Bot started!").await?;
    log::info!("SeaGuard running on {}, type chat commands, Ctrl+C to stop", config.bus_address);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let commands = commands.clone();
                    tokio::spawn(async move {
                        if let Err(error) = commands.run(&line).await {
                            log::error!("Command '{}' failed: {}", line.trim(), error);
                        }
                    });
                }
                Ok(None) => {
                    log::info!("stdin closed, waiting for Ctrl+C");
                    tokio::signal::ctrl_c().await?;
                    break;
                }
                Err(error) => {
                    log::error!("Failed to read stdin: {}", error);
                    break;
                }
            },
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break;
            }
        }
    }

    log::info!("Shutting down");
    for mesh in meshes {
        mesh.shutdown().await;
    }
    Ok(())
}
