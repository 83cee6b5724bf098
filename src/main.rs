use std::time::Duration;

use anyhow::Result;
use bikelink::infrastructure::logging;
use bikelink::{throttle, BikeLink, SettingsService};
use tracing::{error, info};

/// Display readings at most this often
const READING_INTERVAL: Duration = Duration::from_secs(10);
/// How long `--brake-pulse` keeps the brake light on
const BRAKE_PULSE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let settings = SettingsService::new()?;
    let _logging = logging::init_logger(&settings.get().log_settings)?;
    info!(
        "Starting BikeLink monitor (settings: {})",
        settings.path().display()
    );

    let link = BikeLink::with_btleplug(settings.get()).await?;
    link.wait_for_device().await?;
    info!("Connected to bike chip");

    link.subscribe_temperature(throttle(READING_INTERVAL, |r| {
        info!("Temperature: {:.2} °C", r.value)
    }));
    link.subscribe_humidity(throttle(READING_INTERVAL, |r| {
        info!("Humidity: {:.2} %", r.value)
    }));
    link.subscribe_distance_left(|r| info!("Distance left: {}", r.value));

    if std::env::args().any(|arg| arg == "--brake-pulse") {
        info!("Braking for {:?}", BRAKE_PULSE);
        link.write_braking(true).await;
        tokio::time::sleep(BRAKE_PULSE).await;
        link.write_braking(false).await;
    }

    let mut liveness = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
            _ = liveness.tick() => {
                if !link.is_connected() {
                    error!("Connection to bike lost");
                    break;
                }
            }
        }
    }

    link.destroy_connection().await;
    Ok(())
}
