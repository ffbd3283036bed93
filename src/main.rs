use log::{error, info};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use actix_web::{App, HttpServer, web};

use pinwire::{
    AppConfig, AppError, AppState, BackendConfig, GpioBackend, GpioManager, MockGpioBackend,
    PigpioBackend, api_scope,
};

#[cfg(feature = "hardware-gpio")]
use pinwire::LibgpiodBackend;

fn build_backend(config: &AppConfig) -> Result<Arc<dyn GpioBackend>, AppError> {
    match &config.backend {
        #[cfg(feature = "hardware-gpio")]
        BackendConfig::Libgpiod => Ok(Arc::new(LibgpiodBackend::new()?)),
        #[cfg(not(feature = "hardware-gpio"))]
        BackendConfig::Libgpiod => Err(AppError::Config(
            "libgpiod backend requires the hardware-gpio feature".into(),
        )),
        BackendConfig::Mock => Ok(Arc::new(MockGpioBackend::default())),
        BackendConfig::Pigpio(pigpio) => Ok(Arc::new(PigpioBackend::connect(pigpio)?)),
    }
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("PINWIRE_CONFIG").ok())
        .unwrap_or_else(|| "config.json".to_string());
    let config = Arc::new(
        AppConfig::load_from_file(&config_path)
            .unwrap_or_else(|e| panic!("Failed to load config: {e}")),
    );

    let backend =
        build_backend(&config).unwrap_or_else(|e| panic!("Failed to init GPIO backend: {e}"));

    let manager = Arc::new(GpioManager::new(config.clone(), backend));
    let app_state = AppState {
        manager: manager.clone(),
    };

    let http_cfg = config.http.clone();
    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .service(api_scope::<dyn GpioBackend>(&http_cfg.path))
    })
    .client_request_timeout(Duration::from_secs(config.http.timeout));

    let bind_addrs: String;
    let http_cfg = config.http.clone();
    let server = match (&http_cfg.unix_socket, &http_cfg.host) {
        (Some(socket_path), Some(host)) => {
            if Path::new(socket_path).exists() {
                fs::remove_file(socket_path)?;
            }
            bind_addrs = format!("{} and {}", socket_path, host);

            server.bind_uds(socket_path)?.bind_auto_h2c(host)?
        }
        (Some(socket_path), None) => {
            if Path::new(socket_path).exists() {
                fs::remove_file(socket_path)?;
            }
            bind_addrs = socket_path.clone();

            server.bind_uds(socket_path)?
        }
        (None, Some(host)) => {
            bind_addrs = host.clone();

            server.bind_auto_h2c(host)?
        }
        _ => {
            panic!("Config error: either 'unix_socket' or 'host' must be specified")
        }
    };

    info!("Starting server on {}...", bind_addrs);

    let result = server.run().await;

    // monitors block while they stop, keep that off the runtime
    let stopped = web::block(move || manager.shutdown()).await;
    match stopped {
        Ok(Ok(())) => info!("GPIO backend released"),
        Ok(Err(e)) => error!("GPIO backend shutdown failed: {e}"),
        Err(e) => error!("GPIO backend shutdown worker failed: {e}"),
    }

    result
}
