use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Local;
use tokio::sync::watch;

use xrelay::config::{self, ConfigManager};
use xrelay::metrics::RelayMetrics;
use xrelay::{api, rtmp, srt, whip, Registry};

/// Tees log output to stdout and the configured log file.
struct MultiWriter {
    file: std::fs::File,
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        std::io::stdout().write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        std::io::stdout().flush()?;
        self.file.flush()
    }
}

fn init_logger(settings: &config::Settings) -> Result<()> {
    let env = env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info");
    let mut builder = env_logger::Builder::from_env(env);
    builder.format(|buf, record| {
        writeln!(
            buf,
            "{} {} [{}] {}",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            record.level(),
            record.module_path().unwrap_or("<unnamed>"),
            &record.args()
        )
    });

    if settings.log_to_file {
        let file = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&settings.log_file)?;
        builder.target(env_logger::Target::Pipe(Box::new(MultiWriter { file })));
    }

    builder.init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let manager = match ConfigManager::new() {
        Ok(manager) => manager,
        Err(err) => {
            eprintln!("Failed to load config: {}", err);
            std::process::exit(1);
        }
    };
    let config_path = manager.path().to_path_buf();
    let settings = manager.into_settings();

    init_logger(&settings)?;

    let server_cfg = settings.server.clone();
    let registry: Arc<Registry> = Arc::new(Registry::new(settings, config_path));
    let relay_metrics: Arc<RelayMetrics> = RelayMetrics::new();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::new();

    // RTMP ingest
    let rtmp_service = rtmp::Service::new(registry.clone(), relay_metrics.clone());
    handles.push(tokio::spawn(
        rtmp_service.run(server_cfg.rtmp_port, shutdown_rx.clone()),
    ));

    // SRT ingest
    let srt_service = srt::Service::new(registry.clone(), relay_metrics.clone());
    handles.push(tokio::spawn(
        srt_service.run(server_cfg.srt_port, shutdown_rx.clone()),
    ));

    // WHIP ingest
    let whip_service = whip::Service::new(registry.clone(), relay_metrics.clone());
    handles.push(tokio::spawn(
        whip_service.run(server_cfg.whip_port, shutdown_rx.clone()),
    ));

    // HTTP control plane
    let api_server = api::ApiServer::new(
        registry.clone(),
        relay_metrics.clone(),
        server_cfg.api_username.clone(),
        server_cfg.api_password.clone(),
    );
    let api_handle = tokio::spawn(api_server.run(server_cfg.port, shutdown_rx.clone()));

    wait_for_shutdown().await;
    log::info!("Shutdown signal received");
    let _ = shutdown_tx.send(true);

    // the HTTP control plane gets a bounded drain window
    if tokio::time::timeout(Duration::from_secs(5), api_handle)
        .await
        .is_err()
    {
        log::warn!("API server did not stop within the shutdown budget");
    }

    // listeners stop accepting on the signal and wait for their ingest
    // sessions to drain
    for handle in handles {
        let _ = handle.await;
    }

    log::info!("All services stopped");
    Ok(())
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                log::error!("Failed to install SIGTERM handler: {}", err);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
