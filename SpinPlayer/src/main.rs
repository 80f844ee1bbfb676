use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use spnaudio::{AudioPipeline, CpalSink, PipelineConfig};
use spnsession::{BackoffConfig, Session, SessionConfig, SessionEvents};
use spnsync::{KalmanConfig, SharedClock};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ========== PHASE 1 : Configuration et journalisation ==========

    let config = spnconfig::get_config();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.get_log_level().unwrap_or_else(|_| "info".into())));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let url = config.get_server_url()?;
    if url.is_empty() {
        bail!(
            "server.url is not configured; set it in config.yaml or via \
             SPINPLAYER_CONFIG__SERVER__URL"
        );
    }

    // ========== PHASE 2 : Horloge et pipeline audio ==========

    info!("🕰️  Initializing clock synchronizer...");
    let clock = SharedClock::new(KalmanConfig {
        forget_factor: config.get_forget_factor()?,
        adaptive_cutoff: config.get_adaptive_cutoff()?,
        min_samples_for_forgetting: config.get_min_samples_for_forgetting()? as u32,
        ..KalmanConfig::default()
    });
    clock.set_static_delay_micros((config.get_static_delay_ms()? * 1_000.0) as i64);

    info!("🔊 Initializing audio pipeline...");
    let pipeline = AudioPipeline::new(
        PipelineConfig {
            buffer_capacity_ms: config.get_buffer_capacity_ms()?,
            buffer_target_ms: config.get_buffer_target_ms()?,
        },
        clock.clone(),
        Box::new(|| Box::new(CpalSink::new())),
    );

    let events = SessionEvents {
        metadata: Some(Arc::new(|metadata| {
            info!(
                title = metadata.title.as_deref().unwrap_or("?"),
                artist = metadata.artist.as_deref().unwrap_or("?"),
                "🎵 Now playing"
            );
        })),
        error: Some(Arc::new(|message| {
            tracing::error!(error = %message, "⚠️ Player error");
        })),
        ..SessionEvents::default()
    };

    // ========== PHASE 3 : Session ==========

    let session_config = SessionConfig {
        url: url.clone(),
        client_id: config.get_client_id()?,
        player_name: config.get_player_name()?,
        backoff: BackoffConfig {
            base_delay_ms: config.get_reconnect_base_delay_ms()?,
            multiplier: config.get_reconnect_multiplier()?,
            max_delay_ms: config.get_reconnect_max_delay_ms()?,
        },
        wait_for_convergence: config.get_wait_for_convergence()?,
        convergence_timeout: Duration::from_millis(config.get_convergence_timeout_ms()?),
    };

    info!(url = %url, "📡 Connecting to controller server...");
    let mut session = Session::new(session_config, clock, pipeline, events);

    let cancel = CancellationToken::new();
    let session_cancel = cancel.clone();
    let mut session_task = tokio::spawn(async move { session.run(session_cancel).await });

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for shutdown signal")?;
            info!("🛑 Shutdown requested");
            cancel.cancel();
            session_task
                .await
                .context("session task panicked")?
                .context("session ended with an error")?;
        }
        result = &mut session_task => {
            result
                .context("session task panicked")?
                .context("session ended with an error")?;
        }
    }

    info!("✅ SpinPlayer stopped");
    Ok(())
}
