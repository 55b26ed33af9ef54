use std::sync::Arc;

use anyhow::{Context, anyhow, bail};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use candidate_intake::config::{
    ExtractionConfig, GmailConfig, ImapConfig, MailBackend, PipelineConfig, RunMode, ServerConfig,
};
use candidate_intake::error::{ConfigError, Result};
use candidate_intake::extraction::{ExtractionAdapter, create_extractor};
use candidate_intake::mail::{GmailSource, ImapSource, MailSource};
use candidate_intake::pipeline::RunCoordinator;
use candidate_intake::scheduler;
use candidate_intake::server::intake_routes;
use candidate_intake::store::{IntakeStore, LibSqlBackend};
use candidate_intake::trigger::RunTrigger;

/// Console logging always; a daily-rolling file too when a log dir is set.
fn init_tracing(server: &ServerConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = tracing_subscriber::fmt::layer().with_target(false);

    match &server.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "intake.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(console).init();
            None
        }
    }
}

fn mail_source(backend: MailBackend) -> Result<Arc<dyn MailSource>> {
    Ok(match backend {
        MailBackend::Imap => {
            let config = ImapConfig::from_env()
                .ok_or_else(|| ConfigError::MissingEnvVar("INTAKE_IMAP_HOST".into()))?;
            tracing::info!(host = %config.host, mailbox = %config.mailbox, "Using IMAP mail source");
            Arc::new(ImapSource::new(config))
        }
        MailBackend::Gmail => {
            let config = GmailConfig::from_env()
                .ok_or_else(|| ConfigError::MissingEnvVar("INTAKE_GMAIL_ACCESS_TOKEN".into()))?;
            tracing::info!(api_base = %config.api_base, "Using Gmail mail source");
            Arc::new(GmailSource::new(config))
        }
    })
}

/// Wire store, mail source and extractor into a trigger.
async fn build_trigger(server: &ServerConfig) -> Result<Arc<RunTrigger>> {
    let pipeline = PipelineConfig::from_env()?;
    let extraction = ExtractionConfig::from_env()?;

    eprintln!("candidate-intake v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", extraction.model);
    eprintln!("   Database: {}", pipeline.db_path.display());

    let store: Arc<dyn IntakeStore> = Arc::new(LibSqlBackend::new_local(&pipeline.db_path).await?);
    let mail = mail_source(server.mail_backend)?;
    let extractor = ExtractionAdapter::new(create_extractor(&extraction)?);
    let coordinator = Arc::new(RunCoordinator::new(store, mail, extractor, &pipeline));
    Ok(Arc::new(RunTrigger::new(coordinator, pipeline.reference_offset)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install rustls crypto provider"))?;

    let server = ServerConfig::from_env().context("server configuration")?;
    let _log_guard = init_tracing(&server);

    let trigger = build_trigger(&server).await.context("startup")?;

    match server.mode {
        RunMode::Once => {
            let report = trigger
                .trigger(server.target_day)
                .await
                .context("intake run")?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.status == candidate_intake::pipeline::types::RunStatus::Failed {
                bail!("run {} failed: {}", report.run_id, report.error.unwrap_or_default());
            }
        }
        RunMode::Serve => {
            if let Some(expr) = &server.cron {
                let schedule = scheduler::parse_schedule(expr)?;
                scheduler::spawn_cron_ticker(Arc::clone(&trigger), schedule);
            }

            let app = intake_routes(trigger);
            let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", server.port))
                .await
                .with_context(|| format!("binding port {}", server.port))?;
            eprintln!("   Trigger API: http://0.0.0.0:{}/api/runs", server.port);
            tracing::info!(port = server.port, "Intake server started");
            axum::serve(listener, app).await.context("http server")?;
        }
    }

    Ok(())
}
