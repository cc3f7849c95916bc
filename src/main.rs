use std::{sync::Arc, time::Duration};

use anyhow::Context;
use clap::{Parser, Subcommand};
use sqlx::{postgres::PgPoolOptions, PgPool};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use wa_agent::{
    agent::AgentScheduler,
    config::Settings,
    credentials::SealedCredentials,
    error::ConfigError,
    drive::DriveClient,
    followup::FollowupScheduler,
    inbound::{run_consumers, InboundWorker},
    llm::{self, LlmClient},
    queue::{PgQueue, WorkQueue},
    shutdown::install_signal_handler,
    store::{ConversationStore, PgStore},
    transcoder::Transcoder,
    webhook::{router, ReceiverState},
    whatsapp::WhatsAppClient,
};

#[derive(Parser, Debug)]
#[command(name = "wa-agent")]
#[command(about = "WhatsApp customer-service agent")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// HTTP webhook receiver
    Receiver,
    /// Inbound queue consumers
    Worker,
    /// Reply scheduler and follow-up engine
    Scheduler,
    /// Every role in one process
    All,
    /// Encrypt a vendor access token for the tenants table
    SealToken {
        /// Plain access token
        token: String,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "wa_agent=info,tower_http=info,warn".into());
    let json = std::env::var("LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn sealed_credentials(settings: &Settings) -> Result<SealedCredentials, ConfigError> {
    SealedCredentials::from_base64_key(settings.require_credentials_key()?).map_err(|err| ConfigError::Invalid {
        name: "CREDENTIALS_KEY",
        reason: err.to_string(),
    })
}

async fn connect(url: &str, max_connections: u32) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(url)
        .await
        .context("failed to connect to postgres")
}

struct Services {
    store: Arc<PgStore>,
    queue: Arc<PgQueue>,
    whatsapp: WhatsAppClient,
    llm: Arc<LlmClient>,
    transcoder: Transcoder,
    drive: DriveClient,
}

async fn build_services(settings: &Settings) -> anyhow::Result<Services> {
    let pool = connect(&settings.database_url, 10).await?;
    let store = Arc::new(PgStore::new(pool.clone()));
    store.migrate().await.context("failed to run migrations")?;

    let queue_pool = if settings.queue_url == settings.database_url {
        pool
    } else {
        connect(&settings.queue_url, 5).await?
    };
    let queue = Arc::new(PgQueue::new(queue_pool, &settings.queue_name));

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(60))
        .build()
        .context("failed to build http client")?;
    let credentials = sealed_credentials(settings)?;
    let transcoder = Transcoder::new(settings.ffmpeg_path.clone());
    let whatsapp = WhatsAppClient::new(
        http.clone(),
        &settings.graph_api_base,
        &settings.graph_api_version,
        Arc::new(credentials),
        transcoder.clone(),
    );

    let keys = settings.require_llm_keys()?.to_vec();
    let llm_http = llm::http_client().context("failed to build LLM http client")?;
    let llm = LlmClient::new(
        llm_http,
        &settings.llm_api_base,
        &settings.llm_model,
        keys,
        store.clone(),
    )
    .with_tries_per_key(settings.llm_tries_per_key)
    .with_json_retries(settings.llm_json_retries);
    let drive = DriveClient::new(http, &settings.drive_api_base, &settings.drive_access_token);

    Ok(Services {
        store,
        queue,
        whatsapp,
        llm: Arc::new(llm),
        transcoder,
        drive,
    })
}

async fn serve_receiver(
    settings: &Settings,
    queue: Arc<dyn WorkQueue>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let state = ReceiverState {
        queue,
        verify_token: settings.require_verify_token()?.to_string(),
        app_secret: settings.app_secret.clone(),
    };
    let app = router(state, &settings.frontend_origins);
    let addr = format!("0.0.0.0:{}", settings.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    if settings.webhook_base_url.is_empty() {
        info!(%addr, "webhook receiver listening");
    } else {
        info!(%addr, callback = %format!("{}/webhook", settings.webhook_base_url), "webhook receiver listening");
    }
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("receiver runtime failure")
}

fn spawn_worker(services: &Services, settings: &Settings, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
    services.queue.spawn_listener(shutdown.clone());
    let store: Arc<dyn ConversationStore> = services.store.clone();
    let worker = Arc::new(InboundWorker::new(
        store,
        services.whatsapp.clone(),
        services.llm.clone(),
        services.transcoder.clone(),
        settings.flood_cutoff,
    ));
    let queue: Arc<dyn WorkQueue> = services.queue.clone();
    tokio::spawn(run_consumers(worker, queue, settings.worker_concurrency, shutdown))
}

fn spawn_schedulers(
    services: &Services,
    settings: &Settings,
    shutdown: CancellationToken,
) -> Vec<tokio::task::JoinHandle<()>> {
    let store: Arc<dyn ConversationStore> = services.store.clone();
    let agent = Arc::new(AgentScheduler::new(
        store.clone(),
        services.whatsapp.clone(),
        services.llm.clone(),
        services.drive.clone(),
        settings.settle_delay,
        settings.agent_batch_size,
    ));
    let followup = Arc::new(FollowupScheduler::new(
        store,
        services.whatsapp.clone(),
        services.llm.clone(),
    ));
    vec![
        tokio::spawn(agent.run(settings.agent_poll, shutdown.clone())),
        tokio::spawn(followup.run(settings.followup_poll, shutdown)),
    ]
}

async fn join_tasks(tasks: Vec<tokio::task::JoinHandle<()>>) {
    for result in futures_util::future::join_all(tasks).await {
        if let Err(err) = result {
            error!(error = %err, "background task panicked");
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let settings = Settings::from_env();

    if let Command::SealToken { token } = &cli.command {
        let credentials = sealed_credentials(&settings)?;
        println!("{}", credentials.seal(token.trim())?);
        return Ok(());
    }

    if let Command::Receiver = cli.command {
        let pool = connect(&settings.queue_url, 5).await?;
        PgStore::new(pool.clone())
            .migrate()
            .await
            .context("failed to run migrations")?;
        let queue = Arc::new(PgQueue::new(pool, &settings.queue_name));
        serve_receiver(&settings, queue, install_signal_handler()).await?;
        info!("shutdown complete");
        return Ok(());
    }

    let services = build_services(&settings).await?;
    let shutdown = install_signal_handler();

    match cli.command {
        Command::Worker => {
            join_tasks(vec![spawn_worker(&services, &settings, shutdown)]).await;
        }
        Command::Scheduler => {
            join_tasks(spawn_schedulers(&services, &settings, shutdown)).await;
        }
        Command::All => {
            let mut tasks = spawn_schedulers(&services, &settings, shutdown.clone());
            tasks.push(spawn_worker(&services, &settings, shutdown.clone()));
            let served = serve_receiver(&settings, services.queue.clone(), shutdown.clone()).await;
            shutdown.cancel();
            join_tasks(tasks).await;
            served?;
        }
        Command::Receiver | Command::SealToken { .. } => {}
    }
    info!("shutdown complete");
    Ok(())
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        error!(error = %format!("{err:#}"), "fatal");
        std::process::exit(1);
    }
}
