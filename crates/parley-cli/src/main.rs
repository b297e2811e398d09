use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use parley_agents::{
    CompletionClient, ControllerSettings, ConversationController, LlmProvider, OpenAiProvider,
};
use parley_channels::{
    BotCommand, ChannelLifecycle, ChatTransport, HELP_TEXT, OnCommandFn, OnMessageFn,
    TelegramChannel, TelegramHandlers,
};
use parley_common::InboundMessage;
use parley_config::{AppConfig, ConfigLoader};
use parley_db::SqliteDialogStore;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

#[derive(Parser)]
#[command(name = "parley")]
#[command(about = "Telegram chat bot backed by an OpenAI-compatible completion API")]
#[command(version)]
struct Cli {
    /// Directory holding config.yml, chat_modes.yml, models.yml and config.env
    #[arg(long, env = "PARLEY_CONFIG_DIR", default_value = "config")]
    config_dir: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bot (default)
    Run,
    /// Validate the configuration and check the completion API is reachable
    Check,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        fmt().with_env_filter(filter).json().init();
    } else {
        fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = ConfigLoader::new(cli.config_dir.clone())
        .load()
        .with_context(|| format!("failed to load config from {}", cli.config_dir.display()))?;
    config.validate().context("invalid configuration")?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config).await,
        Commands::Check => check(config).await,
    }
}

async fn run(config: AppConfig) -> Result<()> {
    let store = Arc::new(
        SqliteDialogStore::open(&config.database_path).with_context(|| {
            format!("failed to open database {}", config.database_path.display())
        })?,
    );
    let provider = Arc::new(OpenAiProvider::new(
        config.openai_api_key.clone(),
        config.openai_api_base.clone(),
    ));
    let completion = Arc::new(CompletionClient::new(provider, config.completion.clone()));
    let settings = ControllerSettings::from_config(&config)?;
    let default_model = settings.default_model.clone();

    let channel = TelegramChannel::new(&config.telegram_token);
    let transport: Arc<dyn ChatTransport> = Arc::new(channel.create_transport());
    let controller = Arc::new(ConversationController::new(
        store,
        completion,
        Arc::clone(&transport),
        settings,
    ));

    let mut channel = channel.with_handlers(handlers(controller, transport));
    channel
        .connect()
        .await
        .context("failed to connect to Telegram")?;
    info!(model = %default_model, "parley is running, press Ctrl+C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutting down");
    channel.disconnect().await?;
    Ok(())
}

/// Route Telegram updates to the conversation controller.
fn handlers(
    controller: Arc<ConversationController>,
    transport: Arc<dyn ChatTransport>,
) -> TelegramHandlers {
    let on_message: OnMessageFn = {
        let controller = Arc::clone(&controller);
        Arc::new(move |message: InboundMessage| -> HandlerFuture {
            let controller = Arc::clone(&controller);
            Box::pin(async move {
                if let Err(e) = controller.handle_message(message).await {
                    error!("failed to handle message: {e}");
                }
            })
        })
    };

    let on_command: OnCommandFn = Arc::new(
        move |command: BotCommand, message: InboundMessage| -> HandlerFuture {
            let controller = Arc::clone(&controller);
            let transport = Arc::clone(&transport);
            Box::pin(async move {
                let result = match command {
                    BotCommand::Start => controller.start(&message).await.map(drop),
                    BotCommand::New => controller.reset_dialog(&message).await.map(drop),
                    BotCommand::Cancel => {
                        controller.cancel(&message).await;
                        Ok(())
                    }
                    BotCommand::Help => transport
                        .send_text(message.chat_id, HELP_TEXT, message.reply_to)
                        .await
                        .map(drop),
                };
                if let Err(e) = result {
                    error!(command = command.name(), "command failed: {e}");
                }
            })
        },
    );

    TelegramHandlers {
        on_message,
        on_command,
    }
}

async fn check(config: AppConfig) -> Result<()> {
    let settings = ControllerSettings::from_config(&config)?;
    SqliteDialogStore::open(&config.database_path).with_context(|| {
        format!("failed to open database {}", config.database_path.display())
    })?;

    let provider = OpenAiProvider::new(config.openai_api_key, config.openai_api_base);
    if !provider.health_check().await? {
        bail!("completion API did not accept the configured key");
    }
    info!(
        model = %settings.default_model,
        chat_mode = %settings.default_chat_mode,
        "configuration ok, completion API reachable"
    );
    Ok(())
}
