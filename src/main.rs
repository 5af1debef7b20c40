use nuke_warden::acl::SerenityPlatform;
use nuke_warden::handlers::Handler;
use nuke_warden::notify::HttpSink;
use nuke_warden::{BOT_NAME, CoreBuilder, CoreConfig, Error, commands, logging};
use poise::serenity_prelude::{self as serenity, GatewayIntents, Http};
use std::sync::Arc;
use tracing::{error, info};

/// Main function to run the bot
async fn async_main() -> Result<(), Error> {
    logging::init()?;

    let config = CoreConfig::load().await?;
    let token = config.token.clone();

    // The permission cache needs the bot's id before the gateway connects
    let http = Arc::new(Http::new(&token));
    let bot_id = http.get_current_user().await?.id.get();

    let core = CoreBuilder::new(config, bot_id)
        .platform(Arc::new(SerenityPlatform::new(Arc::clone(&http))))
        .channel_sink(Arc::new(HttpSink(Arc::clone(&http))))
        .build()
        .await?;
    core.start();
    {
        let dispatcher = core.dispatcher().clone();
        tokio::spawn(async move { dispatcher.warm_connections().await });
    }

    let data = core.clone();
    let framework = poise::Framework::builder()
        .options(poise::FrameworkOptions {
            commands: vec![
                commands::ping(),
                commands::antinuke(),
                commands::antinuke_stats(),
            ],
            pre_command: |ctx| {
                Box::pin(async move {
                    logging::log_command_start(ctx);
                })
            },
            post_command: |ctx| {
                Box::pin(async move {
                    logging::log_command_end(ctx);
                })
            },
            on_error: |error| {
                Box::pin(async move {
                    logging::log_command_error(&error);
                })
            },
            ..Default::default()
        })
        .setup(|ctx, _ready, framework| {
            Box::pin(async move {
                logging::log_console("Registering commands");
                poise::builtins::register_globally(ctx, &framework.options().commands).await?;
                Ok(data)
            })
        })
        .build();

    let intents = GatewayIntents::non_privileged()
        | GatewayIntents::GUILD_MEMBERS
        | GatewayIntents::MESSAGE_CONTENT;
    let mut client = serenity::ClientBuilder::new(token, intents)
        .event_handler(Handler::new(core.clone()))
        .framework(framework)
        .await?;

    let shard_manager = Arc::clone(&client.shard_manager);
    let signal_core = core.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            signal_core.shutdown();
            shard_manager.shutdown_all().await;
        }
    });

    info!(bot_id, "Starting {BOT_NAME}...");
    client.start().await?;
    core.shutdown();
    Ok(())
}

fn main() {
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Failed to start runtime: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = runtime.block_on(async_main()) {
        error!(error = %err, "Fatal error");
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}
