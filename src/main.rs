use anyhow::Result;
use serenity::{http::Http, model::gateway::GatewayIntents, Client};
use songbird::{SerenityInit, Songbird};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use guild_music::audio::events::PlaybackEventRouter;
use guild_music::audio::lavalink::LavalinkConnector;
use guild_music::audio::node::AudioNodePool;
use guild_music::audio::registry::SessionRegistry;
use guild_music::audio::voice::SongbirdVoice;
use guild_music::bot::{commands::MusicCommands, MusicBot};
use guild_music::config::Config;
use guild_music::presence::DiscordPresence;
use guild_music::sources::{InvidiousSearch, NodeSearch, SearchBackend, TrackResolver, YouTubeMixAutoplay};
use guild_music::storage::JsonStorage;

#[tokio::main]
async fn main() -> Result<()> {
    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("guild_music=debug".parse()?)
                .add_directive("serenity=info".parse()?)
                .add_directive("songbird=info".parse()?),
        )
        .init();

    info!("🎵 Iniciando Guild Music v{}", env!("CARGO_PKG_VERSION"));

    // Cargar configuración
    let config = Config::load()?;
    info!("{}", config.summary());

    // Inicializar almacenamiento JSON
    let storage = Arc::new(JsonStorage::new(config.data_dir.clone()).await?);

    // Lavalink necesita el id del bot antes de abrir el websocket
    let http = Http::new(&config.discord_token);
    let bot_id = http.get_current_user().await?.id;

    // Pool de nodos
    info!("🎼 Inicializando Lavalink...");
    let connector = Arc::new(LavalinkConnector::new(bot_id.get())?);
    let pool = Arc::new(AudioNodePool::new(
        config.primary_node(),
        config.backup_node(),
        connector,
        config.pool_settings(),
    ));

    // Búsqueda: Invidious primero (si hay instancias), luego el propio nodo
    let mut backends: Vec<Arc<dyn SearchBackend>> = Vec::new();
    if !config.invidious_instances.is_empty() {
        backends.push(Arc::new(InvidiousSearch::new(
            config.invidious_instances.clone(),
            pool.clone(),
        )?));
    }
    backends.push(Arc::new(NodeSearch::new(pool.clone())));
    let resolver = Arc::new(TrackResolver::new(pool.clone(), backends, config.search_timeout()));

    let songbird = Songbird::serenity();
    let presence = Arc::new(DiscordPresence::new());
    let registry = Arc::new(SessionRegistry::new(
        pool.clone(),
        resolver.clone(),
        Arc::new(SongbirdVoice::new(songbird.clone())),
        presence.clone(),
        Arc::new(YouTubeMixAutoplay::new(resolver.clone())),
        config.registry_settings(),
    ));

    let shutdown = CancellationToken::new();
    let router = PlaybackEventRouter::new(registry.clone()).spawn(pool.subscribe(), shutdown.clone());

    let commands = Arc::new(MusicCommands::new(registry.clone(), resolver, storage));
    let handler = MusicBot::new(registry.clone(), pool, presence, commands);

    // Configurar intents mínimos necesarios
    let intents = GatewayIntents::GUILDS | GatewayIntents::GUILD_VOICE_STATES;

    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler(handler)
        .register_songbird_with(songbird)
        .await?;

    // Manejar shutdown graceful
    let shard_manager = client.shard_manager.clone();
    let on_signal = shutdown.clone();
    let sessions = registry.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Error al registrar Ctrl+C: {:?}", e);
            return;
        }
        info!("⚠️ Señal de shutdown recibida, cerrando...");
        sessions.shutdown().await;
        on_signal.cancel();
        shard_manager.shutdown_all().await;
    });

    // Iniciar bot
    info!("🚀 Bot iniciado exitosamente");
    if let Err(why) = client.start().await {
        error!("Error al ejecutar cliente: {:?}", why);
    }

    shutdown.cancel();
    if let Err(e) = router.await {
        error!("Router de eventos terminó con error: {:?}", e);
    }

    Ok(())
}
