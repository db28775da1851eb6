//! 主应用程序入口
//!
//! 加载配置、初始化日志、装配会话存储并启动 Axum Web API 服务。

use std::sync::Arc;

use application::{MemoryStore, RouterSettings, SystemClock};
use config::{AppConfig, StorageBackend};
use infrastructure::{create_pg_pool, PgStorage, MIGRATOR};
use tracing_subscriber::EnvFilter;
use web_api::{router, AppState, ChatStorage};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load()?;

    // RUST_LOG 优先于配置文件里的过滤规则
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log.filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!(config = %config.sanitize(), "配置已加载");

    let storage = build_storage(&config).await?;
    let state = AppState::new(
        storage,
        RouterSettings::from(&config.chat),
        Arc::new(SystemClock),
    );

    let app = router(state);
    let address = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&address).await?;

    tracing::info!("聊天服务启动在 http://{}", address);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn build_storage(config: &AppConfig) -> anyhow::Result<ChatStorage> {
    match config.storage.backend {
        StorageBackend::Memory => {
            tracing::warn!("使用进程内存储，重启后数据丢失");
            let seed = &config.storage.seed;
            if seed.users.is_empty() {
                tracing::warn!("storage.seed.users 为空，所有连接都会认证失败");
            }
            let store = MemoryStore::new();
            store.seed(seed).await;
            tracing::info!(
                users = seed.users.len(),
                listings = seed.listings.len(),
                "内存存储已导入初始数据"
            );
            Ok(ChatStorage::from(store))
        }
        StorageBackend::Postgres => {
            let database_url = config
                .storage
                .database_url
                .as_deref()
                .ok_or(config::ConfigError::MissingDatabaseUrl)?;
            if !config.storage.seed.users.is_empty() {
                tracing::warn!("postgres 后端忽略 storage.seed 配置");
            }
            let pool = create_pg_pool(database_url, config.storage.max_connections).await?;

            if config.storage.run_migrations {
                MIGRATOR.run(&pool).await?;
                tracing::info!("数据库迁移完成");
            }

            let pg = PgStorage::new(pool);
            Ok(ChatStorage {
                users: pg.user_repository,
                conversations: pg.conversation_repository,
                messages: pg.message_repository,
                listings: pg.listing_directory,
            })
        }
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "无法监听退出信号");
    }
    tracing::info!("收到退出信号，开始关闭");
}
