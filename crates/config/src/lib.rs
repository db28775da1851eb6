//! 统一配置中心
//!
//! 提供聊天服务的全局配置管理，包括：
//! - 服务监听地址
//! - 会话存储后端
//! - 聊天协议参数
//! - 日志过滤
//!
//! 加载顺序：默认值 -> 可选配置文件（`APP_CONFIG_FILE`）-> `APP_` 前缀环境变量。

use std::collections::HashSet;

use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use validator::Validate;

/// 全局应用配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AppConfig {
    /// 服务配置
    #[validate(nested)]
    pub server: ServerConfig,
    /// 存储配置
    #[validate(nested)]
    pub storage: StorageConfig,
    /// 聊天协议配置
    #[validate(nested)]
    pub chat: ChatConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ServerConfig {
    #[validate(length(min = 1))]
    pub host: String,
    #[validate(range(min = 1))]
    pub port: u16,
}

/// 存储后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// 进程内存储，仅用于开发和测试
    Memory,
    Postgres,
}

/// 存储配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    #[validate(url)]
    pub database_url: Option<String>,
    #[validate(range(min = 1))]
    pub max_connections: u32,
    #[serde(default)]
    pub run_migrations: bool,
    /// 内存后端启动时导入的数据，postgres 后端忽略
    #[serde(default)]
    #[validate(nested)]
    pub seed: SeedConfig,
}

/// 内存后端的初始数据。账户与商品由外部子系统维护，
/// 本地运行时需要在这里声明可登录的用户。
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct SeedConfig {
    #[serde(default)]
    #[validate(nested)]
    pub users: Vec<SeedUser>,
    #[serde(default)]
    pub listings: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SeedUser {
    #[validate(range(min = 1))]
    pub id: i64,
    #[validate(length(min = 1))]
    pub display_name: String,
    #[validate(length(min = 1))]
    pub session_token: String,
}

/// 聊天协议配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ChatConfig {
    /// 新消息通知里预览文本的最大字符数
    #[validate(range(min = 1, max = 500))]
    pub preview_chars: usize,
    /// 加入会话频道时是否要求连接用户是会话参与者
    pub enforce_join_membership: bool,
    /// 历史消息单页上限
    #[validate(range(min = 1, max = 500))]
    pub history_page_limit: u32,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// `EnvFilter` 指令，`RUST_LOG` 优先
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info,sqlx=warn".to_string(),
        }
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            preview_chars: 60,
            enforce_join_membership: true,
            history_page_limit: 100,
        }
    }
}

impl Default for AppConfig {
    /// 默认配置使用内存存储，只适合本地开发
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".into(),
                port: 8080,
            },
            storage: StorageConfig {
                backend: StorageBackend::Memory,
                database_url: None,
                max_connections: 10,
                run_migrations: false,
                seed: SeedConfig::default(),
            },
            chat: ChatConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl AppConfig {
    /// 按 默认值 -> 配置文件 -> 环境变量 的优先级加载配置
    pub fn load() -> Result<Self, ConfigError> {
        let mut fig = Figment::new().merge(Serialized::defaults(AppConfig::default()));
        if let Ok(path) = std::env::var("APP_CONFIG_FILE") {
            if path.ends_with(".yml") || path.ends_with(".yaml") {
                fig = fig.merge(Yaml::file(path));
            } else if path.ends_with(".json") {
                fig = fig.merge(Json::file(path));
            } else {
                fig = fig.merge(Toml::file(path));
            }
        }
        fig = fig.merge(Env::prefixed("APP_").split("__"));
        Self::from_figment(fig)
    }

    /// 从已组装好的 figment 中提取并校验配置
    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let cfg: AppConfig = figment
            .extract()
            .map_err(|err| ConfigError::Load(Box::new(err)))?;
        cfg.check()?;
        Ok(cfg)
    }

    /// 字段校验之外的跨字段约束
    pub fn check(&self) -> Result<(), ConfigError> {
        self.validate()?;
        if self.storage.backend == StorageBackend::Postgres && self.storage.database_url.is_none()
        {
            return Err(ConfigError::MissingDatabaseUrl);
        }

        let users = &self.storage.seed.users;
        let mut ids = HashSet::new();
        let mut tokens = HashSet::new();
        for user in users {
            if !ids.insert(user.id) {
                return Err(ConfigError::DuplicateSeed(format!("user id {}", user.id)));
            }
            if !tokens.insert(user.session_token.as_str()) {
                return Err(ConfigError::DuplicateSeed(format!(
                    "session token of user {}",
                    user.id
                )));
            }
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// 用于日志输出的脱敏表示
    pub fn sanitize(&self) -> String {
        let mut copy = self.clone();
        if let Some(url) = copy.storage.database_url.as_mut() {
            if let Some(at) = url.rfind('@') {
                *url = format!("postgres://[REDACTED]{}", &url[at..]);
            }
        }
        for user in &mut copy.storage.seed.users {
            user.session_token = "[REDACTED]".to_string();
        }
        format!("{:?}", copy)
    }
}

/// 配置错误类型
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(Box<figment::Error>),
    #[error("invalid configuration: {0}")]
    Invalid(#[from] validator::ValidationErrors),
    #[error("storage.database_url is required for the postgres backend")]
    MissingDatabaseUrl,
    #[error("duplicate seed entry: {0}")]
    DuplicateSeed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> Figment {
        Figment::new().merge(Serialized::defaults(AppConfig::default()))
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::from_figment(defaults()).expect("defaults");
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.chat.preview_chars, 60);
        assert!(config.chat.enforce_join_membership);
        assert_eq!(config.bind_address(), "127.0.0.1:8080");
    }

    #[test]
    fn test_toml_overrides_defaults() {
        let fig = defaults().merge(Toml::string(
            r#"
            [server]
            port = 9090

            [storage]
            backend = "postgres"
            database_url = "postgres://chat:secret@db:5432/market"

            [chat]
            enforce_join_membership = false
            "#,
        ));
        let config = AppConfig::from_figment(fig).expect("toml config");
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.storage.backend, StorageBackend::Postgres);
        assert!(!config.chat.enforce_join_membership);
        assert_eq!(config.chat.history_page_limit, 100);
    }

    #[test]
    fn test_postgres_requires_database_url() {
        let fig = defaults().merge(Serialized::default("storage.backend", "postgres"));
        let err = AppConfig::from_figment(fig).unwrap_err();
        assert!(matches!(err, ConfigError::MissingDatabaseUrl));
    }

    #[test]
    fn test_field_validation() {
        let fig = defaults().merge(Serialized::default("chat.preview_chars", 0));
        assert!(matches!(
            AppConfig::from_figment(fig),
            Err(ConfigError::Invalid(_))
        ));

        let fig = defaults().merge(Serialized::default("storage.database_url", "not a url"));
        assert!(matches!(
            AppConfig::from_figment(fig),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_sanitize_hides_credentials() {
        let mut config = AppConfig::default();
        config.storage.database_url = Some("postgres://chat:secret@db:5432/market".into());
        config.storage.seed.users.push(SeedUser {
            id: 3,
            display_name: "Ana".into(),
            session_token: "tok-ana-private".into(),
        });
        let text = config.sanitize();
        assert!(!text.contains("secret"));
        assert!(!text.contains("tok-ana-private"));
        assert!(text.contains("@db:5432/market"));
    }

    const SEED_TOML: &str = r#"
        [storage.seed]
        listings = [77]

        [[storage.seed.users]]
        id = 3
        display_name = "Ana"
        session_token = "tok-3"

        [[storage.seed.users]]
        id = 9
        display_name = "Bruno"
        session_token = "tok-9"
        "#;

    #[test]
    fn test_seed_section_is_loaded() {
        let config = AppConfig::from_figment(defaults().merge(Toml::string(SEED_TOML)))
            .expect("seed config");
        let seed = &config.storage.seed;
        assert_eq!(seed.users.len(), 2);
        assert_eq!(seed.users[1].display_name, "Bruno");
        assert_eq!(seed.listings, vec![77]);
    }

    #[test]
    fn test_seed_rejects_duplicates_and_blank_tokens() {
        let duplicate_token = SEED_TOML.replace("tok-9", "tok-3");
        let fig = defaults().merge(Toml::string(&duplicate_token));
        assert!(matches!(
            AppConfig::from_figment(fig),
            Err(ConfigError::DuplicateSeed(_))
        ));

        let blank = SEED_TOML.replace("tok-9", "");
        let fig = defaults().merge(Toml::string(&blank));
        assert!(matches!(
            AppConfig::from_figment(fig),
            Err(ConfigError::Invalid(_))
        ));
    }
}
