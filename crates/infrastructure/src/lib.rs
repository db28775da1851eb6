//! 基础设施层实现。
//!
//! 提供会话存储接口的 PostgreSQL 实现、连接池创建以及数据库迁移。

pub mod migrations;
pub mod repository;

pub use migrations::MIGRATOR;
pub use repository::{
    create_pg_pool, PgConversationRepository, PgListingDirectory, PgMessageRepository, PgStorage,
    PgUserRepository,
};
