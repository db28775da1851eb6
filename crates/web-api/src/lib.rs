//! Web API 层。
//!
//! 提供 Axum 路由：实时聊天的 WebSocket 网关，以及会话列表、历史消息等 REST 接口。

mod auth;
mod error;
mod routes;
mod state;
mod ws_connection;

pub use auth::AuthUser;
pub use error::{ApiError, ErrorBody};
pub use routes::router;
pub use state::{AppState, ChatStorage};
