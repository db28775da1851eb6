//! 应用层实现。
//!
//! 围绕领域模型提供实时聊天用例：连接身份解析、频道注册表、
//! 在线状态跟踪以及消息路由，另附一个进程内的会话存储实现。

pub mod clock;
pub mod error;
pub mod identity;
pub mod memory;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod router;

pub use clock::{Clock, FixedClock, SystemClock};
pub use error::ApplicationError;
pub use identity::{IdentityResolver, SessionTokenResolver};
pub use memory::MemoryStore;
pub use presence::{PresenceTracker, PresenceTransition};
pub use protocol::{Ack, ClientEvent, ClientFrame, FrameError, ServerEvent};
pub use registry::{Channel, ChannelRegistry, ConnectionId, Outbox};
pub use router::{ChatRouter, ChatRouterDependencies, RouterSettings, SendMessageCommand, Session};
