//! 实时消息核心的领域模型
//!
//! 房间、成员关系、消息、投递状态与在线状态，以及相关的不变量。不包含任何 I/O。

pub mod errors;
pub mod message;
pub mod presence;
pub mod room;
pub mod room_member;
pub mod value_objects;

pub use errors::*;
pub use message::*;
pub use presence::*;
pub use room::*;
pub use room_member::*;
pub use value_objects::*;
