//! Redis Pub/Sub 模块
//!
//! 跨实例的事件发布与订阅：每个实例发布到 `<prefix>room:<id>` / `<prefix>user:<id>`，
//! 并以模式订阅 `<prefix>*` 接收所有实例的事件。

pub mod error;
pub mod event_bus;

pub use error::*;
pub use event_bus::*;
