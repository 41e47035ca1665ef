//! Message source/sink abstractions (Telegram today; MTProto user clients later).

pub mod port;
pub mod throttled;
pub mod types;
