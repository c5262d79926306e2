pub mod chat;
pub mod events;
pub mod session;
pub mod wire;
