mod channel;
pub mod events;
mod ws;

pub use channel::RealtimeChannel;
pub use ws::ws_upgrade_handler;
