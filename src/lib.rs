pub mod codec;
pub mod config;
pub mod dispatch;
pub mod llm;
pub mod pipeline;
pub mod registry;
pub mod server;
pub mod state;
