pub mod chat_stream;
pub mod config;
pub mod credentials;
pub mod message;
pub mod transcript;
pub mod turn;
