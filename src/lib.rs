//! Relays new Bilibili dynamics of followed users into Telegram chats.

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod sources;
pub mod telegram;
