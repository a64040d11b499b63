pub mod autoplay;
pub mod cache;
pub mod config;
pub mod console;
pub mod content;
pub mod doctor;
pub mod error;
pub mod events;
pub mod guard;
pub mod jukebox;
pub mod player;
pub mod providers;
pub mod queue;
pub mod registry;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
pub use jukebox::Jukebox;
