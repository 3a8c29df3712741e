//! `soundcron-discord`: Discord gateway, guild occupancy and voice playback.

pub mod adapter;
pub mod error;
pub mod membership;
pub mod voice;

pub use adapter::DiscordAdapter;
pub use error::DiscordError;
pub use membership::CacheMembership;
pub use voice::SongbirdConnector;
