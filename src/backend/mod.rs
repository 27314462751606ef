pub mod config;
pub mod twitch;
