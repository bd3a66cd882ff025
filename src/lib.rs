pub mod admin;
pub mod app;
pub mod auth;
pub mod client;
pub mod config;
pub mod errors;
pub mod messages;
pub mod pool;
pub mod server;
pub mod servers;
pub mod stats;
pub mod utils;

/// Format chrono::Duration to be more human-friendly.
pub fn format_duration(duration: &chrono::Duration) -> String {
    let milliseconds = format!("{:0>3}", duration.num_milliseconds() % 1000);

    let seconds = format!("{:0>2}", duration.num_seconds() % 60);

    let minutes = format!("{:0>2}", duration.num_minutes() % 60);

    let hours = format!("{:0>2}", duration.num_hours() % 24);

    let days = duration.num_days().to_string();

    format!("{days}d {hours}:{minutes}:{seconds}.{milliseconds}")
}
