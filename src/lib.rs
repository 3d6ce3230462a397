pub mod ca;
pub mod config;
pub mod content_path;
pub mod encoding;
pub mod formatting;
pub mod inventory;
pub mod logging;
pub mod playback;
pub mod proxy;
pub mod recording;
pub mod throttle;
pub mod tools;
