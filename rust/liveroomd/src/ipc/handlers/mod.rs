pub mod attendance;
pub mod core;
pub mod room;
pub mod sessions;
pub mod settings;
