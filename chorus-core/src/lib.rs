pub mod audio;
pub mod buffer;
pub mod timesync;
pub mod window;
