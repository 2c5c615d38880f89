use std::path::Path;

use serde::Deserialize;

use chorus_protocol::{CHUNK_FRAMES, FRAMES_PER_PACKET, SAMPLE_RATE};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Human readable name advertised to peers.
    pub name: String,

    /// Upper bound on scheduling latency; sizes the shared sample
    /// buffer.
    pub max_latency_ms: u64,

    /// A peer that stays silent this long is destroyed.
    pub no_response_timeout_ms: u64,

    /// Sample rate sources are expected to deliver.
    pub encoder_rate: u32,

    /// Frames per source chunk.
    pub chunk_frames: usize,

    /// Frames per AirPlay audio packet.
    pub frames_per_packet: u32,

    /// TTL of an untouched rendezvous conversation, honoured by the
    /// relay collaborator; carried here so both sides read one value.
    pub conversation_expire_secs: u64,

    /// First port tried when binding the AirPlay socket.
    pub airplay_base_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            name: "chorus".to_string(),
            max_latency_ms: 10_000,
            no_response_timeout_ms: 30_000,
            encoder_rate: SAMPLE_RATE,
            chunk_frames: CHUNK_FRAMES,
            frames_per_packet: FRAMES_PER_PACKET,
            conversation_expire_secs: 3_600,
            airplay_base_port: 6_000,
        }
    }
}

impl Config {
    pub fn load() -> Config {
        read().unwrap_or_default()
    }
}

fn load_file(path: &Path) -> Option<Config> {
    log::debug!("looking for config in {}", path.display());

    let contents = std::fs::read_to_string(path).ok()?;

    match toml::from_str(&contents) {
        Ok(config) => {
            log::info!("reading config from {}", path.display());
            Some(config)
        }
        Err(e) => {
            log::error!("error reading config {}: {e}", path.display());
            None
        }
    }
}

pub fn read() -> Option<Config> {
    // try current directory first
    if let Some(config) = load_file(Path::new("chorus.toml")) {
        return Some(config);
    }

    // otherwise try xdg config dirs
    let dirs = xdg::BaseDirectories::new().ok()?;
    if let Some(path) = dirs.find_config_file("chorus.toml") {
        return load_file(&path);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let config: Config = toml::from_str("max_latency_ms = 2000").unwrap();
        assert_eq!(config.max_latency_ms, 2000);
        assert_eq!(config.encoder_rate, SAMPLE_RATE);
        assert_eq!(config.frames_per_packet, FRAMES_PER_PACKET);
    }
}
