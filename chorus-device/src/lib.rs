pub mod output;

#[derive(Debug, derive_more::From)]
pub enum OpenError {
    NoDeviceAvailable,
    NoSupportedConfig,
    SupportedConfigs(cpal::SupportedStreamConfigsError),
    BuildStream(cpal::BuildStreamError),
    StartStream(cpal::PlayStreamError),
    ThreadError,
}

/// Whether a default output device currently exists. Polled by the
/// sink layer to maintain availability state.
pub fn default_output_available() -> bool {
    use cpal::traits::HostTrait;
    cpal::default_host().default_output_device().is_some()
}
