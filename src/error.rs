use thiserror::Error;

/// Rejection of a single operator request. Nothing is mutated when one of
/// these is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlError {
    #[error("channel {channel} out of range (0..{count})")]
    InvalidChannel { channel: u32, count: u16 },
    #[error("value {0} out of range (0..=255)")]
    InvalidValue(u32),
    #[error("fade speed {0} out of range (0..=65535)")]
    InvalidFadeSpeed(u64),
    #[error("could not parse {what} from {input:?}")]
    Malformed { what: &'static str, input: String },
}
