use crate::runtime::memory::AlignedAllocator;
use std::path::PathBuf;
use std::time::Duration;

/// Called with the exit status after a fatal error has been reported. Must not return.
pub type ExitHandler = fn(i32) -> !;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_UNIFORM_WORDS: usize = 1024;

const TIMEOUT_ENV: &str = "V3D_BLAS_TIMEOUT_MS";
const DEVICE_ENV: &str = "V3D_BLAS_DEVICE";

/// Settings fixed at context creation.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub timeout: Duration,
    pub exit_handler: ExitHandler,
    /// Size of the shared uniform buffer; at least `UniformBuffer::MIN_WORDS`.
    pub uniform_words: usize,
    pub default_alignment: i32,
    /// `None` probes for the first `v3d` node.
    pub device_path: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            exit_handler: std::process::exit,
            uniform_words: DEFAULT_UNIFORM_WORDS,
            default_alignment: AlignedAllocator::DEFAULT_ALIGNMENT,
            device_path: None,
        }
    }
}

impl RuntimeConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `V3D_BLAS_TIMEOUT_MS` and `V3D_BLAS_DEVICE`.
    ///
    /// Unparsable values are ignored with a warning.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(raw) = std::env::var(TIMEOUT_ENV) {
            match raw.trim().parse::<u64>() {
                Ok(ms) => config.timeout = Duration::from_millis(ms),
                Err(e) => log::warn!("ignoring {TIMEOUT_ENV}={raw:?}: {e}"),
            }
        }
        if let Some(path) = std::env::var_os(DEVICE_ENV) {
            config.device_path = Some(PathBuf::from(path));
        }

        config
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_exit_handler(mut self, handler: ExitHandler) -> Self {
        self.exit_handler = handler;
        self
    }

    #[must_use]
    pub const fn with_uniform_words(mut self, words: usize) -> Self {
        self.uniform_words = words;
        self
    }

    #[must_use]
    pub const fn with_default_alignment(mut self, alignment: i32) -> Self {
        self.default_alignment = alignment;
        self
    }

    #[must_use]
    pub fn with_device_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.device_path = Some(path.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let config = RuntimeConfig::new()
            .with_timeout(Duration::from_millis(250))
            .with_uniform_words(256)
            .with_default_alignment(64)
            .with_device_path("/dev/dri/card1");

        assert_eq!(config.timeout, Duration::from_millis(250));
        assert_eq!(config.uniform_words, 256);
        assert_eq!(config.default_alignment, 64);
        assert_eq!(config.device_path, Some(PathBuf::from("/dev/dri/card1")));
    }

    #[test]
    fn defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(10));
        assert_eq!(config.uniform_words, 1024);
        assert_eq!(config.default_alignment, 32);
        assert!(config.device_path.is_none());
    }
}
