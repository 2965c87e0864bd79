//! Kernel command-line configuration.
//!
//! The boot loader hands over a free-form command line; this module parses
//! the `key=value` flags the kernel understands. Unknown keys are ignored
//! with a warning so new loader configurations do not brick old kernels.

use crate::log::LogLevel;

/// Parsed kernel configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// Maximum log level (`loglevel=error|warn|info|debug|trace`).
    pub log_level: LogLevel,
    /// Whether the xHCI driver probes for controllers (`xhci=off` disables).
    pub xhci: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            xhci: true,
        }
    }
}

impl KernelConfig {
    /// Parses a kernel command line.
    ///
    /// Tokens are whitespace-separated `key=value` pairs; bare tokens and
    /// unknown keys are skipped with a warning.
    pub fn parse(cmdline: &str) -> Self {
        let mut config = Self::default();

        for token in cmdline.split_whitespace() {
            let Some((key, value)) = token.split_once('=') else {
                crate::kwarn!("config: ignoring bare token '{}'", token);
                continue;
            };
            match key {
                "loglevel" => match LogLevel::from_str(value) {
                    Some(level) => config.log_level = level,
                    None => crate::kwarn!("config: unknown loglevel '{}'", value),
                },
                "xhci" => config.xhci = value != "off",
                _ => crate::kwarn!("config: unknown key '{}'", key),
            }
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_cmdline_gives_defaults() {
        assert_eq!(KernelConfig::parse(""), KernelConfig::default());
    }

    #[test]
    fn parses_loglevel() {
        let config = KernelConfig::parse("loglevel=trace");
        assert_eq!(config.log_level, LogLevel::Trace);
    }

    #[test]
    fn parses_xhci_off() {
        let config = KernelConfig::parse("loglevel=debug xhci=off");
        assert!(!config.xhci);
        assert_eq!(config.log_level, LogLevel::Debug);
    }

    #[test]
    fn unknown_keys_are_skipped() {
        let config = KernelConfig::parse("quiet splash=1 loglevel=warn");
        assert_eq!(config.log_level, LogLevel::Warn);
        assert!(config.xhci);
    }
}
