use std::env;

/// What a kernel does when a fast path is available but the caller's buffers
/// do not start on a 32-byte boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AlignmentPolicy {
    /// Reject the call with `KernelError::Misaligned`.
    #[default]
    Strict,
    /// Score the call with the scalar kernel instead.
    Fallback,
}

impl AlignmentPolicy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "strict" => Some(Self::Strict),
            "fallback" | "scalar" => Some(Self::Fallback),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::Fallback => "fallback",
        }
    }
}

/// Per-call knobs for the prediction kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelOptions {
    pub alignment: AlignmentPolicy,
    /// Pack several low-dimension binary items into one register.
    pub lowdim_packing: bool,
}

impl Default for KernelOptions {
    fn default() -> Self {
        Self {
            alignment: AlignmentPolicy::Strict,
            lowdim_packing: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub alignment: AlignmentPolicy,
    pub lowdim_packing: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let alignment = match parse_optional_string("SCOREKIT_ALIGNMENT") {
            Some(raw) => AlignmentPolicy::parse(&raw).ok_or(ConfigError::Invalid {
                key: "SCOREKIT_ALIGNMENT",
                value: raw,
            })?,
            None => AlignmentPolicy::default(),
        };

        Ok(Self {
            alignment,
            lowdim_packing: parse_bool("SCOREKIT_LOWDIM_PACKING", true),
        })
    }

    pub fn kernel_options(&self) -> KernelOptions {
        KernelOptions {
            alignment: self.alignment,
            lowdim_packing: self.lowdim_packing,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let options = KernelOptions::default();
        Self {
            alignment: options.alignment,
            lowdim_packing: options.lowdim_packing,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

fn parse_optional_string(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => Some(raw),
        _ => None,
    }
}

fn parse_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(raw) if !raw.is_empty() => parse_bool_value(&raw).unwrap_or(default),
        _ => default,
    }
}

fn parse_bool_value(raw: &str) -> Option<bool> {
    match raw.to_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}
