//! TOML configuration loader with validation.
//!
//! Parses a `MachineConfig`, runs its validation rules, and resolves the
//! sparse entry lists into the dense tables the motion core runs against.

use std::path::Path;

use tracing::debug;

use mill_common::config::{MachineConfig, ResolvedConfig};

// ─── Error Type ─────────────────────────────────────────────────────

/// Configuration loading/validation error.
#[derive(Debug)]
pub enum ConfigError {
    /// File I/O error.
    IoError(String),
    /// TOML parse error.
    ParseError(String),
    /// Parameter validation error.
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IoError(e) => write!(f, "config I/O error: {e}"),
            Self::ParseError(e) => write!(f, "config parse error: {e}"),
            Self::ValidationError(e) => write!(f, "config validation: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

// ─── Loading Functions ──────────────────────────────────────────────

/// Load, validate, and resolve the machine configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<ResolvedConfig, ConfigError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::IoError(format!("failed to read {}: {e}", path.display())))?;
    let resolved = load_config_from_str(&text)?;
    debug!(path = %path.display(), "machine configuration loaded");
    Ok(resolved)
}

/// Load a configuration from a TOML string (also used by tests).
pub fn load_config_from_str(text: &str) -> Result<ResolvedConfig, ConfigError> {
    let config: MachineConfig =
        toml::from_str(text).map_err(|e| ConfigError::ParseError(e.to_string()))?;
    config.validate().map_err(ConfigError::ValidationError)?;
    Ok(config.resolve())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[machine]
motor_idle_timeout = 3.0

[[axes]]
axis_id = 0
velocity_max = 4000.0
"#
        )
        .unwrap();

        let cfg = load_config(file.path()).expect("load");
        assert_eq!(cfg.machine.motor_idle_timeout, 3.0);
        assert_eq!(cfg.axes[0].velocity_max, 4000.0);
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = load_config(Path::new("/nonexistent/mill.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::IoError(_)), "{err}");
    }

    #[test]
    fn bad_toml_is_parse_error() {
        let err = load_config_from_str("not [valid").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)), "{err}");
    }

    #[test]
    fn invalid_values_are_validation_errors() {
        let err = load_config_from_str(
            r#"
[[axes]]
axis_id = 0
jerk_max = -1.0
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)), "{err}");
    }
}
