//! Debugger settings.

use smol_str::SmolStr;

use crate::error::DebugError;

/// Mutable debugger configuration, adjusted at the prompt via `set`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DebugSettings {
    /// Log every line event while tracing, not only stops.
    pub trace_opcodes: bool,
}

impl DebugSettings {
    /// Set a settings key from its string form. Dashes in `name` are treated
    /// as underscores.
    ///
    /// # Errors
    /// Fails on an unknown key or an unparsable value.
    pub fn set(&mut self, name: &str, value: &str) -> Result<(), DebugError> {
        let key = name.replace('-', "_");
        match key.as_str() {
            "trace_opcodes" => {
                self.trace_opcodes = parse_bool(&key, value)?;
                Ok(())
            }
            _ => Err(DebugError::UnknownSetting(SmolStr::new(key))),
        }
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool, DebugError> {
    match value {
        "true" | "on" | "1" => Ok(true),
        "false" | "off" | "0" => Ok(false),
        _ => Err(DebugError::InvalidSettingValue {
            name: SmolStr::new(name),
            value: value.to_owned(),
        }),
    }
}
