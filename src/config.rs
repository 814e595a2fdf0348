use crate::PixelFormat;

pub const ENV_PIXEL_FORMAT: &str = "WGC_RELAY_PIXEL_FORMAT";
pub const ENV_CURSOR: &str = "WGC_RELAY_CURSOR";
pub const ENV_BORDER: &str = "WGC_RELAY_BORDER";

/// Per-session settings chosen by the embedding application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayOptions {
    pub pixel_format: PixelFormat,
    /// Draw the mouse cursor into captured frames.
    pub cursor_capture_enabled: bool,
    /// Ask the platform to outline the captured source.
    pub border_required: bool,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            pixel_format: PixelFormat::Bgra8,
            cursor_capture_enabled: true,
            border_required: true,
        }
    }
}

impl RelayOptions {
    pub fn with_pixel_format(mut self, pixel_format: PixelFormat) -> Self {
        self.pixel_format = pixel_format;
        self
    }

    pub fn with_cursor(mut self, enabled: bool) -> Self {
        self.cursor_capture_enabled = enabled;
        self
    }

    pub fn with_border(mut self, required: bool) -> Self {
        self.border_required = required;
        self
    }

    /// Defaults overridden by `WGC_RELAY_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut options = Self::default();
        if let Some(raw) = lookup(ENV_PIXEL_FORMAT) {
            match PixelFormat::parse(&raw) {
                Some(format) => options.pixel_format = format,
                None => log::warn!("ignoring unknown {} [{}]", ENV_PIXEL_FORMAT, raw),
            }
        }
        if let Some(raw) = lookup(ENV_CURSOR) {
            options.cursor_capture_enabled = truthy(&raw);
        }
        if let Some(raw) = lookup(ENV_BORDER) {
            options.border_required = truthy(&raw);
        }
        options
    }
}

fn truthy(raw: &str) -> bool {
    let normalized = raw.trim().to_ascii_lowercase();
    normalized == "1" || normalized == "true" || normalized == "yes" || normalized == "on"
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_env() {
        let options = RelayOptions::from_lookup(lookup(&[]));
        assert_eq!(options, RelayOptions::default());
        assert_eq!(options.pixel_format, PixelFormat::Bgra8);
    }

    #[test]
    fn env_overrides() {
        let options = RelayOptions::from_lookup(lookup(&[
            (ENV_PIXEL_FORMAT, "rgba16f"),
            (ENV_CURSOR, "off"),
            (ENV_BORDER, "Yes"),
        ]));
        assert_eq!(options.pixel_format, PixelFormat::Rgba16F);
        assert!(!options.cursor_capture_enabled);
        assert!(options.border_required);
    }

    #[test]
    fn unknown_format_keeps_default() {
        let options = RelayOptions::from_lookup(lookup(&[(ENV_PIXEL_FORMAT, "yuv420")]));
        assert_eq!(options.pixel_format, PixelFormat::Bgra8);
    }
}
