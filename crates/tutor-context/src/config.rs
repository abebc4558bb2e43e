//! Session configuration.
//!
//! All values are fixed when a [`ContextManager`](crate::context::manager::ContextManager)
//! is created. [`ContextConfig`] deserializes from JSON with every field
//! optional, so a config file only needs the values it changes:
//!
//! ```json
//! { "max_retained_messages": 30, "summarizer": { "enabled": false } }
//! ```

use crate::context::summarizer::SummarizerConfig;
use crate::error::ContextError;
use serde::{Deserialize, Serialize};
use std::path::Path;

// ── Toggle ─────────────────────────────────────────────────────────

/// An optional module: an on/off switch plus its settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, bound(deserialize = "T: Deserialize<'de> + Default"))]
pub struct Toggle<T: Default> {
    /// Whether this module is active.
    pub enabled: bool,
    /// Module-specific configuration.
    pub config: T,
}

impl<T: Default> Toggle<T> {
    /// Create a disabled instance with default inner config.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            config: T::default(),
        }
    }
}

impl<T: Default> Default for Toggle<T> {
    fn default() -> Self {
        Self {
            enabled: true,
            config: T::default(),
        }
    }
}

// ── Context config ─────────────────────────────────────────────────

/// Budget and cache parameters for one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Message count above which compaction runs. The anchor counts; the
    /// system-instructions block does not.
    pub max_retained_messages: usize,
    /// Trailing messages always submitted verbatim when compacting.
    pub recent_window_size: usize,
    /// Upper bound on summary length in words.
    pub summary_word_cap: usize,
    /// Distance (in messages) a history breakpoint may lag behind the
    /// freshness window before it is advanced.
    pub mid_conversation_cache_interval: usize,
    /// Trailing messages that never receive a breakpoint.
    pub cache_freshness_window: usize,
    /// Set to `false` to emit every turn without breakpoints.
    pub caching_enabled: bool,
    /// Summarization of dropped messages. Needs a backend on the manager.
    pub summarizer: Toggle<SummarizerConfig>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_retained_messages: 20,
            recent_window_size: 10,
            summary_word_cap: 300,
            mid_conversation_cache_interval: 10,
            cache_freshness_window: 5,
            caching_enabled: true,
            summarizer: Toggle::default(),
        }
    }
}

impl ContextConfig {
    /// Load a config from a JSON file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read config {}: {e}", path.display()))?;
        serde_json::from_str(&text)
            .map_err(|e| format!("failed to parse config {}: {e}", path.display()))
    }

    pub fn with_max_retained_messages(mut self, n: usize) -> Self {
        self.max_retained_messages = n;
        self
    }

    pub fn with_recent_window_size(mut self, n: usize) -> Self {
        self.recent_window_size = n;
        self
    }

    pub fn with_summary_word_cap(mut self, words: usize) -> Self {
        self.summary_word_cap = words;
        self
    }

    pub fn with_cache_interval(mut self, n: usize) -> Self {
        self.mid_conversation_cache_interval = n;
        self
    }

    pub fn with_freshness_window(mut self, n: usize) -> Self {
        self.cache_freshness_window = n;
        self
    }

    pub fn with_caching(mut self, enabled: bool) -> Self {
        self.caching_enabled = enabled;
        self
    }

    pub fn with_summarizer(mut self, summarizer: Toggle<SummarizerConfig>) -> Self {
        self.summarizer = summarizer;
        self
    }

    /// Slots available to the region between the anchor and the recent
    /// window (kept messages plus the summary, if any).
    pub fn middle_budget(&self) -> usize {
        self.max_retained_messages
            .saturating_sub(self.recent_window_size)
    }

    pub fn validate(&self) -> Result<(), ContextError> {
        if self.max_retained_messages < 2 {
            return Err(ContextError::InvalidConfig(format!(
                "max_retained_messages must be at least 2, got {}",
                self.max_retained_messages
            )));
        }
        if self.recent_window_size == 0 || self.recent_window_size >= self.max_retained_messages
        {
            return Err(ContextError::InvalidConfig(format!(
                "recent_window_size must be in 1..{}, got {}",
                self.max_retained_messages, self.recent_window_size
            )));
        }
        if self.summary_word_cap == 0 {
            return Err(ContextError::InvalidConfig(
                "summary_word_cap must be positive".into(),
            ));
        }
        if self.mid_conversation_cache_interval == 0 {
            return Err(ContextError::InvalidConfig(
                "mid_conversation_cache_interval must be positive".into(),
            ));
        }
        if self.cache_freshness_window == 0 {
            return Err(ContextError::InvalidConfig(
                "cache_freshness_window must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = ContextConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.middle_budget(), 10);
        assert!(config.summarizer.enabled);
    }

    #[test]
    fn rejects_window_not_below_max() {
        let config = ContextConfig::default()
            .with_max_retained_messages(10)
            .with_recent_window_size(10);
        assert!(matches!(
            config.validate(),
            Err(ContextError::InvalidConfig(_))
        ));
    }

    #[test]
    fn rejects_zero_freshness_window() {
        let config = ContextConfig::default().with_freshness_window(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn toggle_disabled_keeps_default_config() {
        let toggle: Toggle<SummarizerConfig> = Toggle::disabled();
        assert!(!toggle.enabled);
        assert_eq!(toggle.config.temperature, SummarizerConfig::default().temperature);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: ContextConfig = serde_json::from_str(
            r#"{"max_retained_messages": 30, "summarizer": {"enabled": false}}"#,
        )
        .unwrap();
        assert_eq!(config.max_retained_messages, 30);
        assert_eq!(config.recent_window_size, 10);
        assert!(!config.summarizer.enabled);
        assert_eq!(config.summarizer.config.max_summary_tokens, 1024);
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"cache_freshness_window": 3, "caching_enabled": false}}"#).unwrap();

        let config = ContextConfig::load(file.path()).unwrap();
        assert_eq!(config.cache_freshness_window, 3);
        assert!(!config.caching_enabled);
    }

    #[test]
    fn load_reports_missing_file() {
        let err = ContextConfig::load(Path::new("/nonexistent/tutor.json")).unwrap_err();
        assert!(err.contains("failed to read config"));
    }
}
