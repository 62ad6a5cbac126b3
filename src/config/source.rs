//! The flat `get(section, key)` lookup every config backend implements.

use std::collections::HashMap;

/// A configuration backend.
///
/// Settings are resolved from this lookup only; callers never branch on
/// which backend is behind it.
pub trait ConfigSource: Send + Sync {
    /// Look up a value. Absent and empty values both yield `None`.
    fn get(&self, section: &str, key: &str) -> Option<String>;

    /// Human-readable description for log lines.
    fn describe(&self) -> String;
}

/// In-memory key/value source.
///
/// Backs remote snapshots and tests.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    values: HashMap<(String, String), String>,
    label: String,
}

impl MemorySource {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            values: HashMap::new(),
            label: label.into(),
        }
    }

    /// Set a value, replacing any previous one.
    pub fn set(&mut self, section: &str, key: &str, value: impl Into<String>) {
        self.values
            .insert((section.to_string(), key.to_string()), value.into());
    }

    /// Builder-style `set`.
    pub fn with(mut self, section: &str, key: &str, value: impl Into<String>) -> Self {
        self.set(section, key, value);
        self
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl ConfigSource for MemorySource {
    fn get(&self, section: &str, key: &str) -> Option<String> {
        self.values
            .get(&(section.to_string(), key.to_string()))
            .filter(|v| !v.is_empty())
            .cloned()
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}
