//! Configuration file parsing (HOCON format).

use std::collections::HashMap;
use std::path::Path;

use hocon::{Hocon, HoconLoader};

use crate::common::error::ConfigError;
use crate::config::source::ConfigSource;

/// Config source backed by a HOCON file.
///
/// Top-level objects are sections; their scalar members are keys.
#[derive(Debug, Clone)]
pub struct FileSource {
    origin: String,
    values: HashMap<(String, String), String>,
}

impl FileSource {
    /// Every non-empty `(section, key, value)` in the file.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &str, &str)> {
        self.values
            .iter()
            .map(|((s, k), v)| (s.as_str(), k.as_str(), v.as_str()))
    }
}

impl ConfigSource for FileSource {
    fn get(&self, section: &str, key: &str) -> Option<String> {
        self.values
            .get(&(section.to_string(), key.to_string()))
            .cloned()
    }

    fn describe(&self) -> String {
        format!("file '{}'", self.origin)
    }
}

/// Load configuration from a HOCON file.
pub fn load_config(path: impl AsRef<Path>) -> Result<FileSource, ConfigError> {
    let path = path.as_ref();

    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::IoError {
        path: path.display().to_string(),
        source,
    })?;

    let mut source = load_config_str(&content)?;
    source.origin = path.display().to_string();
    Ok(source)
}

/// Load configuration from a HOCON string.
pub fn load_config_str(content: &str) -> Result<FileSource, ConfigError> {
    let doc = HoconLoader::new()
        .load_str(content)
        .map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?
        .hocon()
        .map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;

    from_document("<inline>".to_string(), doc)
}
fn from_document(origin: String, doc: Hocon) -> Result<FileSource, ConfigError> {
    let Hocon::Hash(sections) = doc else {
        return Err(ConfigError::ParseError {
            message: "top level of the config must be an object".to_string(),
        });
    };

    let mut values = HashMap::new();
    for (section, body) in sections {
        // Stray top-level scalars are ignored.
        let Hocon::Hash(keys) = body else { continue };
        for (key, value) in keys {
            if let Some(text) = scalar_to_string(&value) {
                values.insert((section.clone(), key), text);
            }
        }
    }

    Ok(FileSource { origin, values })
}

fn scalar_to_string(value: &Hocon) -> Option<String> {
    let text = match value {
        Hocon::String(s) => s.trim().to_string(),
        Hocon::Integer(i) => i.to_string(),
        Hocon::Real(f) => f.to_string(),
        Hocon::Boolean(b) => b.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        ws_api {
            client_id = "abc"
            api_host = "wss://api.example.com"
            ws_ping_interval = 15
        }
        aws_mq {
            mq_broker_id = "b-1234"
            mq_region = ""
            mq_port = 5671
        }
    "#;

    #[test]
    fn test_sections_and_keys() {
        let source = load_config_str(SAMPLE).unwrap();
        assert_eq!(source.get("ws_api", "client_id").as_deref(), Some("abc"));
        assert_eq!(source.get("ws_api", "ws_ping_interval").as_deref(), Some("15"));
        assert_eq!(source.get("aws_mq", "mq_port").as_deref(), Some("5671"));
        assert_eq!(source.get("aws_mq", "mq_broker_id").as_deref(), Some("b-1234"));
    }

    #[test]
    fn test_empty_string_is_absent() {
        let source = load_config_str(SAMPLE).unwrap();
        assert_eq!(source.get("aws_mq", "mq_region"), None);
        assert_eq!(source.get("aws_cloudwatch", "cw_region"), None);
    }

    #[test]
    fn test_entries_skip_empty_values() {
        let source = load_config_str(SAMPLE).unwrap();
        assert_eq!(source.entries().count(), 5);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = load_config("/nonexistent/mq2wsbridge.conf").unwrap_err();
        assert!(matches!(err, ConfigError::IoError { .. }));
    }
}
