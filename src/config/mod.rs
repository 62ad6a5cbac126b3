//! Configuration sources, typed settings and validation.

pub mod env;
pub mod keys;
pub mod parser;
pub mod remote;
pub mod source;
pub mod types;
pub mod validate;

pub use parser::{load_config, load_config_str, FileSource};
pub use remote::RemoteStore;
pub use source::{ConfigSource, MemorySource};
pub use types::*;
pub use validate::{validate_settings, validate_tester_settings, Features};
