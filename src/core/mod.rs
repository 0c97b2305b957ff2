//! Core configuration types.

mod builder;
pub mod parser;
mod path;
mod proxy;
pub mod settings;
mod tree;
mod value;

pub use builder::ProxyBuilder;
pub use parser::{Format, Parser};
pub use path::{join_path, split_path};
pub use proxy::ConfigProxy;
pub use settings::ProxySettings;
pub use tree::ConfigTree;
pub use value::{Mapping, Value, ValueKind};
