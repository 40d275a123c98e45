//! Value types for result items and bound variables.

mod mapping;
mod value;

pub use mapping::ValueType;
pub use value::{XdmAtomic, XdmNode, XdmValue};

use std::fmt;

/// Expanded name of an external variable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct XName {
    /// Namespace URI, empty for no namespace
    pub namespace: String,
    /// Local part
    pub local: String,
}

impl XName {
    /// Name in no namespace.
    pub fn local(local: impl Into<String>) -> Self {
        Self {
            namespace: String::new(),
            local: local.into(),
        }
    }

    /// Name in `namespace`.
    pub fn new(namespace: impl Into<String>, local: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            local: local.into(),
        }
    }
}

impl fmt::Display for XName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            f.write_str(&self.local)
        } else {
            write!(f, "{{{}}}{}", self.namespace, self.local)
        }
    }
}

impl From<&str> for XName {
    fn from(local: &str) -> Self {
        XName::local(local)
    }
}
