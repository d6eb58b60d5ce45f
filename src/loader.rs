// src/loader.rs

//! Loader-facing lookup requests
//!
//! The runtime never loads code itself. An external loader asks, per
//! generation, which wire (if any) answers a class or resource lookup; the
//! runtime answers from the committed wiring, falling back to dynamic
//! import resolution for packages with no wire yet.

use std::fmt;

/// One delegation query from the external loader
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// Fully qualified class name, dot separated ("a.b.Widget")
    Class(String),
    /// Resource path, slash separated ("a/b/widget.toml")
    Resource(String),
}

impl Lookup {
    pub fn class(name: impl Into<String>) -> Self {
        Lookup::Class(name.into())
    }

    pub fn resource(path: impl Into<String>) -> Self {
        Lookup::Resource(path.into())
    }

    /// The package a lookup belongs to, which decides the wire used to
    /// answer it. A bare name with no package component yields None; those
    /// lookups never delegate.
    pub fn package(&self) -> Option<String> {
        match self {
            Lookup::Class(name) => {
                let (package, _) = name.rsplit_once('.')?;
                Some(package.to_string())
            }
            Lookup::Resource(path) => {
                let (dir, _) = path.rsplit_once('/')?;
                Some(dir.trim_matches('/').replace('/', "."))
            }
        }
    }
}

impl fmt::Display for Lookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lookup::Class(name) => write!(f, "class {}", name),
            Lookup::Resource(path) => write!(f, "resource {}", path),
        }
    }
}

/// Where a lookup was answered from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delegation {
    /// Follow the wire to the generation owning this loader handle
    Wire { loader_handle: u64 },
    /// No wire covers the package; search the generation's own content
    Local,
}
