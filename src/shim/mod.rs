//! ABI compatibility shim for the final link.
//!
//! The cross toolchain ships a newer C runtime than the device. Code linked
//! against the toolchain's `libm` picks up symbol versions (e.g.
//! `GLIBC_2.29`) the device cannot satisfy. The shim points the linker at a
//! copy of the device's own shared object instead of the host default.
//!
//! Ordering matters: ld only binds a dynamic symbol to a shared object when
//! an earlier input already referenced it unresolved. Pinned objects are
//! therefore rendered after the static library, and a pinned library is never
//! also emitted as `-l<name>`.

use anyhow::{bail, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use crate::config::AbiShimConfig;
use crate::toolchain::CommandLine;

/// One shared-library input of the final link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkTarget {
    /// Resolved by the linker's search path (`-l<name>`).
    Search(String),
    /// An explicit shared object that must win over the host's copy.
    Pinned { name: String, path: PathBuf },
}

impl LinkTarget {
    pub fn is_pinned(&self) -> bool {
        matches!(self, LinkTarget::Pinned { .. })
    }

    pub(crate) fn render_into(&self, cmd: &mut CommandLine) {
        match self {
            LinkTarget::Search(name) => {
                cmd.arg(format!("-l{name}"));
            }
            LinkTarget::Pinned { path, .. } => {
                cmd.arg(path);
            }
        }
    }
}

/// Mapping from library name to a target-specific shared object.
#[derive(Debug, Clone, Default)]
pub struct AbiShim {
    pinned: BTreeMap<String, PathBuf>,
}

impl AbiShim {
    pub fn new(config: &AbiShimConfig) -> Self {
        Self {
            pinned: config.pinned.clone(),
        }
    }

    pub fn is_pinned(&self, name: &str) -> bool {
        self.pinned.contains_key(name)
    }

    /// Explicit path of the device copy of `name`.
    pub fn resolve_pinned_library(&self, name: &str) -> Result<PathBuf> {
        let Some(path) = self.pinned.get(name) else {
            bail!("library '{}' has no pinned shared object", name);
        };
        if !path.is_file() {
            bail!(
                "pinned shared object for '{}' not found: {}\n\
                 copy it from the device's /lib directory",
                name,
                path.display()
            );
        }
        Ok(path.clone())
    }

    /// Link targets for `libraries`: every pinned object first (sorted by
    /// name), then the remaining libraries as `-l` lookups in given order.
    pub fn link_targets(&self, libraries: &[String]) -> Result<Vec<LinkTarget>> {
        let mut targets = Vec::with_capacity(self.pinned.len() + libraries.len());
        for name in self.pinned.keys() {
            targets.push(LinkTarget::Pinned {
                name: name.clone(),
                path: self.resolve_pinned_library(name)?,
            });
        }

        let mut seen = BTreeSet::new();
        for name in libraries {
            if self.is_pinned(name) || !seen.insert(name.as_str()) {
                continue;
            }
            targets.push(LinkTarget::Search(name.clone()));
        }
        Ok(targets)
    }
}
