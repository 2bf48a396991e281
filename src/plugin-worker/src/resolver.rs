//! Resolves a plugin's `module` import specifier against the real
//! filesystem. Grounded on the teacher's `set_module_loader`, which wraps
//! `oxc_resolver` around a pluggable `FileSystem` implementation; here we
//! use `oxc_resolver`'s default OS filesystem since plugin modules are real
//! files on disk rather than binary-embedded fixtures.

use std::path::{Path, PathBuf};

use oxc_resolver::{ResolveOptions, Resolver};

#[derive(Debug, thiserror::Error)]
pub enum ModuleResolveError {
    #[error("failed to resolve module '{specifier}' from '{base}': {source}")]
    Resolve {
        specifier: String,
        base: String,
        #[source]
        source: oxc_resolver::ResolveError,
    },
    #[error("failed to read module '{0}': {1}")]
    Read(String, std::io::Error),
}

/// Resolves and loads plugin source files from the local filesystem.
pub struct FileModuleLoader {
    resolver: Resolver,
}

impl FileModuleLoader {
    pub fn new() -> Self {
        let resolver = Resolver::new(ResolveOptions {
            extensions: vec![".js".into(), ".mjs".into()],
            condition_names: vec!["import".into(), "module".into()],
            ..Default::default()
        });
        Self { resolver }
    }

    /// Resolve `specifier` relative to `base` (a directory), returning an
    /// absolute path to the module on disk.
    pub fn resolve(&self, base: &str, specifier: &str) -> Result<String, ModuleResolveError> {
        let dir = if base.is_empty() { "." } else { base };
        let resolution = self
            .resolver
            .resolve(dir, specifier)
            .map_err(|source| ModuleResolveError::Resolve {
                specifier: specifier.to_string(),
                base: base.to_string(),
                source,
            })?;
        Ok(resolution.path().to_string_lossy().replace('\\', "/"))
    }

    pub fn load(&self, path: &str) -> Result<String, ModuleResolveError> {
        std::fs::read_to_string(path).map_err(|e| ModuleResolveError::Read(path.to_string(), e))
    }

    /// The directory a plugin's entry module lives in, used as the base for
    /// resolving its own relative imports.
    pub fn entry_dir(entry_path: &str) -> String {
        Path::new(entry_path)
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| ".".into())
    }

    pub fn canonicalize_entry(entry_path: &str) -> std::io::Result<PathBuf> {
        std::fs::canonicalize(entry_path)
    }
}

impl Default for FileModuleLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn resolves_a_relative_import_next_to_the_entry_module() {
        let dir = tempdir();
        std::fs::write(dir.join("math.js"), "export const add = (a,b) => a+b;").unwrap();
        let loader = FileModuleLoader::new();
        let resolved = loader.resolve(dir.to_str().unwrap(), "./math.js").unwrap();
        assert!(resolved.ends_with("math.js"));
    }

    #[test]
    fn missing_module_reports_resolve_error() {
        let dir = tempdir();
        let loader = FileModuleLoader::new();
        let err = loader.resolve(dir.to_str().unwrap(), "./missing.js");
        assert!(err.is_err());
    }

    fn tempdir() -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("plugin-worker-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&path).unwrap();
        let _ = std::io::stdout().flush();
        path
    }
}
