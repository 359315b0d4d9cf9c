use std::path::Path;

use figment::{
    providers::{Data, Format, Json, Yaml},
    value::{Dict, Map},
    Error, Metadata, Profile, Provider,
};

/// A file-backed provider whose contents are read once, up front.
///
/// Reading eagerly surfaces missing or malformed files when the loader is built rather than when values are extracted.
pub struct ResolvedProvider {
    data: Map<Profile, Dict>,
    metadata: Metadata,
}

impl ResolvedProvider {
    /// Reads the YAML file at `path`.
    ///
    /// # Errors
    ///
    /// If the file cannot be read or is not valid YAML, an error is returned.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        Self::from_file::<Yaml>("YAML file", path.as_ref())
    }

    /// Reads the JSON file at `path`.
    ///
    /// # Errors
    ///
    /// If the file cannot be read or is not valid JSON, an error is returned.
    pub fn from_json<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        Self::from_file::<Json>("JSON file", path.as_ref())
    }

    fn from_file<F: Format>(kind: &'static str, path: &Path) -> Result<Self, Error> {
        let file_data =
            std::fs::read_to_string(path).map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
        let data = Data::<F>::string(&file_data).data()?;

        Ok(Self {
            data,
            metadata: Metadata::from(kind, path),
        })
    }
}

impl Provider for ResolvedProvider {
    fn metadata(&self) -> Metadata {
        self.metadata.clone()
    }

    fn data(&self) -> Result<Map<Profile, Dict>, Error> {
        Ok(self.data.clone())
    }
}
