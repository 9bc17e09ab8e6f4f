use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::Arc,
};

use tracing::{info, warn};

use crate::{error::ArtifactError, file_utils};

/// Ordered feature names fixed when a model is trained.
///
/// Cheap to clone and shared read-only between requests. There is no way to change a
/// schema once it exists.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FeatureSchema {
    columns: Arc<[String]>,
}

impl FeatureSchema {
    fn new(columns: Vec<String>) -> Result<Self, ArtifactError> {
        if columns.is_empty() {
            return Err(ArtifactError::InvalidSchema("no columns".to_string()));
        }
        let mut seen = HashSet::with_capacity(columns.len());
        for column in &columns {
            if !seen.insert(column.as_str()) {
                return Err(ArtifactError::InvalidSchema(format!(
                    "duplicate column `{column}`"
                )));
            }
        }
        Ok(Self {
            columns: columns.into(),
        })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Persists the schema of a training run and hands it back at startup.
pub struct FeatureSchemaRegistry {
    path: PathBuf,
}

impl FeatureSchemaRegistry {
    pub fn in_dir(model_dir: &Path) -> Self {
        Self {
            path: model_dir.join(file_utils::SCHEMA_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Validates and stores the columns produced by a training run.
    pub fn create(&self, feature_names: Vec<String>) -> Result<FeatureSchema, ArtifactError> {
        let schema = FeatureSchema::new(feature_names)?;
        let bytes = bincode::serialize(schema.columns())?;
        file_utils::write_atomically(&self.path, &bytes)?;
        info!(
            path = %self.path.display(),
            columns = schema.len(),
            "Feature schema written"
        );
        Ok(schema)
    }

    /// Returns `None` when no schema has been written yet.
    pub fn load(&self) -> Result<Option<FeatureSchema>, ArtifactError> {
        let Some(bytes) = file_utils::read_optional(&self.path)? else {
            warn!(
                path = %self.path.display(),
                "No feature schema found; features will use natural column order unchecked"
            );
            return Ok(None);
        };
        let columns: Vec<String> = bincode::deserialize(&bytes)?;
        FeatureSchema::new(columns).map(Some)
    }
}

#[cfg(test)]
impl FeatureSchema {
    pub(crate) fn for_tests(columns: &[&str]) -> Self {
        Self::new(columns.iter().map(|c| c.to_string()).collect()).unwrap()
    }
}
