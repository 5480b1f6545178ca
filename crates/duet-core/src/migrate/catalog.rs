//! Ordered set of known migration steps

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::models::MigrationStep;

/// On-disk step definition; the checksum is always recomputed
#[derive(Debug, Deserialize)]
struct StepFile {
    version: u32,
    name: String,
    up: String,
    #[serde(default)]
    down: Option<String>,
    #[serde(default)]
    destructive: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MigrationCatalog {
    steps: BTreeMap<u32, MigrationStep>,
}

impl MigrationCatalog {
    /// Build a catalog; versions must be unique and non-zero
    pub fn new(steps: impl IntoIterator<Item = MigrationStep>) -> Result<Self> {
        let mut catalog = BTreeMap::new();
        for step in steps {
            if step.version == 0 {
                return Err(Error::InvalidInput(format!(
                    "migration {:?} must have a version above zero",
                    step.name
                )));
            }
            if catalog.contains_key(&step.version) {
                return Err(Error::InvalidInput(format!(
                    "duplicate migration version {}",
                    step.version
                )));
            }
            catalog.insert(step.version, step);
        }
        Ok(Self { steps: catalog })
    }

    /// Load every `*.json` step file in `dir`
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let mut paths = fs::read_dir(dir)?
            .map(|entry| entry.map(|entry| entry.path()))
            .collect::<std::io::Result<Vec<_>>>()?;
        paths.retain(|path| path.extension().is_some_and(|ext| ext == "json"));
        paths.sort();

        let mut steps = Vec::with_capacity(paths.len());
        for path in paths {
            let file: StepFile = serde_json::from_str(&fs::read_to_string(&path)?)?;
            let step = MigrationStep::new(file.version, file.name, file.up, file.down);
            steps.push(if file.destructive { step.destructive() } else { step });
        }
        tracing::debug!(dir = %dir.display(), steps = steps.len(), "Loaded migration catalog");
        Self::new(steps)
    }

    pub fn get(&self, version: u32) -> Option<&MigrationStep> {
        self.steps.get(&version)
    }

    /// Steps in ascending version order
    pub fn steps(&self) -> impl DoubleEndedIterator<Item = &MigrationStep> {
        self.steps.values()
    }

    pub fn latest_version(&self) -> u32 {
        self.steps.keys().next_back().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_are_ordered_and_unique() {
        let catalog = MigrationCatalog::new([
            MigrationStep::new(2, "b", "B", None),
            MigrationStep::new(1, "a", "A", None),
        ])
        .unwrap();
        let versions: Vec<u32> = catalog.steps().map(|step| step.version).collect();
        assert_eq!(versions, vec![1, 2]);
        assert_eq!(catalog.latest_version(), 2);

        assert!(MigrationCatalog::new([
            MigrationStep::new(1, "a", "A", None),
            MigrationStep::new(1, "again", "A2", None),
        ])
        .is_err());
        assert!(MigrationCatalog::new([MigrationStep::new(0, "zero", "Z", None)]).is_err());
    }

    #[test]
    fn loads_json_step_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("0001_init.json"),
            r#"{"version": 1, "name": "init", "up": "CREATE TABLE a (id)", "down": "DROP TABLE a"}"#,
        )
        .unwrap();
        fs::write(
            dir.path().join("0002_drop_notes.json"),
            r#"{"version": 2, "name": "drop notes", "up": "ALTER TABLE a DROP COLUMN notes", "destructive": true}"#,
        )
        .unwrap();
        fs::write(dir.path().join("README.md"), "ignored").unwrap();

        let catalog = MigrationCatalog::load_dir(dir.path()).unwrap();
        let init = catalog.get(1).unwrap();
        assert_eq!(init.down_script.as_deref(), Some("DROP TABLE a"));
        assert_eq!(
            init.checksum,
            MigrationStep::new(1, "init", "CREATE TABLE a (id)", Some("DROP TABLE a".into())).checksum
        );
        assert!(catalog.get(2).unwrap().destructive);
        assert!(!catalog.get(2).unwrap().is_reversible());
    }
}
