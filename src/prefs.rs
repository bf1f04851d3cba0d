use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const THEME: &str = "theme";
pub const DEBUG: &str = "debug";
pub const LAST_USER: &str = "last_user";

/// Small string key-value file. Keys are stored as `{app_id}.{key}` so
/// several applications can share one file without clobbering each other.
#[derive(Debug, Clone)]
pub struct Preferences {
    path: PathBuf,
    prefix: String,
    values: BTreeMap<String, String>,
}

impl Preferences {
    pub fn open(path: impl Into<PathBuf>, app_id: &str) -> Result<Self> {
        let path = path.into();
        let values = if path.exists() {
            let data =
                fs::read_to_string(&path).with_context(|| format!("reading {:?}", path))?;
            if data.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_yaml::from_str(&data).context("parsing preferences file")?
            }
        } else {
            BTreeMap::new()
        };
        Ok(Preferences {
            path,
            prefix: app_id.to_string(),
            values,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn scoped(&self, key: &str) -> String {
        format!("{}.{}", self.prefix, key)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(&self.scoped(key)).map(String::as_str)
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.get(key) == Some("true")
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) -> Result<()> {
        self.values.insert(self.scoped(key), value.into());
        self.save()
    }

    pub fn remove(&mut self, key: &str) -> Result<()> {
        if self.values.remove(&self.scoped(key)).is_some() {
            self.save()?;
        }
        Ok(())
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("creating {:?}", parent))?;
        }
        let serialized = serde_yaml::to_string(&self.values).context("serializing preferences")?;
        fs::write(&self.path, serialized).with_context(|| format!("writing {:?}", self.path))?;
        Ok(())
    }
}
