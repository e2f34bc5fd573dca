use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{ObjectError, ObjectResult};

/// Configuration of a [`Container`](crate::Container).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Fan-out of `Refs` index trees.
    pub refs_degree: u32,
    /// Directory for the object and Root journals. `None` keeps everything
    /// in memory.
    pub data_dir: Option<PathBuf>,
    /// Prune each feed to this many Roots whenever one becomes full.
    /// `None` keeps all Roots.
    pub keep_roots: Option<usize>,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            refs_degree: 16,
            data_dir: None,
            keep_roots: None,
            event_capacity: 1024,
        }
    }
}

impl ContainerConfig {
    pub fn validate(&self) -> ObjectResult<()> {
        if self.refs_degree < 2 {
            return Err(ObjectError::Config(format!(
                "refs_degree must be at least 2, got {}",
                self.refs_degree
            )));
        }
        if self.keep_roots == Some(0) {
            return Err(ObjectError::Config("keep_roots must be at least 1".into()));
        }
        if self.event_capacity == 0 {
            return Err(ObjectError::Config("event_capacity must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let c = ContainerConfig::default();
        assert_eq!(c.refs_degree, 16);
        assert!(c.data_dir.is_none());
        assert!(c.keep_roots.is_none());
        assert!(c.validate().is_ok());
    }

    #[test]
    fn validate_rejects_degenerate_values() {
        let c = ContainerConfig {
            refs_degree: 1,
            ..ContainerConfig::default()
        };
        assert!(c.validate().is_err());
        let c = ContainerConfig {
            keep_roots: Some(0),
            ..ContainerConfig::default()
        };
        assert!(c.validate().is_err());
    }
}
