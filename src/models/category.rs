//! Data categories and the containers they map to.

use crate::errors::StorageError;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Logical class of archived data. Each category owns one container per
/// tenant and decides whether objects in it may be replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataCategory {
    Object,
    Unit,
    ObjectGroup,
    Logbook,
    Report,
    Manifest,
    Profile,
    StorageLog,
    BackupOperation,
}

impl DataCategory {
    pub const ALL: [DataCategory; 9] = [
        DataCategory::Object,
        DataCategory::Unit,
        DataCategory::ObjectGroup,
        DataCategory::Logbook,
        DataCategory::Report,
        DataCategory::Manifest,
        DataCategory::Profile,
        DataCategory::StorageLog,
        DataCategory::BackupOperation,
    ];

    /// Folder name used as the container suffix.
    pub fn folder(self) -> &'static str {
        match self {
            DataCategory::Object => "object",
            DataCategory::Unit => "unit",
            DataCategory::ObjectGroup => "objectgroup",
            DataCategory::Logbook => "logbook",
            DataCategory::Report => "report",
            DataCategory::Manifest => "manifest",
            DataCategory::Profile => "profile",
            DataCategory::StorageLog => "storagelog",
            DataCategory::BackupOperation => "backupoperation",
        }
    }

    /// Whether a second write with different content replaces the object.
    /// Write-once categories reject it with a conflict.
    pub fn is_rewritable(self) -> bool {
        matches!(
            self,
            DataCategory::Unit
                | DataCategory::ObjectGroup
                | DataCategory::Report
                | DataCategory::Profile
                | DataCategory::BackupOperation
        )
    }

    /// Container holding this category for `tenant`, e.g. `prod_2_unit`.
    pub fn container_name(self, tenant: u32, environment: Option<&str>) -> String {
        match environment.filter(|env| !env.is_empty()) {
            Some(env) => format!("{}_{}_{}", env, tenant, self.folder()),
            None => format!("{}_{}", tenant, self.folder()),
        }
    }
}

impl fmt::Display for DataCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.folder())
    }
}

impl FromStr for DataCategory {
    type Err = StorageError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        DataCategory::ALL
            .into_iter()
            .find(|category| category.folder().eq_ignore_ascii_case(value))
            .ok_or_else(|| StorageError::invalid(format!("unknown data category `{}`", value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    #[test]
    fn write_once_categories() {
        let write_once: Vec<_> = DataCategory::ALL
            .into_iter()
            .filter(|c| !c.is_rewritable())
            .collect();
        assert_eq!(
            write_once,
            vec![
                DataCategory::Object,
                DataCategory::Logbook,
                DataCategory::Manifest,
                DataCategory::StorageLog,
            ]
        );
    }

    #[test]
    fn parses_folder_names_case_insensitively() {
        assert_eq!(
            "ObjectGroup".parse::<DataCategory>().unwrap(),
            DataCategory::ObjectGroup
        );
        assert_eq!(
            "STORAGELOG".parse::<DataCategory>().unwrap(),
            DataCategory::StorageLog
        );
        let err = "thumbnail".parse::<DataCategory>().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn container_names() {
        assert_eq!(DataCategory::Unit.container_name(2, None), "2_unit");
        assert_eq!(DataCategory::Unit.container_name(2, Some("")), "2_unit");
        assert_eq!(
            DataCategory::Object.container_name(0, Some("int")),
            "int_0_object"
        );
    }
}
