use core::time::Duration;
use std::{fs, path::Path};

use editor::{PartitionKind, PartitionRecipe};
use log::debug;
use part::{last_usable_lba, DEFAULT_DISK_SIZE, ESP_FIRST_LBA, ESP_LAST_LBA, FIRST_USABLE_LBA};
use serde::Deserialize;
use types::{EditorKind, EfiDiskError};

const DEFAULT_DIALOGUE_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub(crate) struct DiskConfig {
    pub(crate) size: u64,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_DISK_SIZE,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub(crate) struct PartitionConfig {
    pub(crate) editor: EditorKind,
    pub(crate) first_lba: u64,
    pub(crate) last_lba: u64,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            editor: EditorKind::default(),
            first_lba: ESP_FIRST_LBA,
            last_lba: ESP_LAST_LBA,
        }
    }
}

/// FAT filesystem parameters
#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub(crate) struct FatConfig {
    pub(crate) heads: u16,
    pub(crate) tracks: u16,
    pub(crate) sectors_per_track: u16,
    pub(crate) sectors_per_cluster: u8,
    pub(crate) volume_id: Option<u32>,
}

impl Default for FatConfig {
    fn default() -> Self {
        Self {
            heads: 5,
            tracks: 255,
            sectors_per_track: 63,
            sectors_per_cluster: 1,
            volume_id: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub(crate) struct DialogueConfig {
    /// In seconds, 0 waits forever
    pub(crate) timeout: u64,
}

impl Default for DialogueConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_DIALOGUE_TIMEOUT_SECS,
        }
    }
}

/// Tool configuration, loaded from a TOML file
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub(crate) struct Config {
    pub(crate) disk: DiskConfig,
    pub(crate) partition: PartitionConfig,
    pub(crate) fat: FatConfig,
    pub(crate) dialogue: DialogueConfig,
}

impl Config {
    pub(crate) fn from_file(path: &Path) -> Result<Self, EfiDiskError> {
        debug!("Loading configuration from {}", path.display());

        let content = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;

        config.validate()?;

        Ok(config)
    }

    pub(crate) fn validate(&self) -> Result<(), EfiDiskError> {
        let first = self.partition.first_lba;
        let last = self.partition.last_lba;

        if first >= last {
            return Err(EfiDiskError::Precondition(format!(
                "Partition first LBA ({first}) must be lower than its last LBA ({last})"
            )));
        }

        if first < FIRST_USABLE_LBA {
            return Err(EfiDiskError::Precondition(format!(
                "Partition first LBA ({first}) overlaps the partition table, it must be at least {FIRST_USABLE_LBA}"
            )));
        }

        let size = self.disk.size;
        let Some(max) = last_usable_lba(size) else {
            return Err(EfiDiskError::Precondition(format!(
                "Disk size ({size} bytes) is too small to hold a partition table"
            )));
        };

        if last > max {
            return Err(EfiDiskError::Precondition(format!(
                "Partition last LBA ({last}) doesn't fit a {size} bytes disk, whose last usable LBA is {max}"
            )));
        }

        if self.fat.sectors_per_cluster == 0 || !self.fat.sectors_per_cluster.is_power_of_two() {
            return Err(EfiDiskError::Precondition(format!(
                "Invalid number of sectors per cluster: {}",
                self.fat.sectors_per_cluster
            )));
        }

        Ok(())
    }

    pub(crate) fn timeout(&self) -> Option<Duration> {
        match self.dialogue.timeout {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub(crate) fn recipe(&self) -> PartitionRecipe {
        PartitionRecipe {
            kind: PartitionKind::EfiSystem,
            first_lba: Some(self.partition.first_lba),
            last_lba: Some(self.partition.last_lba),
            ..PartitionRecipe::default()
        }
    }
}
