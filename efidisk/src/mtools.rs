use std::{
    fs, io,
    path::{Path, PathBuf},
    process::Command,
};

use log::{debug, info};
use part::partition_image_size;
use tempfile::NamedTempFile;
use types::EfiDiskError;
use walkdir::WalkDir;

use crate::{
    config::FatConfig,
    disk::{allocate, extract, splice},
    plan::Plan,
    utils::run_tool,
};

// The filesystem geometry doesn't have to match the image size
const SKIP_CHECK: &str = "MTOOLS_SKIP_CHECK";

/// An mtools operation on a FAT image
#[derive(Debug, Eq, PartialEq)]
pub(crate) enum FatOperation {
    /// Creates a directory
    Mkdir(String),

    /// Copies a file into a directory
    Copy { source: PathBuf, target: String },
}

/// Lists the operations needed to copy files and directories at the root of a FAT image.
///
/// Directories are created at the root, but all the files found below them land in that single
/// directory: subdirectories aren't recreated.
pub(crate) fn copy_plan(files: &[PathBuf]) -> Result<Vec<FatOperation>, EfiDiskError> {
    let mut ops = Vec::new();

    for file in files {
        if !file.is_dir() {
            ops.push(FatOperation::Copy {
                source: file.clone(),
                target: String::from("::/"),
            });
            continue;
        }

        let name = file
            .file_name()
            .ok_or_else(|| {
                EfiDiskError::Precondition(format!("{} has no file name", file.display()))
            })?
            .to_string_lossy();

        let dir = format!("::/{name}");
        ops.push(FatOperation::Mkdir(dir.clone()));

        for entry in WalkDir::new(file).follow_links(true).sort_by_file_name() {
            let entry = entry.map_err(io::Error::from)?;

            if entry.file_type().is_file() {
                ops.push(FatOperation::Copy {
                    source: entry.into_path(),
                    target: format!("{dir}/"),
                });
            }
        }
    }

    Ok(ops)
}

/// A FAT filesystem image handled through mtools, without mounting it
#[derive(Debug)]
pub(crate) struct FatImage<'a> {
    path: &'a Path,
    replace: bool,
}

impl<'a> FatImage<'a> {
    pub(crate) fn new(path: &'a Path, replace: bool) -> Self {
        Self { path, replace }
    }

    fn clash_option(&self) -> &'static str {
        if self.replace {
            "o"
        } else {
            "s"
        }
    }

    pub(crate) fn format(&self, fat: &FatConfig) -> Result<(), EfiDiskError> {
        info!("mformat: format {} to FAT32", self.path.display());

        let mut command = Command::new("mformat");
        command
            .env(SKIP_CHECK, "1")
            .arg("-F")
            .arg("-i")
            .arg(self.path)
            .args(["-h", &fat.heads.to_string()])
            .args(["-t", &fat.tracks.to_string()])
            .args(["-s", &fat.sectors_per_track.to_string()])
            .args(["-c", &fat.sectors_per_cluster.to_string()]);

        if let Some(vol_id) = fat.volume_id {
            command.args(["-N", &format!("{vol_id:08x}")]);
        }

        run_tool(command.arg("::"))?;

        Ok(())
    }

    fn mkdir(&self, dir: &str) -> Result<(), EfiDiskError> {
        info!("mmd: create {dir}");

        run_tool(
            Command::new("mmd")
                .env(SKIP_CHECK, "1")
                .arg("-i")
                .arg(self.path)
                .args(["-D", "s"])
                .arg(dir),
        )?;

        Ok(())
    }

    fn copy(&self, source: &Path, target: &str) -> Result<(), EfiDiskError> {
        info!("mcopy: copy {} to {target}", source.display());

        run_tool(
            Command::new("mcopy")
                .env(SKIP_CHECK, "1")
                .arg("-i")
                .arg(self.path)
                .args(["-D", self.clash_option()])
                .arg(source)
                .arg(target),
        )?;

        Ok(())
    }

    pub(crate) fn apply(&self, ops: &[FatOperation]) -> Result<(), EfiDiskError> {
        for op in ops {
            match op {
                FatOperation::Mkdir(dir) => self.mkdir(dir)?,
                FatOperation::Copy { source, target } => self.copy(source, target)?,
            }
        }

        Ok(())
    }
}

/// Populates the disk partition offline.
///
/// The filesystem is built, or extracted from the disk, in a separate image that gets written
/// back at the partition offset.
pub(crate) fn populate(
    disk: &Path,
    plan: &Plan,
    fat: &FatConfig,
    first_lba: u64,
    files: &[PathBuf],
) -> Result<(), EfiDiskError> {
    let disk_size = fs::metadata(disk)?.len();
    let size = partition_image_size(disk_size, first_lba);

    if size == 0 {
        return Err(EfiDiskError::Precondition(format!(
            "{} is too small to hold a partition at sector {first_lba}",
            disk.display()
        )));
    }

    let image = tempfile::Builder::new()
        .prefix("partfat32-")
        .tempfile()
        .map(NamedTempFile::into_temp_path)?;

    debug!("Temporary FAT image is {}", image.display());

    if plan.format {
        allocate(&image, size)?;
    } else {
        extract(disk, &image, size, first_lba)?;
    }

    let fat_image = FatImage::new(&image, plan.replace);
    if plan.format {
        fat_image.format(fat)?;
    }

    fat_image.apply(&copy_plan(files)?)?;

    splice(&image, disk, size, first_lba)?;

    image.close()?;

    Ok(())
}
