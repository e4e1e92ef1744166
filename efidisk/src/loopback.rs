use std::{
    fs::{self, File},
    io,
    os::fd::AsFd as _,
    path::{Path, PathBuf},
    process::Command,
};

use log::{debug, error, info, trace};
use loopdev::LoopControl;
use serde::Deserialize;
use sys_mount::{FilesystemType, Mount, Unmount as _, UnmountFlags};
use types::EfiDiskError;
use walkdir::WalkDir;

use crate::{config::FatConfig, plan::Plan, utils::run_tool};

/// A disk image file attached to a loop device, with its partitions exposed.
///
/// The loop device is detached when dropped.
#[derive(Debug)]
pub(crate) struct LoopBinding {
    loopdev: loopdev::LoopDevice,
    path: PathBuf,
    _file: File,
}

impl LoopBinding {
    pub(crate) fn attach(file: File) -> Result<Self, EfiDiskError> {
        let control = LoopControl::open().map_err(|e| {
            EfiDiskError::ResourceAcquisition(format!("Couldn't open the loop control device: {e}"))
        })?;

        let loop_device = control.next_free().map_err(|e| {
            EfiDiskError::ResourceAcquisition(format!("No free loop device: {e}"))
        })?;

        let path = loop_device.path().ok_or_else(|| {
            EfiDiskError::ResourceAcquisition(String::from("Loop Device File Not Found"))
        })?;

        debug!("Using loop device {}", path.display());

        loop_device
            .with()
            .part_scan(true)
            .attach_fd(file.as_fd())
            .map_err(|e| {
                EfiDiskError::ResourceAcquisition(format!(
                    "Couldn't attach {}: {e}",
                    path.display()
                ))
            })?;

        debug!("Attached the loop device to our file");

        Ok(Self {
            loopdev: loop_device,
            path,
            _file: file,
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn partitions(&self) -> Result<Vec<PathBuf>, EfiDiskError> {
        find_device_parts(&self.path)
    }
}

impl Drop for LoopBinding {
    fn drop(&mut self) {
        debug!("Detaching {}", self.path.display());

        let res = self.loopdev.detach();
        if let Err(e) = res {
            error!("Couldn't detach the Loop Device: {}", e);
        }
    }
}

#[derive(Debug, Deserialize)]
struct LsblkPartition {
    path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct LsblkDevice {
    #[serde(default, rename = "children")]
    parts: Vec<LsblkPartition>,
}

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    #[serde(rename = "blockdevices")]
    devices: Vec<LsblkDevice>,
}

fn parse_lsblk(output: &[u8]) -> Result<Vec<PathBuf>, EfiDiskError> {
    let res: LsblkOutput = serde_json::from_slice(output)?;

    Ok(res
        .devices
        .into_iter()
        .flat_map(|d| d.parts)
        .map(|p| p.path)
        .collect())
}

fn find_device_parts(dev: &Path) -> Result<Vec<PathBuf>, EfiDiskError> {
    let output = run_tool(
        Command::new("lsblk")
            .args(["--bytes", "--json", "--paths", "--output", "PATH"])
            .arg(dev.as_os_str()),
    )?;

    let parts = parse_lsblk(output.as_bytes())?;
    for part in &parts {
        debug!("Found partition {}", part.display());
    }

    Ok(parts)
}

/// Creates a FAT32 filesystem on a partition device
pub(crate) fn format_fat32(device: &Path, fat: &FatConfig) -> Result<(), EfiDiskError> {
    info!("Formatting {} in FAT32", device.display());

    let mut command = Command::new("mkfs.fat");
    command.args(["-I", "-F", "32"]);

    let geometry = format!("{}/{}", fat.heads, fat.sectors_per_track);
    debug!(
        "FAT32 Geometry uses {} heads, {} sectors per track",
        fat.heads, fat.sectors_per_track
    );
    command.args(["-g", &geometry]);

    command.args(["-s", &fat.sectors_per_cluster.to_string()]);

    if let Some(vol_id) = fat.volume_id {
        let id = format!("{vol_id:08x}");

        debug!("FAT32 Volume ID is {id}");

        command.args(["-i", &id]);
    }

    run_tool(command.arg(device.as_os_str()))?;

    Ok(())
}

/// Directory a partition gets mounted on
#[derive(Debug)]
struct MountPoint {
    path: PathBuf,
    owned: bool,
}

impl MountPoint {
    fn new(target: Option<&Path>) -> Result<Self, EfiDiskError> {
        if let Some(target) = target {
            fs::create_dir_all(target)?;

            return Ok(Self {
                path: target.to_path_buf(),
                owned: false,
            });
        }

        let path = tempfile::Builder::new()
            .prefix("mountpoint")
            .tempdir()?
            .keep();

        Ok(Self { path, owned: true })
    }

    // Never recursive: whatever is still in there isn't ours to delete
    fn remove(&self) {
        if !self.owned {
            return;
        }

        trace!("Removing {}", self.path.display());

        if let Err(e) = fs::remove_dir(&self.path) {
            error!("Couldn't remove {}: {e}", self.path.display());
        }
    }
}

/// A partition device mounted on a directory.
///
/// The partition is unmounted when dropped. The directory is removed afterwards if we created it
/// and the partition got unmounted.
#[derive(Debug)]
pub(crate) struct MountBinding {
    dev: PathBuf,
    mount: Mount,
    mount_point: MountPoint,
}

impl MountBinding {
    pub(crate) fn new(dev: &Path, target: Option<&Path>) -> Result<Self, EfiDiskError> {
        let mount_point = MountPoint::new(target)?;

        debug!(
            "Mounting {} on {}",
            dev.display(),
            mount_point.path.display()
        );

        let mount = match Mount::builder()
            .fstype(FilesystemType::Manual("vfat"))
            .mount(dev, &mount_point.path)
        {
            Ok(mount) => mount,
            Err(e) => {
                mount_point.remove();

                return Err(EfiDiskError::ResourceAcquisition(format!(
                    "Couldn't mount {} on {}: {e}",
                    dev.display(),
                    mount_point.path.display()
                )));
            }
        };

        trace!("Mount Successful");

        Ok(Self {
            dev: dev.to_path_buf(),
            mount,
            mount_point,
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.mount_point.path
    }
}

impl Drop for MountBinding {
    fn drop(&mut self) {
        debug!(
            "Unmounting {} from {}",
            self.dev.display(),
            self.mount_point.path.display()
        );

        match self.mount.unmount(UnmountFlags::DETACH) {
            Ok(()) => self.mount_point.remove(),
            Err(e) => error!(
                "Couldn't unmount {}, leaving {} in place: {e}",
                self.dev.display(),
                self.mount_point.path.display()
            ),
        }
    }
}

fn copy_file(source: &Path, target: &Path, replace: bool) -> Result<(), EfiDiskError> {
    if !replace && target.exists() {
        debug!("{} already exists, skipping", target.display());
        return Ok(());
    }

    trace!("Copying {} to {}", source.display(), target.display());
    fs::copy(source, target)?;

    Ok(())
}

/// Copies a file or a directory tree into a directory.
///
/// Directories keep their name and their whole hierarchy.
pub(crate) fn copy_into(source: &Path, dest: &Path, replace: bool) -> Result<(), EfiDiskError> {
    let name = source.file_name().ok_or_else(|| {
        EfiDiskError::Precondition(format!("{} has no file name", source.display()))
    })?;
    let target = dest.join(name);

    info!("Copying {} to {}", source.display(), target.display());

    if !source.is_dir() {
        return copy_file(source, &target, replace);
    }

    for entry in WalkDir::new(source).follow_links(true).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| EfiDiskError::Precondition(e.to_string()))?;
        let entry_target = target.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&entry_target)?;
        } else {
            copy_file(entry.path(), &entry_target, replace)?;
        }
    }

    Ok(())
}

/// Populates the disk partition through a loop device and a mount point.
pub(crate) fn populate(
    disk: &Path,
    plan: &Plan,
    fat: &FatConfig,
    mount_point: Option<&Path>,
    files: &[PathBuf],
) -> Result<(), EfiDiskError> {
    let file = File::options().read(true).write(true).open(disk)?;
    let binding = LoopBinding::attach(file)?;

    let partition = binding
        .partitions()?
        .into_iter()
        .next()
        .ok_or_else(|| {
            EfiDiskError::ResourceAcquisition(format!(
                "No partition found on {}",
                binding.path().display()
            ))
        })?;

    if plan.format {
        format_fat32(&partition, fat)?;
    }

    let mount = MountBinding::new(&partition, mount_point)?;
    for file in files {
        copy_into(file, mount.path(), plan.replace)?;
    }

    drop(mount);
    drop(binding);

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{fs, path::PathBuf};

    use tempfile::TempDir;
    use test_log::test;

    use super::{copy_into, parse_lsblk, MountPoint};

    #[test]
    fn test_lsblk_partitions() {
        let output = br#"{
   "blockdevices": [
      {
         "path": "/dev/loop3",
         "children": [
            {
               "path": "/dev/loop3p1"
            }
         ]
      }
   ]
}"#;

        assert_eq!(
            parse_lsblk(output).unwrap(),
            vec![PathBuf::from("/dev/loop3p1")]
        );
    }

    #[test]
    fn test_lsblk_no_partitions() {
        let output = br#"{"blockdevices": [{"path": "/dev/loop3"}]}"#;

        assert!(parse_lsblk(output).unwrap().is_empty());
    }

    #[test]
    fn test_owned_mount_point() {
        let mount_point = MountPoint::new(None).unwrap();
        assert!(mount_point.owned);
        assert!(mount_point.path.is_dir());

        mount_point.remove();
        assert!(!mount_point.path.exists());
    }

    // Files still there, like on a partition that didn't unmount, must survive
    #[test]
    fn test_mount_point_removal_keeps_content() {
        let mount_point = MountPoint::new(None).unwrap();
        let file = mount_point.path.join("shell.efi");
        fs::write(&file, b"MZ").unwrap();

        mount_point.remove();
        assert_eq!(fs::read(&file).unwrap(), b"MZ");

        fs::remove_dir_all(&mount_point.path).unwrap();
    }

    #[test]
    fn test_given_mount_point_is_kept() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("mnt");

        let mount_point = MountPoint::new(Some(&target)).unwrap();
        assert!(!mount_point.owned);
        assert!(target.is_dir());

        mount_point.remove();
        assert!(target.is_dir());
    }

    #[test]
    fn test_copy_file() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();

        let file = src.path().join("shell.efi");
        fs::write(&file, b"MZ").unwrap();

        copy_into(&file, dst.path(), false).unwrap();

        assert_eq!(fs::read(dst.path().join("shell.efi")).unwrap(), b"MZ");
    }

    #[test]
    fn test_copy_tree() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();

        let root = src.path().join("EFI");
        fs::create_dir_all(root.join("BOOT")).unwrap();
        fs::write(root.join("BOOT/BOOTX64.EFI"), b"boot").unwrap();
        fs::write(root.join("startup.nsh"), b"fs0:").unwrap();

        copy_into(&root, dst.path(), false).unwrap();

        assert_eq!(
            fs::read(dst.path().join("EFI/BOOT/BOOTX64.EFI")).unwrap(),
            b"boot"
        );
        assert_eq!(fs::read(dst.path().join("EFI/startup.nsh")).unwrap(), b"fs0:");
    }

    #[test]
    fn test_copy_keeps_existing() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();

        let file = src.path().join("shell.efi");
        fs::write(&file, b"new").unwrap();
        fs::write(dst.path().join("shell.efi"), b"old").unwrap();

        copy_into(&file, dst.path(), false).unwrap();
        assert_eq!(fs::read(dst.path().join("shell.efi")).unwrap(), b"old");

        copy_into(&file, dst.path(), true).unwrap();
        assert_eq!(fs::read(dst.path().join("shell.efi")).unwrap(), b"new");
    }
}
