#![allow(missing_docs)]

use std::{
    env,
    ffi::OsStr,
    fs::{self, File},
    path::{Path, PathBuf},
    process::{Command, Output},
};

use anyhow as _;
use clap as _;
use editor as _;
use env_logger as _;
use log::trace;
use loopdev as _;
use nix::unistd::Uid;
use part as _;
use serde as _;
use serde_json as _;
use sys_mount as _;
use tempfile::TempDir;
use test_log::test;
use toml as _;
use types as _;
use walkdir as _;

const EFIDISK: &str = env!("CARGO_BIN_EXE_efidisk");
const DISK_SIZE: u64 = 46 * 1024 * 1024;
const PARTITION_OFFSET: usize = 2048 * 512;

fn in_path(program: &str) -> bool {
    env::var_os("PATH")
        .is_some_and(|paths| env::split_paths(&paths).any(|dir| dir.join(program).is_file()))
}

fn offline_tools_available() -> bool {
    ["gdisk", "mformat", "mcopy", "mmd", "mdir"]
        .iter()
        .all(|tool| in_path(tool))
}

fn loopback_tools_available() -> bool {
    Uid::effective().is_root()
        && ["gdisk", "lsblk", "mkfs.fat", "mcopy", "mdir"]
            .iter()
            .all(|tool| in_path(tool))
}

fn efidisk(args: &[&str], files: &[impl AsRef<OsStr>]) -> Output {
    Command::new(EFIDISK)
        .args(args)
        .args(files)
        .env("RUST_LOG", "debug")
        .output()
        .unwrap()
}

fn partition_image(disk: &Path) -> String {
    format!("{}@@{PARTITION_OFFSET}", disk.display())
}

fn read_back(disk: &Path, fat_path: &str) -> Vec<u8> {
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("out");

    let status = Command::new("mcopy")
        .env("MTOOLS_SKIP_CHECK", "1")
        .arg("-n")
        .arg("-i")
        .arg(partition_image(disk))
        .arg(fat_path)
        .arg(&dest)
        .status()
        .unwrap();
    assert!(status.success());

    fs::read(dest).unwrap()
}

fn fat_entry_exists(disk: &Path, fat_path: &str) -> bool {
    Command::new("mdir")
        .env("MTOOLS_SKIP_CHECK", "1")
        .arg("-i")
        .arg(partition_image(disk))
        .arg(fat_path)
        .output()
        .unwrap()
        .status
        .success()
}

fn input_file(dir: &TempDir, name: &str, len: usize) -> PathBuf {
    let path = dir.path().join(name);
    let content: Vec<u8> = (0..len).map(|i| (i % 253) as u8).collect();
    fs::write(&path, content).unwrap();
    path
}

#[test]
fn missing_input_file() {
    let dir = TempDir::new().unwrap();
    let disk = dir.path().join("disk.img");

    let output = efidisk(
        &["--tool", "mtools", "-o", disk.to_str().unwrap()],
        &[Path::new("/nonexistent/shell.efi")],
    );

    assert!(!output.status.success());
    assert!(!disk.exists());
}

#[test]
fn disk_too_small_for_partition() {
    let dir = TempDir::new().unwrap();
    let disk = dir.path().join("disk.img");
    let shell = input_file(&dir, "shell.efi", 1024);

    let output = efidisk(
        &["--tool", "mtools", "--size", "1048576", "-o", disk.to_str().unwrap()],
        &[&shell],
    );

    assert!(!output.status.success());
    assert!(!disk.exists());
}

#[test]
fn loopback_needs_root() {
    if Uid::effective().is_root() {
        trace!("Running as root, skipping");
        return;
    }

    let dir = TempDir::new().unwrap();
    let disk = dir.path().join("disk.img");
    let shell = input_file(&dir, "shell.efi", 1024);

    let output = efidisk(&["-o", disk.to_str().unwrap()], &[&shell]);

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("root"));
    assert!(!disk.exists());
}

#[test]
fn loopback_disk() {
    if !loopback_tools_available() {
        trace!("Not root, or gdisk, lsblk, mkfs.fat or mtools aren't available, skipping");
        return;
    }

    let dir = TempDir::new().unwrap();
    let disk = dir.path().join("disk.img");
    let shell = input_file(&dir, "shell.efi", 1024 * 1024);

    let efi = dir.path().join("EFI");
    fs::create_dir_all(efi.join("BOOT")).unwrap();
    fs::write(efi.join("BOOT").join("BOOTX64.EFI"), b"boot").unwrap();

    let mount_point = dir.path().join("mnt");

    let output = efidisk(
        &[
            "-o",
            disk.to_str().unwrap(),
            "--mount-point",
            mount_point.to_str().unwrap(),
        ],
        &[&shell, &efi],
    );
    assert!(output.status.success(), "{output:?}");

    assert_eq!(fs::metadata(&disk).unwrap().len(), DISK_SIZE);

    let table = gpt::GuidPartitionTable::read(&File::open(&disk).unwrap()).unwrap();
    assert_eq!(table.partitions.len(), 1);
    assert!(table.partitions[0].is_efi_system());
    assert!(table.partitions[0].is_bootable());
    assert_eq!(table.partitions[0].first_lba, 2048);
    assert_eq!(table.partitions[0].last_lba, 93716);

    assert_eq!(read_back(&disk, "::/shell.efi"), fs::read(&shell).unwrap());
    assert_eq!(read_back(&disk, "::/EFI/BOOT/BOOTX64.EFI"), b"boot");

    // The partition got unmounted, and the directory we were given is left alone
    assert!(mount_point.is_dir());
    assert_eq!(fs::read_dir(&mount_point).unwrap().count(), 0);

    // A second run only copies, and keeps what is already there
    fs::write(&shell, b"changed").unwrap();
    let output = efidisk(&["-o", disk.to_str().unwrap()], &[&shell]);
    assert!(output.status.success(), "{output:?}");

    assert_ne!(read_back(&disk, "::/shell.efi"), b"changed");
    assert_eq!(read_back(&disk, "::/EFI/BOOT/BOOTX64.EFI"), b"boot");
}

#[test]
fn offline_disk() {
    if !offline_tools_available() {
        trace!("gdisk or mtools aren't available, skipping");
        return;
    }

    let dir = TempDir::new().unwrap();
    let disk = dir.path().join("disk.img");
    let shell = input_file(&dir, "shell.efi", 1024 * 1024);

    let output = efidisk(&["--tool", "mtools", "-o", disk.to_str().unwrap()], &[&shell]);
    assert!(output.status.success(), "{output:?}");

    assert_eq!(fs::metadata(&disk).unwrap().len(), DISK_SIZE);

    let table = gpt::GuidPartitionTable::read(&File::open(&disk).unwrap()).unwrap();
    assert_eq!(table.partitions.len(), 1);
    assert!(table.partitions[0].is_efi_system());
    assert!(table.partitions[0].is_bootable());
    assert_eq!(table.partitions[0].first_lba, 2048);
    assert_eq!(table.partitions[0].last_lba, 93716);

    assert_eq!(read_back(&disk, "::/shell.efi"), fs::read(&shell).unwrap());
}

#[test]
fn offline_disk_populate_only() {
    if !offline_tools_available() {
        trace!("gdisk or mtools aren't available, skipping");
        return;
    }

    let dir = TempDir::new().unwrap();
    let disk = dir.path().join("disk.img");
    let shell = input_file(&dir, "shell.efi", 4096);
    let startup = input_file(&dir, "startup.nsh", 16);

    let output = efidisk(&["--tool", "mtools", "-o", disk.to_str().unwrap()], &[&shell]);
    assert!(output.status.success(), "{output:?}");

    let head = fs::read(&disk).unwrap()[..PARTITION_OFFSET].to_vec();

    // The second run neither partitions nor formats again
    fs::write(&shell, b"changed").unwrap();
    let output = efidisk(
        &["--tool", "mtools", "-o", disk.to_str().unwrap()],
        &[&shell, &startup],
    );
    assert!(output.status.success(), "{output:?}");

    assert_eq!(&fs::read(&disk).unwrap()[..PARTITION_OFFSET], &head[..]);
    assert_ne!(read_back(&disk, "::/shell.efi"), b"changed");
    assert_eq!(read_back(&disk, "::/startup.nsh"), fs::read(&startup).unwrap());

    // Unless told to replace files
    let output = efidisk(
        &["--tool", "mtools", "--force-copy", "-o", disk.to_str().unwrap()],
        &[&shell],
    );
    assert!(output.status.success(), "{output:?}");
    assert_eq!(read_back(&disk, "::/shell.efi"), b"changed");
}

// Files below subdirectories are copied in the top-level directory
#[test]
fn offline_disk_directories_are_flat() {
    if !offline_tools_available() {
        trace!("gdisk or mtools aren't available, skipping");
        return;
    }

    let dir = TempDir::new().unwrap();
    let disk = dir.path().join("disk.img");

    let efi = dir.path().join("EFI");
    fs::create_dir_all(efi.join("BOOT")).unwrap();
    fs::write(efi.join("BOOT").join("BOOTX64.EFI"), b"boot").unwrap();

    let tools = dir.path().join("tools");
    fs::create_dir(&tools).unwrap();
    fs::write(tools.join("memtest.efi"), b"memtest").unwrap();

    let output = efidisk(
        &["--tool", "mtools", "-o", disk.to_str().unwrap()],
        &[&efi, &tools],
    );
    assert!(output.status.success(), "{output:?}");

    assert!(fat_entry_exists(&disk, "::/EFI"));
    assert!(fat_entry_exists(&disk, "::/tools"));
    assert_eq!(read_back(&disk, "::/tools/memtest.efi"), b"memtest");
    assert_eq!(read_back(&disk, "::/EFI/BOOTX64.EFI"), b"boot");
    assert!(!fat_entry_exists(&disk, "::/EFI/BOOT"));
}
