#![allow(missing_docs)]

use core::time::Duration;
use std::{
    fs,
    path::{Path, PathBuf},
    time::Instant,
};

use efidisk_editor::{
    create_partition_table, Gdisk, Parted, PartitionRecipe, Partitioner, SessionState,
};
use gpt as _;
use log as _;
use once_cell as _;
use part as _;
use regex as _;
use tempfile::TempDir;
use test_log::test;
use types::DialogueError;

const FAKE_GDISK: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fake/gdisk.sh");
const FAKE_PARTED: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fake/parted.sh");
const TIMEOUT: Option<Duration> = Some(Duration::from_secs(10));

fn disk(dir: &TempDir) -> PathBuf {
    dir.path().join("disk.img")
}

fn answers(disk: &Path) -> Vec<String> {
    let mut path = disk.as_os_str().to_owned();
    path.push(".log");

    fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(ToOwned::to_owned)
        .collect()
}

fn shell_editor(dir: &TempDir, body: &str) -> Gdisk {
    let script = dir.path().join("editor.sh");
    fs::write(&script, body).unwrap();

    Gdisk::with_command("sh", [script])
}

#[test]
fn gdisk_full_dialogue() {
    let dir = TempDir::new().unwrap();
    let disk = disk(&dir);

    create_partition_table(
        &Gdisk::with_command("sh", [FAKE_GDISK]),
        &disk,
        &PartitionRecipe::default(),
        TIMEOUT,
    )
    .unwrap();

    assert_eq!(
        answers(&disk),
        [
            "o", "Y", "n", "", "2048", "93716", "ef00", "x", "a", "2", "", "m", "p", "w", "Y"
        ]
    );
}

#[test]
fn gdisk_not_bootable() {
    let dir = TempDir::new().unwrap();
    let disk = disk(&dir);

    let recipe = PartitionRecipe {
        bootable: false,
        ..PartitionRecipe::default()
    };

    create_partition_table(
        &Gdisk::with_command("sh", [FAKE_GDISK]),
        &disk,
        &recipe,
        TIMEOUT,
    )
    .unwrap();

    assert_eq!(
        answers(&disk),
        ["o", "Y", "n", "", "2048", "93716", "ef00", "p", "w", "Y"]
    );
}

#[test]
fn gdisk_write_failure() {
    let dir = TempDir::new().unwrap();
    let disk = disk(&dir);

    let err = create_partition_table(
        &Gdisk::with_command("sh", [FAKE_GDISK, "4"]),
        &disk,
        &PartitionRecipe::default(),
        TIMEOUT,
    )
    .unwrap_err();

    match err {
        DialogueError::Exited { status, .. } => assert_eq!(status.code(), Some(4)),
        _ => panic!("Unexpected error {err:?}"),
    }
}

#[test]
fn gdisk_quit_on_drop() {
    let dir = TempDir::new().unwrap();
    let disk = disk(&dir);
    let gdisk = Gdisk::with_command("sh", [FAKE_GDISK]);

    {
        let mut partitioner = Partitioner::open(&gdisk, &disk, TIMEOUT).unwrap();
        partitioner.new_table().unwrap();
        assert_eq!(partitioner.state(), SessionState::AwaitingMainPrompt);
    }

    assert_eq!(answers(&disk), ["o", "Y", "q"]);
}

#[test]
fn editor_never_prompts() {
    let dir = TempDir::new().unwrap();
    let editor = shell_editor(&dir, "echo 'GPT fdisk (gdisk) version 1.0.9'\nsleep 30\n");

    let start = Instant::now();
    let err = Partitioner::open(&editor, &disk(&dir), Some(Duration::from_millis(300)))
        .unwrap_err();

    assert!(matches!(err, DialogueError::Timeout { .. }));
    assert!(start.elapsed() < Duration::from_secs(10));
}

#[test]
fn editor_exits_before_prompt() {
    let dir = TempDir::new().unwrap();
    let editor = shell_editor(&dir, "echo 'Problem opening disk.img for reading!'\nexit 1\n");

    let err = Partitioner::open(&editor, &disk(&dir), TIMEOUT).unwrap_err();

    match err {
        DialogueError::UnexpectedEof { output, .. } => assert!(output.contains("Problem opening")),
        _ => panic!("Unexpected error {err:?}"),
    }
}

#[test]
fn editor_dies_mid_dialogue() {
    let dir = TempDir::new().unwrap();
    let editor = shell_editor(
        &dir,
        "printf 'Command (? for help): '\nread x\nprintf 'Command (? for help): '\nread x\nexit 2\n",
    );

    let mut partitioner = Partitioner::open(&editor, &disk(&dir), TIMEOUT).unwrap();
    partitioner.new_table().unwrap();

    let err = partitioner
        .new_partition(&PartitionRecipe::default())
        .unwrap_err();
    assert!(matches!(err, DialogueError::UnexpectedEof { .. }));

    // The session is out of sync, nothing can be sent anymore
    let err = partitioner.print_table().unwrap_err();
    assert!(matches!(err, DialogueError::ProtocolViolation { .. }));
}

#[test]
fn parted_full_dialogue() {
    let dir = TempDir::new().unwrap();
    let disk = disk(&dir);

    create_partition_table(
        &Parted::with_command("sh", [FAKE_PARTED]),
        &disk,
        &PartitionRecipe::default(),
        TIMEOUT,
    )
    .unwrap();

    assert_eq!(
        answers(&disk),
        [
            "mklabel gpt",
            "Yes",
            "mkpart EFI fat32 2048s 93716s",
            "Ignore",
            "set 1 boot on",
            "set 1 legacy_boot on",
            "unit s print",
            "quit"
        ]
    );
}

#[test]
fn parted_print_table() {
    let dir = TempDir::new().unwrap();
    let parted = Parted::with_command("sh", [FAKE_PARTED]);

    let mut partitioner = Partitioner::open(&parted, &disk(&dir), TIMEOUT).unwrap();
    let table = partitioner.print_table().unwrap();

    assert!(table.contains("Partition Table: gpt"));
    partitioner.close().unwrap();
}
