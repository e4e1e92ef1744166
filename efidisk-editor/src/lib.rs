#![doc = include_str!("../README.md")]

use core::{fmt, time::Duration};
use std::{path::Path, process::Command};

use log::{debug, error, info};
use part::{ESP_FIRST_LBA, ESP_LAST_LBA};
use types::{DialogueError, EditorKind};

mod gdisk;
mod parted;
mod script;
mod session;

pub use crate::{
    gdisk::Gdisk,
    parted::Parted,
    script::{Expect, Prompt, Script, Step},
    session::{DialogueSession, Matched},
};

#[cfg(test)]
use gpt as _;
#[cfg(test)]
use tempfile as _;

/// Partition types we know how to create
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum PartitionKind {
    /// EFI System Partition, holding a FAT32 filesystem
    #[default]
    EfiSystem,
}

impl PartitionKind {
    /// gdisk type code
    #[must_use]
    pub fn gdisk_code(self) -> &'static str {
        match self {
            Self::EfiSystem => "ef00",
        }
    }

    /// parted filesystem type
    #[must_use]
    pub fn parted_fs_type(self) -> &'static str {
        match self {
            Self::EfiSystem => "fat32",
        }
    }
}

/// The partition to create
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PartitionRecipe {
    /// Partition Type
    pub kind: PartitionKind,

    /// Partition Name
    pub name: String,

    /// First LBA. The editor default is used if missing.
    pub first_lba: Option<u64>,

    /// Last LBA, inclusive. The editor default is used if missing.
    pub last_lba: Option<u64>,

    /// Sets the Legacy BIOS Bootable attribute
    pub bootable: bool,
}

impl Default for PartitionRecipe {
    fn default() -> Self {
        Self {
            kind: PartitionKind::EfiSystem,
            name: String::from("EFI"),
            first_lba: Some(ESP_FIRST_LBA),
            last_lba: Some(ESP_LAST_LBA),
            bootable: true,
        }
    }
}

/// The operations an interactive partition editor provides, expressed as scripts in its own
/// prompt grammar.
///
/// Every script but [`PartitionEditor::write_table`] must start from the main prompt and end
/// once the main prompt shows up again. Writing the table may end with the editor exiting.
pub trait PartitionEditor: fmt::Debug {
    /// Editor name
    fn name(&self) -> &'static str;

    /// Command line starting the editor on a disk
    fn command(&self, disk: &Path) -> Command;

    /// Prompt shown when the editor waits for a command
    fn main_prompt(&self) -> &'static Prompt;

    /// Command leaving the editor without writing anything
    fn quit_command(&self) -> &'static str;

    /// Creates a new, empty, GUID Partition Table
    fn new_table(&self) -> Script;

    /// Creates a new partition
    fn new_partition(&self, recipe: &PartitionRecipe) -> Script;

    /// Prints the partition table
    fn print_table(&self) -> Script;

    /// Writes the pending changes to the disk
    fn write_table(&self) -> Script;
}

/// Returns the editor back-end of a given kind
#[must_use]
pub fn editor(kind: EditorKind) -> Box<dyn PartitionEditor> {
    match kind {
        EditorKind::Gdisk => Box::new(Gdisk::new()),
        EditorKind::Parted => Box::new(Parted::new()),
    }
}

/// State of a [`Partitioner`] session
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionState {
    /// The editor was started, its main prompt didn't show up yet
    Spawned,

    /// The editor waits for a command
    AwaitingMainPrompt,

    /// A new table is being created
    TableCreated,

    /// A new partition is being created
    PartitionCreated,

    /// The table is being printed
    TablePrinted,

    /// The table is being written
    TableWritten,

    /// The editor was asked to quit
    Quitting,

    /// The editor is gone
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Spawned => "spawned",
            Self::AwaitingMainPrompt => "awaiting a command",
            Self::TableCreated => "creating a table",
            Self::PartitionCreated => "creating a partition",
            Self::TablePrinted => "printing the table",
            Self::TableWritten => "writing the table",
            Self::Quitting => "quitting",
            Self::Closed => "closed",
        };

        f.write_str(s)
    }
}

/// A live partition editor session.
///
/// Commands can only be sent while the editor waits at its main prompt. The editor is asked to
/// quit, or killed if the dialogue failed, and reaped when the session is dropped.
#[derive(Debug)]
pub struct Partitioner<'a> {
    editor: &'a dyn PartitionEditor,
    session: DialogueSession,
    state: SessionState,
}

impl<'a> Partitioner<'a> {
    /// Starts the editor on a disk, and waits for its main prompt
    ///
    /// # Errors
    ///
    /// If the editor can't be started, or if its main prompt doesn't show up.
    pub fn open(
        editor: &'a dyn PartitionEditor,
        disk: &Path,
        timeout: Option<Duration>,
    ) -> Result<Self, DialogueError> {
        info!("{}: editing {}", editor.name(), disk.display());

        let mut partitioner = Self {
            editor,
            session: DialogueSession::spawn(editor.command(disk), timeout)?,
            state: SessionState::Spawned,
        };

        let banner = partitioner.session.expect(&[editor.main_prompt()])?.before;
        for line in banner.lines().filter(|l| !l.trim().is_empty()) {
            debug!("{}: {line}", editor.name());
        }

        partitioner.state = SessionState::AwaitingMainPrompt;
        Ok(partitioner)
    }

    /// Current session state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    fn run(
        &mut self,
        operation: &'static str,
        next: SessionState,
        script: &Script,
    ) -> Result<String, DialogueError> {
        if self.state != SessionState::AwaitingMainPrompt {
            return Err(DialogueError::ProtocolViolation {
                operation,
                state: self.state.to_string(),
            });
        }

        self.state = next;
        let transcript = script.run(&mut self.session)?;

        if script.ends_at_eof() {
            self.state = SessionState::Closed;

            let status = self.session.close(None)?;
            if !status.success() {
                return Err(DialogueError::Exited {
                    program: self.editor.name().to_owned(),
                    status,
                });
            }
        } else {
            self.state = SessionState::AwaitingMainPrompt;
        }

        Ok(transcript)
    }

    /// Creates a new GUID Partition Table, confirming the destruction of any previous one
    ///
    /// # Errors
    ///
    /// If the session isn't waiting for a command, or if the dialogue fails.
    pub fn new_table(&mut self) -> Result<(), DialogueError> {
        info!("{}: create new GPT", self.editor.name());

        let script = self.editor.new_table();
        self.run("create a table", SessionState::TableCreated, &script)
            .map(|_| ())
    }

    /// Creates a new partition
    ///
    /// # Errors
    ///
    /// If the session isn't waiting for a command, or if the dialogue fails.
    pub fn new_partition(&mut self, recipe: &PartitionRecipe) -> Result<(), DialogueError> {
        info!(
            "{}: create new {:?} partition, LBAs {:?} to {:?}",
            self.editor.name(),
            recipe.kind,
            recipe.first_lba,
            recipe.last_lba
        );

        let script = self.editor.new_partition(recipe);
        self.run("create a partition", SessionState::PartitionCreated, &script)
            .map(|_| ())
    }

    /// Prints the partition table, and returns the editor output
    ///
    /// # Errors
    ///
    /// If the session isn't waiting for a command, or if the dialogue fails.
    pub fn print_table(&mut self) -> Result<String, DialogueError> {
        let script = self.editor.print_table();
        self.run("print the table", SessionState::TablePrinted, &script)
    }

    /// Writes the partition table to the disk
    ///
    /// # Errors
    ///
    /// If the session isn't waiting for a command, if the dialogue fails, or if the editor
    /// exits with an error.
    pub fn write_table(&mut self) -> Result<(), DialogueError> {
        info!("{}: write table to disk", self.editor.name());

        let script = self.editor.write_table();
        self.run("write the table", SessionState::TableWritten, &script)
            .map(|_| ())
    }

    fn shutdown(&mut self) -> Result<(), DialogueError> {
        if self.state == SessionState::Closed {
            return Ok(());
        }

        self.state = SessionState::Quitting;
        let quit = self.editor.quit_command();
        let res = self.session.close(Some(quit));
        self.state = SessionState::Closed;

        res.map(|_| ())
    }

    /// Leaves the editor, discarding anything that wasn't written, and reaps it
    ///
    /// # Errors
    ///
    /// If the editor can't be waited for.
    pub fn close(mut self) -> Result<(), DialogueError> {
        self.shutdown()
    }
}

impl Drop for Partitioner<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("Couldn't close {}: {e}", self.editor.name());
        }
    }
}

/// Creates a GUID Partition Table holding a single partition, and writes it to the disk
///
/// # Errors
///
/// If any step of the dialogue fails. The partition table is then in an unknown state.
pub fn create_partition_table(
    editor: &dyn PartitionEditor,
    disk: &Path,
    recipe: &PartitionRecipe,
    timeout: Option<Duration>,
) -> Result<(), DialogueError> {
    let mut partitioner = Partitioner::open(editor, disk, timeout)?;

    partitioner.new_table()?;
    partitioner.new_partition(recipe)?;

    let table = partitioner.print_table()?;
    for line in table.lines().filter(|l| !l.trim().is_empty()) {
        info!("{}: {line}", editor.name());
    }

    partitioner.write_table()?;
    partitioner.close()
}
