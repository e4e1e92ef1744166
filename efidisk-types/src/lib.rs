#![doc = include_str!("../README.md")]
#![allow(clippy::multiple_crate_versions)]

extern crate alloc;

use alloc::fmt;
use core::time::Duration;
use std::{io, process::ExitStatus};

use serde::Deserialize;

/// Strategy used to populate the EFI partition
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, clap::ValueEnum)]
pub enum Tool {
    /// Binds the disk image to a loop device, formats and mounts its partition. Requires root.
    #[default]
    LoopbackDevice,

    /// Builds the FAT filesystem offline with mtools and splices it into the disk image.
    Mtools,
}

impl Tool {
    /// Returns the name of the strategy, as used on the command line
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LoopbackDevice => "loopback-device",
            Self::Mtools => "mtools",
        }
    }

    /// Whether this strategy needs elevated privileges to run
    #[must_use]
    pub fn needs_root(self) -> bool {
        matches!(self, Self::LoopbackDevice)
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Interactive partition editor driven to create the partition table
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum EditorKind {
    /// GPT fdisk
    #[default]
    Gdisk,

    /// GNU Parted
    Parted,
}

impl EditorKind {
    /// Returns the name of the editor program
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gdisk => "gdisk",
            Self::Parted => "parted",
        }
    }
}

impl fmt::Display for EditorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failures while scripting an interactive program
#[derive(thiserror::Error, Debug)]
pub enum DialogueError {
    /// The program couldn't be started
    #[error("Couldn't spawn {program}")]
    Spawn {
        /// Program name
        program: String,

        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// None of the expected prompts showed up in time
    #[error("Timed out after {waited:?} waiting for {prompt}")]
    Timeout {
        /// Prompts we were waiting for
        prompt: String,

        /// How long we waited
        waited: Duration,
    },

    /// The program closed its output before any expected prompt showed up
    #[error("Program exited while waiting for {prompt}. Unmatched output: {output:?}")]
    UnexpectedEof {
        /// Prompts we were waiting for
        prompt: String,

        /// Output received since the last matched prompt
        output: String,
    },

    /// The program exited with an error once the dialogue was over
    #[error("{program} exited with {status}")]
    Exited {
        /// Program name
        program: String,

        /// Exit status of the program
        status: ExitStatus,
    },

    /// An operation was attempted from a state that doesn't allow it
    #[error("Can't {operation} while the session is {state}")]
    ProtocolViolation {
        /// Attempted operation
        operation: &'static str,

        /// Current session state
        state: String,
    },

    /// An error has occurred when talking to the program
    #[error("I/O Error")]
    Io(#[from] io::Error),
}

/// Our Error Type
#[derive(thiserror::Error, Debug)]
pub enum EfiDiskError {
    /// A requirement wasn't met before doing anything
    #[error("Precondition Failed: {0}")]
    Precondition(String),

    /// The invocation lacks the privileges the requested strategy needs
    #[error("Permission Denied: {0}")]
    Permission(String),

    /// The partition editor dialogue failed. The partition table is in an unknown state.
    #[error("Partition Editor Dialogue Failure")]
    Dialogue(#[from] DialogueError),

    /// An external tool exited with an error
    #[error("{command} failed ({status}): {output}")]
    ExternalTool {
        /// Command line that failed
        command: String,

        /// Exit status of the command
        status: ExitStatus,

        /// Captured output of the command
        output: String,
    },

    /// A system resource (loop device, mount point) couldn't be acquired
    #[error("Resource Unavailable: {0}")]
    ResourceAcquisition(String),

    /// The partition table on disk isn't the one we asked for
    #[error("Partition Table Mismatch: {0}")]
    TableMismatch(String),

    /// An error has occurred when accessing the local filesystem or files
    #[error("I/O Error")]
    Io(#[from] io::Error),

    /// An error has occurred when parsing JSON data
    #[error("JSON Parsing Failure")]
    Json(#[from] serde_json::Error),

    /// An error has occurred when parsing TOML configuration files
    #[error("Configuration File Format Error")]
    Toml(#[from] toml::de::Error),
}
