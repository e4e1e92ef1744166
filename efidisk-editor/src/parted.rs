use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    process::Command,
};

use log::debug;
use once_cell::sync::Lazy;

use crate::{
    script::{Prompt, Script, Step},
    PartitionEditor, PartitionRecipe,
};

static MAIN: Lazy<Prompt> = Lazy::new(|| Prompt::new("main prompt", r"\(parted\) "));
static YES_NO: Lazy<Prompt> = Lazy::new(|| Prompt::new("confirmation", r"Yes/No\? "));
static IGNORE_CANCEL: Lazy<Prompt> =
    Lazy::new(|| Prompt::new("alignment warning", r"Ignore/Cancel\? "));
static FIX_IGNORE: Lazy<Prompt> = Lazy::new(|| Prompt::new("fix request", r"Fix/Ignore\? "));

/// GNU Parted back-end
///
/// Parted refuses to run interactively without a terminal, unless asked to pretend it has one.
/// Changes are written to the disk as soon as each command completes.
#[derive(Debug)]
pub struct Parted {
    program: PathBuf,
    args: Vec<OsString>,
}

impl Parted {
    /// Uses the `parted` program found in the `PATH`
    #[must_use]
    pub fn new() -> Self {
        Self::with_command("parted", ["---pretend-input-tty"])
    }

    /// Uses a custom program, called with some leading arguments and the disk path
    #[must_use]
    pub fn with_command<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

impl Default for Parted {
    fn default() -> Self {
        Self::new()
    }
}

impl PartitionEditor for Parted {
    fn name(&self) -> &'static str {
        "parted"
    }

    fn command(&self, disk: &Path) -> Command {
        let mut command = Command::new(&self.program);
        command.env("LC_ALL", "C").args(&self.args).arg(disk);
        command
    }

    fn main_prompt(&self) -> &'static Prompt {
        &MAIN
    }

    fn quit_command(&self) -> &'static str {
        "quit"
    }

    fn new_table(&self) -> Script {
        Script::command("mklabel gpt")
            .on(&YES_NO, "Yes")
            .then(Step::wait(&MAIN))
    }

    fn new_partition(&self, recipe: &PartitionRecipe) -> Script {
        let start = recipe
            .first_lba
            .map_or_else(|| String::from("1MiB"), |l| format!("{l}s"));
        let end = recipe
            .last_lba
            .map_or_else(|| String::from("100%"), |l| format!("{l}s"));

        let mut script = Script::command(format!(
            "mkpart {} {} {start} {end}",
            recipe.name,
            recipe.kind.parted_fs_type()
        ))
        .on(&IGNORE_CANCEL, "Ignore")
        .on(&FIX_IGNORE, "Fix")
        .on(&YES_NO, "Yes");

        // On a GPT, the boot flag sets the EFI System Partition type
        script = script.then(Step::answer(&MAIN, "set 1 boot on"));

        if recipe.bootable {
            script = script.then(Step::answer(&MAIN, "set 1 legacy_boot on"));
        }

        script.then(Step::wait(&MAIN))
    }

    fn print_table(&self) -> Script {
        Script::command("unit s print").then(Step::wait(&MAIN))
    }

    fn write_table(&self) -> Script {
        debug!("parted already committed the changes");
        Script::empty()
    }
}

#[cfg(test)]
mod tests {
    use std::{ffi::OsStr, path::Path};

    use test_log::test;

    use crate::{PartitionEditor as _, PartitionRecipe, Parted};

    // Prompts and confirmations are only recognized untranslated
    #[test]
    fn test_command_forces_c_locale() {
        let command = Parted::new().command(Path::new("disk.img"));

        assert!(command
            .get_envs()
            .any(|(key, value)| key == "LC_ALL" && value == Some(OsStr::new("C"))));
        assert_eq!(command.get_args().last(), Some(OsStr::new("disk.img")));
    }

    #[test]
    fn test_new_partition_replies() {
        let script = Parted::new().new_partition(&PartitionRecipe::default());

        assert_eq!(
            script.replies(),
            vec![
                "mkpart EFI fat32 2048s 93716s",
                "set 1 boot on",
                "set 1 legacy_boot on"
            ]
        );
    }

    #[test]
    fn test_write_table_is_noop() {
        let script = Parted::new().write_table();

        assert!(script.replies().is_empty());
        assert!(!script.ends_at_eof());
    }
}
