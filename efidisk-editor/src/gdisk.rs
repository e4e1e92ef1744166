use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    process::Command,
};

use once_cell::sync::Lazy;

use crate::{
    script::{Prompt, Script, Step},
    PartitionEditor, PartitionRecipe,
};

static MAIN: Lazy<Prompt> = Lazy::new(|| Prompt::new("main prompt", r"Command \(\? for help\): "));
static EXPERT: Lazy<Prompt> =
    Lazy::new(|| Prompt::new("expert prompt", r"Expert command \(\? for help\): "));
static CONFIRM: Lazy<Prompt> = Lazy::new(|| Prompt::new("confirmation", r"\(Y/N\): "));
static PART_NUMBER: Lazy<Prompt> =
    Lazy::new(|| Prompt::new("partition number", r"Partition number \(.*\): "));
static FIRST_SECTOR: Lazy<Prompt> = Lazy::new(|| {
    Prompt::new(
        "first sector",
        r"First sector \(.*\) or \{\+-\}size\{KMGTP\}: ",
    )
});
static LAST_SECTOR: Lazy<Prompt> = Lazy::new(|| {
    Prompt::new(
        "last sector",
        r"Last sector \(.*\) or \{\+-\}size\{KMGTP\}: ",
    )
});
static TYPE_CODE: Lazy<Prompt> =
    Lazy::new(|| Prompt::new("partition type", r"Hex code or GUID \(.*\): "));
static ATTRIBUTE: Lazy<Prompt> =
    Lazy::new(|| Prompt::new("attribute toggle", r"Toggle which attribute field \(.*\): "));

const LEGACY_BIOS_BOOTABLE_ATTRIBUTE: &str = "2";

/// GPT fdisk back-end
#[derive(Debug)]
pub struct Gdisk {
    program: PathBuf,
    args: Vec<OsString>,
}

impl Gdisk {
    /// Uses the `gdisk` program found in the `PATH`
    #[must_use]
    pub fn new() -> Self {
        Self::with_command("gdisk", Vec::<OsString>::new())
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

impl Default for Gdisk {
    fn default() -> Self {
        Self::new()
    }
}

fn sector(lba: Option<u64>) -> String {
    lba.map(|l| l.to_string()).unwrap_or_default()
}

impl PartitionEditor for Gdisk {
    fn name(&self) -> &'static str {
        "gdisk"
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
        "q"
    }

    fn new_table(&self) -> Script {
        Script::command("o")
            .on(&CONFIRM, "Y")
            .then(Step::wait(&MAIN))
    }

    fn new_partition(&self, recipe: &PartitionRecipe) -> Script {
        let script = Script::command("n")
            .then(Step::answer(&PART_NUMBER, ""))
            .then(Step::answer(&FIRST_SECTOR, sector(recipe.first_lba)))
            .then(Step::answer(&LAST_SECTOR, sector(recipe.last_lba)))
            .then(Step::answer(&TYPE_CODE, recipe.kind.gdisk_code()));

        if !recipe.bootable {
            return script.then(Step::wait(&MAIN));
        }

        // The attributes live in the expert menu. With a single partition, gdisk picks it
        // without asking.
        script
            .then(Step::answer(&MAIN, "x"))
            .then(Step::answer(&EXPERT, "a"))
            .then(Step::answer(&ATTRIBUTE, LEGACY_BIOS_BOOTABLE_ATTRIBUTE))
            .then(Step::answer(&ATTRIBUTE, ""))
            .then(Step::answer(&EXPERT, "m"))
            .then(Step::wait(&MAIN))
    }

    fn print_table(&self) -> Script {
        Script::command("p").then(Step::wait(&MAIN))
    }

    fn write_table(&self) -> Script {
        // gdisk exits once the table is written
        Script::command("w")
            .then(Step::answer(&CONFIRM, "Y"))
            .then(Step::eof())
    }
}
