#![allow(clippy::multiple_crate_versions)]
#![doc = include_str!("../../README.md")]

use std::{
    fs::File,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context as _};
use clap::Parser;
use config::Config;
use editor::{create_partition_table, PartitionRecipe};
use gpt::GuidPartitionTable;
use log::{debug, info};
use plan::{Flags, Plan};
use types::{EditorKind, EfiDiskError, Tool};

mod config;
mod disk;
mod loopback;
mod mtools;
mod plan;
mod utils;

use crate::utils::{find_program, is_root};

fn required_programs(tool: Tool, plan: &Plan, editor: EditorKind) -> Vec<&'static str> {
    let mut programs = Vec::new();

    if plan.partition {
        programs.push(editor.as_str());
    }

    match tool {
        Tool::LoopbackDevice => {
            programs.push("lsblk");

            if plan.format {
                programs.push("mkfs.fat");
            }
        }
        Tool::Mtools => {
            if plan.format {
                programs.push("mformat");
            }

            programs.extend(["mmd", "mcopy"]);
        }
    }

    programs
}

fn existing_path(path: &str) -> Result<PathBuf, String> {
    let path = PathBuf::from(path);

    if !path.exists() {
        return Err(format!("{} does not exist", path.display()));
    }

    Ok(path)
}

#[derive(Debug, Parser)]
#[command(
    version,
    about = "Creates a disk image holding a bootable EFI partition with the given files or directories"
)]
struct Cli {
    #[arg(short, long, value_name = "OUTFILE", help = "Disk image file")]
    output: PathBuf,

    #[arg(long, help = "Clean the cache: format the partition and replace all files")]
    clean_cache: bool,

    #[arg(long, help = "Force the creation of a new zeroed and partitioned disk")]
    force_dd: bool,

    #[arg(long, help = "Force formatting the EFI partition")]
    force_format: bool,

    #[arg(long, help = "Force replacing all files")]
    force_copy: bool,

    #[arg(
        long,
        value_enum,
        default_value_t,
        help = "Tool used to populate the partition. loopback-device needs root privileges"
    )]
    tool: Tool,

    #[arg(long, value_enum, help = "Partition editor [default: gdisk]")]
    editor: Option<EditorKind>,

    #[arg(long, value_name = "FILE", help = "TOML configuration file")]
    config: Option<PathBuf>,

    #[arg(
        long,
        value_name = "SECS",
        help = "Time to wait for each partition editor prompt, 0 waits forever [default: 30]"
    )]
    dialogue_timeout: Option<u64>,

    #[arg(long, value_name = "BYTES", help = "Disk size [default: 46 MiB]")]
    size: Option<u64>,

    #[arg(
        long,
        value_name = "DIR",
        help = "Mount point used by loopback-device, a temporary directory otherwise"
    )]
    mount_point: Option<PathBuf>,

    #[arg(
        required = true,
        value_name = "FILE",
        value_parser = existing_path,
        help = "Files or directories to copy in the EFI partition"
    )]
    files: Vec<PathBuf>,
}

impl Cli {
    fn flags(&self) -> Flags {
        Flags {
            clean_cache: self.clean_cache,
            force_dd: self.force_dd,
            force_format: self.force_format,
            force_copy: self.force_copy,
        }
    }

    fn config(&self) -> Result<Config, EfiDiskError> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };

        if let Some(editor) = self.editor {
            config.partition.editor = editor;
        }

        if let Some(timeout) = self.dialogue_timeout {
            config.dialogue.timeout = timeout;
        }

        if let Some(size) = self.size {
            config.disk.size = size;
        }

        config.validate()?;

        Ok(config)
    }
}

fn verify_table(disk: &Path, recipe: &PartitionRecipe) -> Result<(), EfiDiskError> {
    let table = GuidPartitionTable::read(&File::open(disk)?).map_err(|e| {
        EfiDiskError::TableMismatch(format!("Couldn't read the partition table: {e}"))
    })?;

    let [esp] = table.partitions.as_slice() else {
        return Err(EfiDiskError::TableMismatch(format!(
            "Expected a single partition, found {}",
            table.partitions.len()
        )));
    };

    if !esp.is_efi_system() {
        return Err(EfiDiskError::TableMismatch(format!(
            "Partition type is {}",
            esp.type_guid
        )));
    }

    if recipe.bootable && !esp.is_bootable() {
        return Err(EfiDiskError::TableMismatch(String::from(
            "Partition isn't bootable",
        )));
    }

    let expected = (
        recipe.first_lba.unwrap_or(esp.first_lba),
        recipe.last_lba.unwrap_or(esp.last_lba),
    );

    if (esp.first_lba, esp.last_lba) != expected {
        return Err(EfiDiskError::TableMismatch(format!(
            "Partition spans LBAs {} to {}, expected {} to {}",
            esp.first_lba, esp.last_lba, expected.0, expected.1
        )));
    }

    info!(
        "EFI System Partition {} spans LBAs {} to {}",
        esp.guid, esp.first_lba, esp.last_lba
    );

    Ok(())
}

fn partition(disk: &Path, config: &Config) -> Result<(), EfiDiskError> {
    let recipe = config.recipe();
    let editor = editor::editor(config.partition.editor);

    info!("Partitioning {} with {}", disk.display(), editor.name());

    create_partition_table(editor.as_ref(), disk, &recipe, config.timeout())?;
    verify_table(disk, &recipe)
}

fn main() -> Result<(), anyhow::Error> {
    env_logger::init();

    let cli = Cli::parse();

    info!(
        "Running {} {}",
        env!("CARGO_CRATE_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    debug!("{cli:?}");

    let config = cli.config().context("Invalid configuration")?;

    if cli.tool.needs_root() && !is_root() {
        return Err(EfiDiskError::Permission(format!(
            "need to be root to use {}",
            cli.tool
        ))
        .into());
    }

    let output_exists = cli.output.exists();
    if output_exists && !cli.output.is_file() {
        bail!("Output argument isn't a file");
    }

    let plan = Plan::new(output_exists, cli.flags());
    info!("Using {} to populate {}: {plan}", cli.tool, cli.output.display());

    for program in required_programs(cli.tool, &plan, config.partition.editor) {
        if find_program(program).is_none() {
            return Err(EfiDiskError::Precondition(format!("{program} isn't installed")).into());
        }
    }

    if plan.allocate {
        disk::allocate(&cli.output, config.disk.size)
            .with_context(|| format!("Couldn't create {}", cli.output.display()))?;
    }

    if plan.partition {
        partition(&cli.output, &config).context("Couldn't create the partition table")?;
    }

    match cli.tool {
        Tool::LoopbackDevice => loopback::populate(
            &cli.output,
            &plan,
            &config.fat,
            cli.mount_point.as_deref(),
            &cli.files,
        ),
        Tool::Mtools => mtools::populate(
            &cli.output,
            &plan,
            &config.fat,
            config.partition.first_lba,
            &cli.files,
        ),
    }
    .context("Couldn't populate the EFI partition")?;

    info!("{} is ready", cli.output.display());

    Ok(())
}
