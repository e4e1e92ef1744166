use std::{
    fs::File,
    io::{self, BufWriter, Read as _, Seek as _, SeekFrom, Write as _},
    path::Path,
};

use log::{debug, info};
use part::{block_count, lba_to_bytes, SECTOR_SIZE};

const ZERO_BLOCK: [u8; 512] = [0; 512];

/// Creates, or truncates, a file made of `size` bytes of zeros.
///
/// The size is counted in whole sectors, any trailing partial sector is dropped. Returns the
/// actual size of the file.
pub(crate) fn allocate(path: &Path, size: u64) -> Result<u64, io::Error> {
    let blocks = block_count(size, SECTOR_SIZE);

    info!(
        "Creating zeroed disk {} ({blocks} blocks of {SECTOR_SIZE} bytes)",
        path.display()
    );

    let file = File::create(path)?;
    let mut writer = BufWriter::new(&file);
    for _ in 0..blocks {
        writer.write_all(&ZERO_BLOCK)?;
    }

    writer.flush()?;
    drop(writer);

    file.sync_all()?;

    Ok(lba_to_bytes(blocks))
}

/// Copies `size` bytes, counted in whole sectors, from `input` to `output`.
///
/// The input is read starting at `skip` sectors, and written starting at `seek` sectors. The
/// output is never truncated.
fn copy_blocks(
    input: &mut File,
    output: &mut File,
    size: u64,
    skip: u64,
    seek: u64,
) -> Result<u64, io::Error> {
    let blocks = block_count(size, SECTOR_SIZE);
    let len = lba_to_bytes(blocks);

    debug!("Copying {blocks} blocks, skipping {skip}, seeking {seek}");

    input.seek(SeekFrom::Start(lba_to_bytes(skip)))?;
    output.seek(SeekFrom::Start(lba_to_bytes(seek)))?;

    let copied = io::copy(&mut input.take(len), output)?;
    if copied != len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("Only {copied} bytes out of {len} could be copied"),
        ));
    }

    output.flush()?;
    output.sync_all()?;

    Ok(copied)
}

/// Writes the first `size` bytes of `image` into `disk`, at sector `seek`.
pub(crate) fn splice(image: &Path, disk: &Path, size: u64, seek: u64) -> Result<u64, io::Error> {
    info!(
        "Writing {} into {} at sector {seek}",
        image.display(),
        disk.display()
    );

    let mut input = File::open(image)?;
    let mut output = File::options().write(true).open(disk)?;

    copy_blocks(&mut input, &mut output, size, 0, seek)
}

/// Creates `image` out of `size` bytes of `disk`, starting at sector `skip`.
pub(crate) fn extract(disk: &Path, image: &Path, size: u64, skip: u64) -> Result<u64, io::Error> {
    info!(
        "Reading {} from sector {skip} into {}",
        disk.display(),
        image.display()
    );

    let mut input = File::open(disk)?;
    let mut output = File::create(image)?;

    copy_blocks(&mut input, &mut output, size, skip, 0)
}
