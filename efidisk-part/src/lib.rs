#![doc = include_str!("../README.md")]

use core::ops::{Add, Sub};

use num_traits::{ConstOne, ConstZero};
#[cfg(test)]
use test_log as _;

/// Size of a logical block, in bytes
pub const SECTOR_SIZE: u64 = 512;

/// First LBA of the EFI System Partition
pub const ESP_FIRST_LBA: u64 = 2048;

/// Last LBA of the EFI System Partition, inclusive
pub const ESP_LAST_LBA: u64 = 93716;

/// Size of the area reserved for the partition table ahead of the first partition, in bytes
pub const PARTITION_GAP_BYTES: u64 = ESP_FIRST_LBA * SECTOR_SIZE;

/// Number of LBAs taken by a GPT header and its partition entries
pub const GPT_TABLE_LBAS: u64 = 33;

/// First LBA a partition can start at, past the protective MBR and the primary GPT
pub const FIRST_USABLE_LBA: u64 = 1 + GPT_TABLE_LBAS;

/// Default size of the disk image, in bytes
pub const DEFAULT_DISK_SIZE: u64 = 46 * 1024 * 1024;

/// Returns the number of whole blocks of `block_size` bytes in `size` bytes.
///
/// Any trailing partial block is dropped. Raw copies skip and seek by this count, so the
/// remainder must never be rounded up.
///
/// # Panics
///
/// If the block size is zero.
#[must_use]
pub fn block_count(size: u64, block_size: u64) -> u64 {
    size / block_size
}

/// Converts an LBA to its byte offset
#[must_use]
pub fn lba_to_bytes(lba: u64) -> u64 {
    lba * SECTOR_SIZE
}

/// Size of the offline FAT image for a disk of `disk_size` bytes, whose partition starts at
/// `first_lba`.
///
/// This is everything past the partition table gap, whatever the actual partition end is.
#[must_use]
pub fn partition_image_size(disk_size: u64, first_lba: u64) -> u64 {
    disk_size.saturating_sub(lba_to_bytes(first_lba))
}

/// Last LBA a partition can end at on a disk of `disk_size` bytes, ahead of the backup GPT.
///
/// Returns `None` if the disk can't even hold both tables.
#[must_use]
pub fn last_usable_lba(disk_size: u64) -> Option<u64> {
    block_count(disk_size, SECTOR_SIZE)
        .checked_sub(GPT_TABLE_LBAS + 1)
        .filter(|last| *last >= FIRST_USABLE_LBA)
}

#[must_use]
#[doc(hidden)]
pub fn type_name_of_expr<T>(_: T) -> &'static str {
    core::any::type_name::<T>()
}

/// Converts an integer to another integer type
///
/// # Panics
///
/// If the conversion fails.
#[macro_export]
macro_rules! num_cast {
    ($t: ty, $v: expr) => {
        <$t>::try_from($v).expect(&format!(
            "Integer Overflow ({} to {})",
            core::any::type_name::<$t>(),
            $crate::type_name_of_expr($v),
        ))
    };
}

/// Computes the size between a start and end indexes
///
/// # Panics
///
/// If start or end are negative, or if end is lower than start.
pub fn start_end_to_size<T>(start: T, end: T) -> T
where
    T: Add<Output = T> + Ord + ConstOne + ConstZero + Sub<Output = T>,
{
    assert!(start >= T::ZERO, "Negative start offset");
    assert!(end >= T::ZERO, "Negative end offset");
    assert!(end >= start, "End offset is lower than start offset");

    (end - start) + T::ONE
}
