#![doc = include_str!("../README.md")]

use std::{
    fs::File,
    io::{self, Read as _, Seek as _},
};

use bit_field::BitField as _;
use log::{debug, trace};
use part::{lba_to_bytes, num_cast, start_end_to_size};
use uuid::{uuid, Uuid};

const BLOCK_SIZE: usize = 512;

const MBR_HEADER_OFFSET_LBA: u64 = 0;
const MBR_PARTITION_TABLE_OFFSET: usize = 446;
const MBR_PARTITION_TYPE_OFFSET: usize = 4;
const MBR_SIGNATURE_OFFSET: usize = 510;
const MBR_SIGNATURE: u16 = 0xaa55;
const MBR_PROTECTIVE_PARTITION_TYPE: u8 = 0xee;

const GPT_SIGNATURE_HEADER: u64 = 0x5452_4150_2049_4645;
const GPT_HEADER_OFFSET_LBA: u64 = 1;
const GPT_HEADER_MIN_SIZE: usize = 92;
const GPT_PARTITION_ENTRY_MIN_SIZE: usize = 128;
const GPT_PARTITION_MAX_NUM: usize = 1024;
const GPT_PARTITION_NAME_OFFSET: usize = 56;
const GPT_PARTITION_NAME_LEN: usize = 72;

const ATTRIBUTE_PLATFORM_REQUIRED_BIT: usize = 0;
const ATTRIBUTE_LEGACY_BIOS_BOOTABLE_BIT: usize = 2;

/// Standard EFI System Partition GUID. See the
/// [UAPI discoverable partition specification][uapi spec], [Partition Type Section][uapi gpt types]
/// for further details.
///
/// [uapi spec]: https://uapi-group.org/specifications/specs/discoverable_partitions_specification/
/// [uapi gpt types]: https://uapi-group.org/specifications/specs/discoverable_partitions_specification/#defined-partition-type-uuids
pub const EFI_SYSTEM_PART_GUID: Uuid = uuid!("c12a7328-f81f-11d2-ba4b-00a0c93ec93b");

fn le_u16(buf: &[u8], offset: usize) -> u16 {
    let mut bytes = [0; 2];
    bytes.copy_from_slice(&buf[offset..(offset + 2)]);
    u16::from_le_bytes(bytes)
}

fn le_u32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0; 4];
    bytes.copy_from_slice(&buf[offset..(offset + 4)]);
    u32::from_le_bytes(bytes)
}

fn le_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0; 8];
    bytes.copy_from_slice(&buf[offset..(offset + 8)]);
    u64::from_le_bytes(bytes)
}

fn guid_from_bytes(buf: &[u8], offset: usize) -> Uuid {
    let mut bytes = [0; 16];
    bytes.copy_from_slice(&buf[offset..(offset + 16)]);
    Uuid::from_bytes_le(bytes)
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

fn read_lba(mut file: &File, lba: u64, buf: &mut [u8]) -> Result<(), io::Error> {
    file.seek(io::SeekFrom::Start(lba_to_bytes(lba)))?;
    file.read_exact(buf)
}

/// A GUID Partition entry in use
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GuidPartition {
    /// Index of the entry in the partition array, starting at 1
    pub number: usize,

    /// Partition Type GUID
    pub type_guid: Uuid,

    /// Unique Partition GUID
    pub guid: Uuid,

    /// First LBA of the partition
    pub first_lba: u64,

    /// Last LBA of the partition, inclusive
    pub last_lba: u64,

    /// Attribute bits. See Table 5.8 of the [UEFI Specification].
    ///
    /// [UEFI Specification]: https://uefi.org/sites/default/files/resources/UEFI_Spec_2_10_Aug29.pdf
    pub attributes: u64,

    /// Partition Name
    pub name: String,
}

impl GuidPartition {
    /// Whether the partition is an EFI System Partition
    #[must_use]
    pub fn is_efi_system(&self) -> bool {
        self.type_guid == EFI_SYSTEM_PART_GUID
    }

    /// Whether the partition is marked as bootable for Legacy BIOS implementations
    #[must_use]
    pub fn is_bootable(&self) -> bool {
        self.attributes.get_bit(ATTRIBUTE_LEGACY_BIOS_BOOTABLE_BIT)
    }

    /// Whether the partition is marked as required for the platform to function
    #[must_use]
    pub fn is_platform_required(&self) -> bool {
        self.attributes.get_bit(ATTRIBUTE_PLATFORM_REQUIRED_BIT)
    }

    /// Size of the partition in LBAs
    #[must_use]
    pub fn size_lba(&self) -> u64 {
        start_end_to_size(self.first_lba, self.last_lba)
    }

    fn from_entry(number: usize, entry: &[u8]) -> Option<Self> {
        let type_guid = guid_from_bytes(entry, 0);
        if type_guid.is_nil() {
            return None;
        }

        let units = entry[GPT_PARTITION_NAME_OFFSET..(GPT_PARTITION_NAME_OFFSET + GPT_PARTITION_NAME_LEN)]
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .take_while(|c| *c != 0)
            .collect::<Vec<_>>();

        Some(Self {
            number,
            type_guid,
            guid: guid_from_bytes(entry, 16),
            first_lba: le_u64(entry, 32),
            last_lba: le_u64(entry, 40),
            attributes: le_u64(entry, 48),
            name: String::from_utf16_lossy(&units),
        })
    }
}

/// GUID Partition Table Representation, as found on disk
#[derive(Debug)]
pub struct GuidPartitionTable {
    /// Disk GUID
    pub disk_guid: Uuid,

    /// First LBA usable by partitions
    pub first_usable_lba: u64,

    /// Last LBA usable by partitions, inclusive
    pub last_usable_lba: u64,

    /// Partitions in use, in entry order
    pub partitions: Vec<GuidPartition>,
}

impl GuidPartitionTable {
    fn check_protective_mbr(file: &File) -> Result<(), io::Error> {
        let mut mbr = [0u8; BLOCK_SIZE];
        read_lba(file, MBR_HEADER_OFFSET_LBA, &mut mbr)?;

        if le_u16(&mbr, MBR_SIGNATURE_OFFSET) != MBR_SIGNATURE {
            return Err(invalid("Missing MBR signature"));
        }

        let kind = mbr[MBR_PARTITION_TABLE_OFFSET + MBR_PARTITION_TYPE_OFFSET];
        debug!("First MBR partition type is {kind:#x}");

        if kind != MBR_PROTECTIVE_PARTITION_TYPE {
            return Err(invalid("MBR isn't a protective MBR"));
        }

        Ok(())
    }

    /// Reads the primary GPT from a file
    ///
    /// # Errors
    ///
    /// This function will return an [`std::io::Error`] if the file doesn't hold a valid GPT, if
    /// one of the checksums doesn't match, or when accessing the underlying [`File`].
    ///
    /// # Panics
    ///
    /// Panics if we have an integer overflow in one of the integer type conversions
    #[allow(clippy::unwrap_in_result)]
    pub fn read(file: &File) -> Result<Self, io::Error> {
        Self::check_protective_mbr(file)?;

        let mut header = [0u8; BLOCK_SIZE];
        read_lba(file, GPT_HEADER_OFFSET_LBA, &mut header)?;

        if le_u64(&header, 0) != GPT_SIGNATURE_HEADER {
            return Err(invalid("Missing GPT signature"));
        }

        let header_size = num_cast!(usize, le_u32(&header, 12));
        debug!("Header Len is {header_size}");

        if !(GPT_HEADER_MIN_SIZE..=BLOCK_SIZE).contains(&header_size) {
            return Err(invalid("Invalid GPT header size"));
        }

        let header_crc = le_u32(&header, 16);
        let mut crc_header = header[..header_size].to_vec();
        crc_header[16..20].fill(0);
        if crc32fast::hash(&crc_header) != header_crc {
            return Err(invalid("GPT header checksum mismatch"));
        }

        if le_u64(&header, 24) != GPT_HEADER_OFFSET_LBA {
            return Err(invalid("GPT header isn't the primary header"));
        }

        let first_usable_lba = le_u64(&header, 40);
        let last_usable_lba = le_u64(&header, 48);
        debug!("Usable LBAs: {first_usable_lba} to {last_usable_lba}");

        let disk_guid = guid_from_bytes(&header, 56);
        let entries_lba = le_u64(&header, 72);
        let num_parts = num_cast!(usize, le_u32(&header, 80));
        let entry_size = num_cast!(usize, le_u32(&header, 84));
        let entries_crc = le_u32(&header, 88);

        debug!("{num_parts} partition entries of {entry_size} bytes at LBA {entries_lba}");

        if entry_size < GPT_PARTITION_ENTRY_MIN_SIZE || entry_size % 8 != 0 {
            return Err(invalid("Invalid GPT partition entry size"));
        }

        if num_parts > GPT_PARTITION_MAX_NUM {
            return Err(invalid("Too many GPT partition entries"));
        }

        let mut entries = vec![0u8; num_parts * entry_size];
        read_lba(file, entries_lba, &mut entries)?;

        if crc32fast::hash(&entries) != entries_crc {
            return Err(invalid("GPT partition entries checksum mismatch"));
        }

        let partitions = entries
            .chunks_exact(entry_size)
            .enumerate()
            .filter_map(|(idx, entry)| GuidPartition::from_entry(idx + 1, entry))
            .collect::<Vec<_>>();

        for part in &partitions {
            trace!(
                "Partition {}: type {}, LBAs {} to {}, attributes {:#x}",
                part.number,
                part.type_guid,
                part.first_lba,
                part.last_lba,
                part.attributes
            );
        }

        Ok(Self {
            disk_guid,
            first_usable_lba,
            last_usable_lba,
            partitions,
        })
    }
}
