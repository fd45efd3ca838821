//! Primary MBR partition table of a disk image, as file-absolute byte ranges.
//!
//! Handles raw images and images that carry the cloning tool's 128-byte file
//! header in front of the disk data.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use serde::Serialize;

const SECTOR_SIZE: u64 = 512;
const MBR_SIG_OFFSET: u64 = 510;
const MBR_PART_OFFSET: u64 = 446;
const MBR_SIGNATURE: [u8; 2] = [0x55, 0xAA];

/// GUID {1d4d7b73-fa01-40e1-b094-5267d8fa0be7} in on-disk (mixed-endian) order.
const IMAGE_MAGIC: [u8; 16] = [
    0x73, 0x7b, 0x4d, 0x1d, 0x01, 0xfa, 0xe1, 0x40, 0xb0, 0x94, 0x52, 0x67, 0xd8, 0xfa, 0x0b, 0xe7,
];
const IMAGE_HEADER_SIZE: usize = 128;
/// Fifth u64 field: magic(16) + 2×u16 + 8×u32 + 4 pad + 4×u64.
const DATA_OFFSET_FIELD: usize = 88;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionInfo {
    /// 1-based table slot.
    pub number: u8,
    pub part_type: u8,
    /// Byte offset into the image file, header included.
    pub offset: u64,
    pub size: u64,
    pub active: bool,
}

impl PartitionInfo {
    pub fn type_name(&self) -> String {
        let known = match self.part_type {
            0x01 => "FAT12",
            0x04 => "FAT16 <32M",
            0x05 => "Extended",
            0x06 => "FAT16",
            0x07 => "NTFS/exFAT",
            0x0B => "FAT32",
            0x0C => "FAT32 LBA",
            0x0E => "FAT16 LBA",
            0x0F => "Extended LBA",
            0x82 => "Linux swap",
            0x83 => "Linux",
            0x8E => "Linux LVM",
            0xEE => "GPT protective",
            0xEF => "EFI System",
            other => return format!("Type 0x{:02X}", other),
        };
        known.to_string()
    }
}

/// Where disk data starts in `file`; 0 unless it carries the image header.
fn data_offset(file: &mut File) -> u64 {
    let mut header = [0u8; IMAGE_HEADER_SIZE];
    if file.seek(SeekFrom::Start(0)).is_err() || file.read_exact(&mut header).is_err() {
        return 0;
    }
    if header[..16] != IMAGE_MAGIC {
        return 0;
    }
    let mut field = [0u8; 8];
    field.copy_from_slice(&header[DATA_OFFSET_FIELD..DATA_OFFSET_FIELD + 8]);
    u64::from_le_bytes(field)
}

/// Non-empty primary partitions. Unreadable files and images without an MBR
/// signature yield an empty list.
pub fn read_partitions(image: &Path) -> Vec<PartitionInfo> {
    read_table(image).unwrap_or_default()
}

fn read_table(image: &Path) -> std::io::Result<Vec<PartitionInfo>> {
    let mut file = File::open(image)?;
    let base = data_offset(&mut file);
    // A corrupt header can point anywhere; past u64 range there is no table.
    let Some(sig_at) = base.checked_add(MBR_SIG_OFFSET) else {
        return Ok(Vec::new());
    };

    let mut sig = [0u8; 2];
    file.seek(SeekFrom::Start(sig_at))?;
    file.read_exact(&mut sig)?;
    if sig != MBR_SIGNATURE {
        return Ok(Vec::new());
    }

    let mut table = [0u8; 64];
    file.seek(SeekFrom::Start(base + MBR_PART_OFFSET))?;
    file.read_exact(&mut table)?;

    let partitions = table
        .chunks_exact(16)
        .enumerate()
        .filter_map(|(i, entry)| {
            let part_type = entry[4];
            let lba_start = u32::from_le_bytes([entry[8], entry[9], entry[10], entry[11]]) as u64;
            let lba_count = u32::from_le_bytes([entry[12], entry[13], entry[14], entry[15]]) as u64;
            if part_type == 0 || lba_count == 0 {
                return None;
            }
            Some(PartitionInfo {
                number: i as u8 + 1,
                part_type,
                offset: base.checked_add(lba_start * SECTOR_SIZE)?,
                size: lba_count * SECTOR_SIZE,
                active: entry[0] == 0x80,
            })
        })
        .collect();

    Ok(partitions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(active: bool, part_type: u8, lba_start: u32, lba_count: u32) -> [u8; 16] {
        let mut e = [0u8; 16];
        e[0] = if active { 0x80 } else { 0 };
        e[4] = part_type;
        e[8..12].copy_from_slice(&lba_start.to_le_bytes());
        e[12..16].copy_from_slice(&lba_count.to_le_bytes());
        e
    }

    fn mbr(entries: &[[u8; 16]]) -> Vec<u8> {
        let mut sector = vec![0u8; 512];
        for (i, e) in entries.iter().enumerate() {
            let at = MBR_PART_OFFSET as usize + i * 16;
            sector[at..at + 16].copy_from_slice(e);
        }
        sector[510] = 0x55;
        sector[511] = 0xAA;
        sector
    }

    #[test]
    fn test_raw_image() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("raw.img");
        let sector = mbr(&[entry(true, 0x0C, 2048, 4096), [0u8; 16], entry(false, 0x83, 8192, 100)]);
        std::fs::write(&path, sector).unwrap();

        let parts = read_partitions(&path);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].number, 1);
        assert_eq!(parts[0].offset, 2048 * 512);
        assert_eq!(parts[0].size, 4096 * 512);
        assert!(parts[0].active);
        assert_eq!(parts[0].type_name(), "FAT32 LBA");
        assert_eq!(parts[1].number, 3);
        assert!(!parts[1].active);
    }

    #[test]
    fn test_image_with_header() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("odin.img");

        let data_offset: u64 = 4096;
        let mut file = header_with_offset(data_offset);
        file.resize(data_offset as usize, 0);
        file.extend(mbr(&[entry(false, 0x07, 63, 1000)]));
        std::fs::write(&path, file).unwrap();

        let parts = read_partitions(&path);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].offset, data_offset + 63 * 512);
        assert_eq!(parts[0].type_name(), "NTFS/exFAT");
    }

    fn header_with_offset(data_offset: u64) -> Vec<u8> {
        let mut header = vec![0u8; IMAGE_HEADER_SIZE];
        header[..16].copy_from_slice(&IMAGE_MAGIC);
        header[DATA_OFFSET_FIELD..DATA_OFFSET_FIELD + 8].copy_from_slice(&data_offset.to_le_bytes());
        header
    }

    #[test]
    fn test_corrupt_header_offset() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("corrupt.img");

        std::fs::write(&path, header_with_offset(u64::MAX)).unwrap();
        assert!(read_partitions(&path).is_empty());

        std::fs::write(&path, header_with_offset(u64::MAX - 600)).unwrap();
        assert!(read_partitions(&path).is_empty());
    }

    #[test]
    fn test_missing_signature() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("blank.img");
        std::fs::write(&path, vec![0u8; 1024]).unwrap();
        assert!(read_partitions(&path).is_empty());
    }

    #[test]
    fn test_unreadable_file() {
        let temp = tempdir().unwrap();
        assert!(read_partitions(&temp.path().join("nope.img")).is_empty());
    }

    #[test]
    fn test_unknown_type_name() {
        let p = PartitionInfo {
            number: 1,
            part_type: 0xAB,
            offset: 0,
            size: 0,
            active: false,
        };
        assert_eq!(p.type_name(), "Type 0xAB");
    }
}
