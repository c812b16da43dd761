//! GUID Partition Table parsing.
//!
//! Grounded on the reference kernel's `gpt.c`/`gpt.h`. This module only
//! interprets sector buffers the caller has already filled via
//! [`super::sync_read`] — it never issues a disk read itself, matching
//! the reference's split between `gpt_probe_signature`/`gpt_parse` and
//! the `blkdev_sync_read` calls their callers make around them.

use alloc::string::String;
use alloc::vec::Vec;

const SIGNATURE: u64 = 0x5452_4150_2049_4645; // "EFI PART", little-endian on disk

#[derive(Clone, Copy, Debug)]
pub struct Header {
    pub revision: u32,
    pub header_size: u32,
    pub my_lba: u64,
    pub alternate_lba: u64,
    pub first_usable_lba: u64,
    pub last_usable_lba: u64,
    pub disk_guid: [u8; 16],
    pub gpes_lba: u64,
    pub gpes_num: u32,
    pub gpe_size: u32,
}

#[derive(Clone, Debug)]
pub struct Partition {
    pub name: String,
    pub starting_lba: u64,
    pub ending_lba: u64,
    pub type_guid: [u8; 16],
    pub part_guid: [u8; 16],
    pub used: bool,
}

/// `true` if `sector1` (LBA 1, 512 bytes) carries the GPT signature.
/// Does not validate anything past the signature.
pub fn probe_signature(sector1: &[u8]) -> bool {
    read_header(sector1).is_some()
}

fn read_header(sector1: &[u8]) -> Option<Header> {
    if sector1.len() < 92 {
        return None;
    }
    let signature = u64::from_le_bytes(sector1[0..8].try_into().ok()?);
    if signature != SIGNATURE {
        return None;
    }
    let mut disk_guid = [0u8; 16];
    disk_guid.copy_from_slice(&sector1[56..72]);

    Some(Header {
        revision: u32::from_le_bytes(sector1[8..12].try_into().ok()?),
        header_size: u32::from_le_bytes(sector1[12..16].try_into().ok()?),
        my_lba: u64::from_le_bytes(sector1[24..32].try_into().ok()?),
        alternate_lba: u64::from_le_bytes(sector1[32..40].try_into().ok()?),
        first_usable_lba: u64::from_le_bytes(sector1[40..48].try_into().ok()?),
        last_usable_lba: u64::from_le_bytes(sector1[48..56].try_into().ok()?),
        disk_guid,
        gpes_lba: u64::from_le_bytes(sector1[72..80].try_into().ok()?),
        gpes_num: u32::from_le_bytes(sector1[80..84].try_into().ok()?),
        gpe_size: u32::from_le_bytes(sector1[84..88].try_into().ok()?),
    })
}

/// Number of whole 512-byte sectors the partition entry array spans,
/// given a parsed header. The caller reads this many sectors starting
/// at `header.gpes_lba` before calling [`parse_entries`].
pub fn gpes_sector_count(header: &Header) -> u64 {
    let bytes = header.gpe_size as u64 * header.gpes_num as u64;
    (bytes + 511) / 512
}

/// Parses the partition entry array out of `gpes_buf`, which must hold
/// at least [`gpes_sector_count`] sectors read from `header.gpes_lba`.
pub fn parse_entries(header: &Header, gpes_buf: &[u8]) -> Vec<Partition> {
    const UNUSED_TYPE_GUID: [u8; 16] = [0; 16];

    let entry_size = header.gpe_size as usize;
    let mut parts = Vec::with_capacity(header.gpes_num as usize);

    for idx in 0..header.gpes_num as usize {
        let start = idx * entry_size;
        if start + 56 > gpes_buf.len() {
            break;
        }
        let entry = &gpes_buf[start..start + entry_size.min(gpes_buf.len() - start)];

        let mut type_guid = [0u8; 16];
        type_guid.copy_from_slice(&entry[0..16]);
        let mut part_guid = [0u8; 16];
        part_guid.copy_from_slice(&entry[16..32]);
        let starting_lba = u64::from_le_bytes(entry[32..40].try_into().unwrap());
        let ending_lba = u64::from_le_bytes(entry[40..48].try_into().unwrap());

        let name = decode_utf16le_name(&entry[56..]);
        let used = type_guid != UNUSED_TYPE_GUID;

        parts.push(Partition {
            name,
            starting_lba,
            ending_lba,
            type_guid,
            part_guid,
            used,
        });
    }

    parts
}

/// The partition name is a NUL-terminated UTF-16LE string padded with
/// zero code units out to the end of the entry.
fn decode_utf16le_name(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|&u| u != 0)
        .collect();
    char::decode_utf16(units)
        .map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_with(gpes_num: u32) -> Header {
        Header {
            revision: 0x0001_0000,
            header_size: 92,
            my_lba: 1,
            alternate_lba: 0,
            first_usable_lba: 34,
            last_usable_lba: 0,
            disk_guid: [0u8; 16],
            gpes_lba: 2,
            gpes_num,
            gpe_size: 128,
        }
    }

    #[test]
    fn parses_one_used_entry() {
        let header = header_with(1);
        let mut entry = [0u8; 128];
        entry[0] = 0xAA; // non-zero type_guid
        entry[32..40].copy_from_slice(&1000u64.to_le_bytes());
        entry[40..48].copy_from_slice(&2000u64.to_le_bytes());

        let parts = parse_entries(&header, &entry);
        assert_eq!(parts.len(), 1);
        assert!(parts[0].used);
        assert_eq!(parts[0].starting_lba, 1000);
        assert_eq!(parts[0].ending_lba, 2000);
    }

    #[test]
    fn unused_entry_has_zero_type_guid() {
        let header = header_with(1);
        let entry = [0u8; 128];

        let parts = parse_entries(&header, &entry);
        assert_eq!(parts.len(), 1);
        assert!(!parts[0].used);
    }

    #[test]
    fn probe_signature_rejects_short_or_wrong_sector() {
        assert!(!probe_signature(&[0u8; 91]));
        assert!(!probe_signature(&[0u8; 512]));
    }
}
