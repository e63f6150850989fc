//! Resource index records.
//!
//! ```text
//! 0x00  [u8; 12]  name, zero padded
//! 0x0C  u32 LE    size (low 24 bits) | flags (high 8 bits)
//! 0x10  u32 LE    reserved
//! 0x14  u32 LE    media mask (current revision only)
//! ```

use std::io::{Cursor, Read, Write};

use bitflags::bitflags;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};

use super::{ResourceError, ResourceResult, MAX_DESCRIPTORS};

pub const NAME_LEN: usize = 12;

/// Mask selecting the size bits of the size/flags word.
pub const SIZE_MASK: u32 = 0x00FF_FFFF;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ResourceFlags: u32 {
        const PRELOAD = 0x0100_0000;
        const DISCARDABLE = 0x0200_0000;
        const SOUND = 0x0400_0000;
        const GRAPHIC = 0x0800_0000;
        const COMPRESSED = 0x1000_0000;
        const LOADED = 0x2000_0000;
    }
}

/// Layout revision of the index file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum IndexRevision {
    /// 20-byte records without a media mask.
    Legacy,
    /// 24-byte records ending in a media mask.
    #[default]
    Current,
}

impl IndexRevision {
    pub const fn record_size(self) -> usize {
        match self {
            IndexRevision::Legacy => 20,
            IndexRevision::Current => 24,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRecord {
    pub name: String,
    pub size: u32,
    pub flags: ResourceFlags,
    pub media: u32,
}

impl IndexRecord {
    pub fn new(name: impl Into<String>, size: u32, flags: ResourceFlags) -> Self {
        Self {
            name: name.into(),
            size: size & SIZE_MASK,
            flags,
            media: 0,
        }
    }

    pub fn with_media(mut self, media: u32) -> Self {
        self.media = media;
        self
    }

    fn read(reader: &mut impl Read, revision: IndexRevision) -> std::io::Result<Self> {
        let mut name = [0u8; NAME_LEN];
        reader.read_exact(&mut name)?;
        let size_flags = reader.read_u32::<LittleEndian>()?;
        let _reserved = reader.read_u32::<LittleEndian>()?;
        let media = match revision {
            IndexRevision::Current => reader.read_u32::<LittleEndian>()?,
            IndexRevision::Legacy => 0,
        };

        let len = name.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
        Ok(Self {
            name: String::from_utf8_lossy(&name[..len]).into_owned(),
            size: size_flags & SIZE_MASK,
            flags: ResourceFlags::from_bits_truncate(size_flags & !SIZE_MASK),
            media,
        })
    }

    /// Appends the record in on-disk form. Names longer than 12 bytes are
    /// truncated.
    pub fn write(&self, out: &mut impl Write, revision: IndexRevision) -> std::io::Result<()> {
        let mut name = [0u8; NAME_LEN];
        let bytes = self.name.as_bytes();
        let len = bytes.len().min(NAME_LEN);
        name[..len].copy_from_slice(&bytes[..len]);
        out.write_all(&name)?;
        out.write_u32::<LittleEndian>((self.size & SIZE_MASK) | self.flags.bits())?;
        out.write_u32::<LittleEndian>(0)?;
        if revision == IndexRevision::Current {
            out.write_u32::<LittleEndian>(self.media)?;
        }
        Ok(())
    }
}

/// Parses a whole index image.
pub fn parse_index(bytes: &[u8], revision: IndexRevision) -> ResourceResult<Vec<IndexRecord>> {
    let record = revision.record_size();
    if bytes.is_empty() || bytes.len() % record != 0 {
        return Err(ResourceError::CorruptIndex {
            len: bytes.len(),
            record,
        });
    }
    let count = bytes.len() / record;
    if count > MAX_DESCRIPTORS {
        return Err(ResourceError::TooManyResources {
            count,
            max: MAX_DESCRIPTORS,
        });
    }

    let mut cursor = Cursor::new(bytes);
    (0..count)
        .map(|_| IndexRecord::read(&mut cursor, revision).map_err(ResourceError::from))
        .collect()
}

/// Serializes records into an index image.
pub fn build_index(records: &[IndexRecord], revision: IndexRevision) -> Vec<u8> {
    let mut out = Vec::with_capacity(records.len() * revision.record_size());
    for record in records {
        // writing into a Vec cannot fail
        let _ = record.write(&mut out, revision);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_current_records() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"TEST.DAT\0\0\0\0");
        bytes.extend_from_slice(&(100u32 | 0x0200_0000).to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&0b10u32.to_le_bytes());

        let records = parse_index(&bytes, IndexRevision::Current).unwrap();
        assert_eq!(
            records,
            vec![IndexRecord::new("TEST.DAT", 100, ResourceFlags::DISCARDABLE).with_media(0b10)]
        );
    }

    #[test]
    fn legacy_records_have_no_media_mask() {
        let records = vec![
            IndexRecord::new("SCENE1.SCN", 4000, ResourceFlags::PRELOAD),
            IndexRecord::new("FONT.FNT", 12, ResourceFlags::GRAPHIC | ResourceFlags::DISCARDABLE),
        ];
        let image = build_index(&records, IndexRevision::Legacy);
        assert_eq!(image.len(), 40);
        assert_eq!(parse_index(&image, IndexRevision::Legacy).unwrap(), records);
    }

    #[test]
    fn rejects_partial_records() {
        let image = build_index(&[IndexRecord::new("A", 1, ResourceFlags::empty())], IndexRevision::Current);
        match parse_index(&image[..23], IndexRevision::Current) {
            Err(ResourceError::CorruptIndex { len: 23, record: 24 }) => {}
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(matches!(
            parse_index(&[], IndexRevision::Current),
            Err(ResourceError::CorruptIndex { len: 0, .. })
        ));
    }

    #[test]
    fn name_of_exactly_twelve_bytes() {
        let image = build_index(&[IndexRecord::new("ABCDEFGH.IJK", 8, ResourceFlags::empty())], IndexRevision::Current);
        let records = parse_index(&image, IndexRevision::Current).unwrap();
        assert_eq!(records[0].name, "ABCDEFGH.IJK");
    }
}
