//! Binary signature format
//!
//! All integers are little-endian:
//!
//! ```text
//! i32 number_of_block_sizes
//! repeat:
//!     i32 block_size_key
//!     i32 entry_count
//!     repeat:
//!         i64  offset
//!         i32  size
//!         u32  block_number
//!         u128 rolling.s1
//!         u128 rolling.s2
//!         [u8; 16] strong
//! ```
//!
//! The accumulators get 16 bytes so the format never narrows them.

use super::{BlockSignature, CompleteSignature, RollingSignature, SignatureSet, STRONG_SIGNATURE_LEN};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Cursor, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Encoded size of one block entry
pub const ENTRY_LEN: usize = 8 + 4 + 4 + 16 + 16 + STRONG_SIGNATURE_LEN;

/// Serialize a signature set. Sizes are written largest first.
pub fn encode<W: Write>(sig: &SignatureSet, mut writer: W) -> Result<()> {
    let sizes = sig.sizes_descending();
    write_i32(&mut writer, count_to_i32(sizes.len(), "block size count")?)?;

    for size in sizes {
        let complete = &sig.signatures[&size];
        write_i32(&mut writer, count_to_i32(size as usize, "block size")?)?;
        write_i32(&mut writer, count_to_i32(complete.blocks.len(), "entry count")?)?;

        for block in &complete.blocks {
            writer
                .write_all(&block.offset.to_le_bytes())
                .map_err(|e| Error::io("writing offset", e))?;
            write_i32(&mut writer, count_to_i32(block.size as usize, "block size")?)?;
            writer
                .write_all(&block.block_number.to_le_bytes())
                .map_err(|e| Error::io("writing block number", e))?;
            writer
                .write_all(&(block.rolling.s1 as u128).to_le_bytes())
                .map_err(|e| Error::io("writing rolling s1", e))?;
            writer
                .write_all(&(block.rolling.s2 as u128).to_le_bytes())
                .map_err(|e| Error::io("writing rolling s2", e))?;
            writer
                .write_all(&block.strong)
                .map_err(|e| Error::io("writing strong signature", e))?;
        }
    }

    writer.flush().map_err(|e| Error::io("flushing signature", e))?;
    Ok(())
}

/// Serialize a signature set to bytes
pub fn encode_to_bytes(sig: &SignatureSet) -> Result<Vec<u8>> {
    let mut data = Vec::with_capacity(4 + sig.signatures.len() * 8 + sig.block_count() * ENTRY_LEN);
    encode(sig, &mut data)?;
    Ok(data)
}

/// Deserialize a signature set, always starting from the beginning of `reader`
pub fn decode<R: Read + Seek>(mut reader: R) -> Result<SignatureSet> {
    reader
        .seek(SeekFrom::Start(0))
        .map_err(|e| Error::io("rewinding signature", e))?;

    let size_count = read_count(&mut reader, "block size count")?;
    let mut signatures = HashMap::new();

    for _ in 0..size_count {
        let key = read_i32(&mut reader, "block size key")?;
        if key <= 0 {
            return Err(Error::corrupt(format!("invalid block size key {}", key)));
        }
        let key = key as u32;

        let entry_count = read_count(&mut reader, "entry count")?;
        let mut blocks = Vec::new();

        for _ in 0..entry_count {
            let block = read_entry(&mut reader)?;
            if block.size != key {
                return Err(Error::corrupt(format!(
                    "block {} has size {} under key {}",
                    block.block_number, block.size, key
                )));
            }
            blocks.push(block);
        }

        if signatures.insert(key, CompleteSignature { blocks }).is_some() {
            return Err(Error::corrupt(format!("duplicate block size key {}", key)));
        }
    }

    let mut probe = [0u8; 1];
    match reader.read(&mut probe) {
        Ok(0) => {}
        Ok(_) => return Err(Error::corrupt("trailing bytes after signature")),
        Err(e) => return Err(Error::io("reading signature", e)),
    }

    Ok(SignatureSet { signatures })
}

/// Deserialize a signature set from bytes
pub fn decode_bytes(data: &[u8]) -> Result<SignatureSet> {
    decode(Cursor::new(data))
}

/// Write a signature to a file
pub fn write_signature(sig: &SignatureSet, path: &Path) -> Result<()> {
    let file = File::create(path).map_err(|e| Error::io("creating signature file", e))?;
    encode(sig, BufWriter::new(file))
}

/// Read a signature from a file
pub fn read_signature(path: &Path) -> Result<SignatureSet> {
    let file = File::open(path).map_err(|e| Error::io("opening signature file", e))?;
    decode(BufReader::new(file))
}

fn read_entry<R: Read>(reader: &mut R) -> Result<BlockSignature> {
    let mut entry = [0u8; ENTRY_LEN];
    read_exact(reader, &mut entry, "block entry")?;

    let offset = i64::from_le_bytes(field(&entry, 0));
    let size = i32::from_le_bytes(field(&entry, 8));
    let block_number = u32::from_le_bytes(field(&entry, 12));
    let s1 = u128::from_le_bytes(field(&entry, 16));
    let s2 = u128::from_le_bytes(field(&entry, 32));
    let strong = field(&entry, 48);

    if offset < 0 {
        return Err(Error::corrupt(format!("negative block offset {}", offset)));
    }
    if size <= 0 {
        return Err(Error::corrupt(format!("invalid block size {}", size)));
    }
    let rolling = RollingSignature {
        s1: u64::try_from(s1).map_err(|_| Error::corrupt("rolling s1 out of range"))?,
        s2: u64::try_from(s2).map_err(|_| Error::corrupt("rolling s2 out of range"))?,
    };

    Ok(BlockSignature {
        offset,
        size: size as u32,
        rolling,
        strong,
        block_number,
    })
}

/// Copy a fixed-width field out of an entry buffer
fn field<const N: usize>(entry: &[u8; ENTRY_LEN], at: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&entry[at..at + N]);
    out
}

fn read_exact<R: Read>(reader: &mut R, buf: &mut [u8], what: &str) -> Result<()> {
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            Error::corrupt(format!("signature truncated while reading {}", what))
        } else {
            Error::io(format!("reading {}", what), e)
        }
    })
}

fn read_i32<R: Read>(reader: &mut R, what: &str) -> Result<i32> {
    let mut buf = [0u8; 4];
    read_exact(reader, &mut buf, what)?;
    Ok(i32::from_le_bytes(buf))
}

fn read_count<R: Read>(reader: &mut R, what: &str) -> Result<usize> {
    let value = read_i32(reader, what)?;
    if value < 0 {
        return Err(Error::corrupt(format!("negative {} {}", what, value)));
    }
    Ok(value as usize)
}

fn write_i32<W: Write>(writer: &mut W, value: i32) -> Result<()> {
    writer
        .write_all(&value.to_le_bytes())
        .map_err(|e| Error::io("writing signature", e))
}

fn count_to_i32(value: usize, what: &str) -> Result<i32> {
    i32::try_from(value).map_err(|_| Error::config(format!("{} {} does not fit the format", what, value)))
}
