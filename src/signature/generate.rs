//! Signature generation: fixed-size blocks, rolling checksum plus MD5

use super::{BlockSignature, RollingHash, SignatureSet, StrongHash};
use crate::error::{Error, Result};
use crate::mmap::LockedMmap;
use crate::types::UploadedBlock;
use rayon::prelude::*;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// Files above this size are memory mapped and hashed in parallel
const MMAP_THRESHOLD: u64 = 16 * 1024 * 1024;

/// Signature of one block
fn block_signature(chunk: &[u8], offset: u64, block_number: u32) -> BlockSignature {
    BlockSignature {
        offset: offset as i64,
        size: chunk.len() as u32,
        rolling: RollingHash::init(chunk),
        strong: StrongHash::digest(chunk),
        block_number,
    }
}

fn check_block_size(block_size: usize) -> Result<()> {
    if block_size == 0 || block_size > u32::MAX as usize {
        return Err(Error::config(format!("invalid block size {}", block_size)));
    }
    Ok(())
}

/// Generate the signature set of a file
pub fn build(path: &Path, block_size: usize) -> Result<SignatureSet> {
    check_block_size(block_size)?;

    let file = File::open(path).map_err(|e| Error::io("opening file", e))?;
    let file_size = file
        .metadata()
        .map_err(|e| Error::io("reading metadata", e))?
        .len();

    if file_size == 0 {
        return Ok(SignatureSet::new());
    }

    if file_size > MMAP_THRESHOLD {
        build_mmap(file, block_size)
    } else {
        build_from_reader(BufReader::new(file), block_size)
    }
}

/// Generate using a memory map, hashing blocks on the rayon pool
fn build_mmap(file: File, block_size: usize) -> Result<SignatureSet> {
    let mmap = LockedMmap::from_file(file)?;
    let data: &[u8] = &mmap;

    let blocks: Vec<BlockSignature> = data
        .par_chunks(block_size)
        .enumerate()
        .map(|(i, chunk)| block_signature(chunk, (i * block_size) as u64, i as u32))
        .collect();

    let mut sig = SignatureSet::new();
    for block in blocks {
        sig.insert(block);
    }

    tracing::debug!(
        size = data.len(),
        blocks = sig.block_count(),
        block_size,
        "Generated signature (mmap)"
    );

    Ok(sig)
}

/// Generate from any reader, one block-sized window at a time
pub fn build_from_reader<R: Read>(mut reader: R, block_size: usize) -> Result<SignatureSet> {
    check_block_size(block_size)?;

    let mut sig = SignatureSet::new();
    let mut buffer = vec![0u8; block_size];
    let mut offset = 0u64;
    let mut block_number = 0u32;

    loop {
        let bytes_read = read_full(&mut reader, &mut buffer)?;
        if bytes_read == 0 {
            break;
        }

        sig.insert(block_signature(&buffer[..bytes_read], offset, block_number));

        offset += bytes_read as u64;
        block_number += 1;

        if bytes_read < block_size {
            break;
        }
    }

    Ok(sig)
}

/// Fill `buf` unless the reader hits EOF first; short reads mid-stream would
/// otherwise produce short blocks in the middle of the file
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::io("reading file", e)),
        }
    }
    Ok(filled)
}

/// Generate from a byte slice
pub fn build_from_bytes(data: &[u8], block_size: usize) -> Result<SignatureSet> {
    check_block_size(block_size)?;

    let mut sig = SignatureSet::new();
    for (i, chunk) in data.chunks(block_size).enumerate() {
        sig.insert(block_signature(chunk, (i * block_size) as u64, i as u32));
    }

    Ok(sig)
}

/// Derive the signature of a freshly committed blob from its block list.
///
/// Every block keeps its own rolling and strong signature; block numbers are
/// reassigned in offset order.
pub fn signature_from_blocks(blocks: &[UploadedBlock]) -> SignatureSet {
    let mut ordered: Vec<&UploadedBlock> = blocks.iter().collect();
    ordered.sort_by_key(|b| b.offset);

    let mut sig = SignatureSet::new();
    for (i, block) in ordered.into_iter().enumerate() {
        let mut entry = block.signature.clone();
        entry.offset = block.offset;
        entry.block_number = i as u32;
        sig.insert(entry);
    }
    sig
}
