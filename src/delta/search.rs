//! Signature search: find reference blocks inside a local file
//!
//! Block sizes are processed largest first. Each pass slides a window over
//! the ranges the previous passes left unmatched, rolling the weak checksum
//! one byte at a time and confirming hits with the strong digest. Accepted
//! matches consume the window greedily, so matches never overlap.

use crate::error::Result;
use crate::mmap::LockedMmap;
use crate::signature::{BlockSignature, CompleteSignature, RollingHash, RollingSignature, SignatureSet, StrongHash};
use crate::types::{RemainingBytes, SignatureSearchResult};
use std::collections::HashMap;
use std::path::Path;

/// Search a file for blocks of `reference`
pub fn search(path: &Path, reference: &SignatureSet) -> Result<SignatureSearchResult> {
    let mmap = LockedMmap::open(path)?;
    Ok(search_bytes(&mmap, reference))
}

/// Search a buffer for blocks of `reference`.
///
/// Matched blocks are returned with `offset` rewritten to their position in
/// `data`.
pub fn search_bytes(data: &[u8], reference: &SignatureSet) -> SignatureSearchResult {
    let mut remaining = if data.is_empty() {
        Vec::new()
    } else {
        vec![RemainingBytes::new(0, data.len() as i64 - 1)]
    };
    let mut reusable_blocks = Vec::new();

    for size in reference.sizes_descending() {
        let complete = &reference.signatures[&size];
        remaining = search_size(data, complete, size as usize, &remaining, &mut reusable_blocks);

        tracing::trace!(
            block_size = size,
            matched = reusable_blocks.len(),
            open_ranges = remaining.len(),
            "Finished block size pass"
        );
    }

    let result = SignatureSearchResult {
        ranges_to_transfer: remaining,
        reusable_blocks,
    };

    tracing::debug!(
        size = data.len(),
        sizes = reference.signatures.len(),
        reusable_blocks = result.reusable_blocks.len(),
        bytes_reused = result.bytes_reused(),
        bytes_to_transfer = result.bytes_to_transfer(),
        "Signature search complete"
    );

    result
}

/// Weak checksum -> candidate blocks. Blocks that repeat the strong digest of
/// an earlier candidate are dropped, they can never win.
fn build_lookup(sig: &CompleteSignature) -> HashMap<RollingSignature, Vec<&BlockSignature>> {
    let mut lookup: HashMap<RollingSignature, Vec<&BlockSignature>> = HashMap::new();
    for block in &sig.blocks {
        let candidates = lookup.entry(block.rolling).or_default();
        if !candidates.iter().any(|c| c.strong == block.strong) {
            candidates.push(block);
        }
    }
    lookup
}

/// One pass of a single block size over the open ranges; returns the ranges
/// still unmatched afterwards
fn search_size(
    data: &[u8],
    sig: &CompleteSignature,
    window: usize,
    ranges: &[RemainingBytes],
    reusable: &mut Vec<BlockSignature>,
) -> Vec<RemainingBytes> {
    let lookup = build_lookup(sig);
    let mut next = Vec::with_capacity(ranges.len());

    for range in ranges {
        // Too short to hold a block of this size
        if window == 0 || range.len() < window as u64 {
            next.push(*range);
            continue;
        }

        let end = range.end as usize + 1;
        let mut pos = range.begin as usize;
        let mut unmatched_start = pos;
        let mut fresh = true;
        let mut rolling = RollingSignature::default();

        while pos + window <= end {
            rolling = if fresh {
                RollingHash::init(&data[pos..pos + window])
            } else {
                RollingHash::roll(window, data[pos - 1], data[pos + window - 1], rolling)
            };

            let matched = lookup.get(&rolling).and_then(|candidates| {
                let strong = StrongHash::digest(&data[pos..pos + window]);
                candidates.iter().find(|c| c.strong == strong)
            });

            match matched {
                Some(block) => {
                    if unmatched_start < pos {
                        next.push(RemainingBytes::new(unmatched_start as i64, pos as i64 - 1));
                    }

                    let mut reused = (*block).clone();
                    reused.offset = pos as i64;
                    reusable.push(reused);

                    pos += window;
                    unmatched_start = pos;
                    fresh = true;
                }
                None => {
                    pos += 1;
                    fresh = false;
                }
            }
        }

        if unmatched_start < end {
            next.push(RemainingBytes::new(unmatched_start as i64, end as i64 - 1));
        }
    }

    next
}
