//! Core domain types for deltablob

use crate::signature::BlockSignature;

/// Inclusive byte range `[begin, end]` not yet resolved to a matched block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemainingBytes {
    pub begin: i64,
    pub end: i64,
}

impl RemainingBytes {
    /// Create a range covering `begin..=end`
    pub fn new(begin: i64, end: i64) -> Self {
        Self { begin, end }
    }

    /// Number of bytes in the range
    pub fn len(&self) -> u64 {
        (self.end - self.begin + 1) as u64
    }

    /// Always false: a range holds at least one byte
    pub fn is_empty(&self) -> bool {
        self.end < self.begin
    }
}

/// Outcome of scanning a file against a reference signature.
///
/// `ranges_to_transfer` and the spans of `reusable_blocks` partition the
/// scanned file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignatureSearchResult {
    pub ranges_to_transfer: Vec<RemainingBytes>,
    pub reusable_blocks: Vec<BlockSignature>,
}

impl SignatureSearchResult {
    /// Result for a file with no usable reference: everything must move
    pub fn whole_file(len: u64) -> Self {
        let ranges_to_transfer = if len == 0 {
            Vec::new()
        } else {
            vec![RemainingBytes::new(0, len as i64 - 1)]
        };
        Self {
            ranges_to_transfer,
            reusable_blocks: Vec::new(),
        }
    }

    /// Bytes that must be transferred
    pub fn bytes_to_transfer(&self) -> u64 {
        self.ranges_to_transfer.iter().map(|r| r.len()).sum()
    }

    /// Bytes covered by reusable blocks
    pub fn bytes_reused(&self) -> u64 {
        self.reusable_blocks.iter().map(|b| b.size as u64).sum()
    }
}

/// One entry of a blob's block manifest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedBlock {
    /// Content address (base64 of the strong digest)
    pub block_id: String,

    /// Position of the block in the target blob
    pub offset: i64,

    /// Block length
    pub size: u32,

    /// The block's own signature, carried into the next signature set
    pub signature: BlockSignature,

    /// Data came from the local file in this pass (false = reused block)
    pub is_new: bool,

    /// Same content was already staged earlier in this pass
    pub is_duplicate: bool,
}

/// Statistics of an upload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadReport {
    /// Bytes physically sent to the store
    pub bytes_uploaded: u64,
    /// Bytes satisfied by blocks already in the blob
    pub bytes_reused: u64,
    /// Blocks physically sent
    pub blocks_uploaded: usize,
    /// Blocks referenced from the previous version
    pub blocks_reused: usize,
    /// New blocks whose content was already staged in the same pass
    pub blocks_deduplicated: usize,
    /// Total length of the committed blob
    pub total_size: u64,
}

impl UploadReport {
    /// Build a report from a committed manifest
    pub fn from_blocks(blocks: &[UploadedBlock]) -> Self {
        let mut report = Self::default();
        for block in blocks {
            report.total_size += block.size as u64;
            if !block.is_new {
                report.bytes_reused += block.size as u64;
                report.blocks_reused += 1;
            } else if block.is_duplicate {
                report.blocks_deduplicated += 1;
            } else {
                report.bytes_uploaded += block.size as u64;
                report.blocks_uploaded += 1;
            }
        }
        report
    }

    /// Percentage of the blob that did not need uploading
    pub fn savings_percent(&self) -> f64 {
        if self.total_size == 0 {
            0.0
        } else {
            (self.total_size - self.bytes_uploaded) as f64 / self.total_size as f64 * 100.0
        }
    }
}

/// Statistics of a download
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadReport {
    /// Bytes fetched from the store
    pub bytes_downloaded: u64,
    /// Bytes copied from the existing local file
    pub bytes_reused: u64,
    /// Number of range requests issued
    pub range_requests: usize,
}
