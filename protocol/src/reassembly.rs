//! Split-response reassembly
//!
//! Definitions translate each raw datagram into a [`Datagram`]: either a whole
//! payload or one numbered [`Fragment`] of a group. Fragments of a group are
//! ordered by number before they are joined, so arrival order never matters.
//! Groups flagged as compressed are bzip2-decompressed after joining and checked
//! against the declared length and CRC32.

use bzip2::read::BzDecoder;
use log::debug;
use std::collections::BTreeMap;
use std::io::Read;

use crate::error::{QueryError, Result};

/// Top bit of a split group id marks a compressed group
pub const COMPRESSED_FLAG: u32 = 0x8000_0000;

pub fn is_compressed(group: u32) -> bool {
    group & COMPRESSED_FLAG != 0
}

/// Size and checksum a compressed group declares for its decompressed payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionHeader {
    pub decompressed_len: u32,
    pub crc32: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub group: u32,
    pub number: u32,
    /// Fragment count of the group, if this fragment announces it
    pub total: Option<u32>,
    pub compression: Option<CompressionHeader>,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Datagram {
    Whole(Vec<u8>),
    Fragment(Fragment),
}

/// Concatenates ordered fragment payloads into one payload
pub type JoinFn = fn(Vec<Vec<u8>>) -> Vec<u8>;

pub fn concat(parts: Vec<Vec<u8>>) -> Vec<u8> {
    parts.concat()
}

/// Orders, joins and (if needed) decompresses one fragment group
///
/// Duplicate fragment numbers (retransmissions) keep the first copy.
pub fn reassemble(fragments: Vec<Fragment>, join: JoinFn) -> Result<Vec<u8>> {
    let mut ordered: BTreeMap<u32, Fragment> = BTreeMap::new();
    for fragment in fragments {
        ordered.entry(fragment.number).or_insert(fragment);
    }

    if let Some(total) = ordered.values().find_map(|f| f.total) {
        let contiguous = ordered.keys().copied().eq(0..total);
        if !contiguous {
            return Err(QueryError::IncompleteResponse {
                received: ordered.len(),
                expected: total as usize,
            });
        }
    }

    let compression = ordered.values().find_map(|f| f.compression);
    let compressed = ordered.values().any(|f| is_compressed(f.group));
    let parts: Vec<Vec<u8>> = ordered.into_values().map(|f| f.payload).collect();
    let joined = join(parts);

    match (compressed, compression) {
        (_, Some(header)) => decompress(&joined, header),
        (true, None) => Err(QueryError::malformed(
            "compressed split response without a compression header",
        )),
        (false, None) => Ok(joined),
    }
}

/// Bzip2-decompresses `data` and verifies it against `header`
///
/// Inflates at most one byte past the declared length.
pub fn decompress(data: &[u8], header: CompressionHeader) -> Result<Vec<u8>> {
    let limit = u64::from(header.decompressed_len) + 1;
    let mut out = Vec::new();
    BzDecoder::new(data)
        .take(limit)
        .read_to_end(&mut out)
        .map_err(|e| QueryError::Decompression(e.to_string()))?;

    let actual = u32::try_from(out.len()).unwrap_or(u32::MAX);
    if actual != header.decompressed_len {
        return Err(QueryError::ChecksumMismatch {
            what: "decompressed length",
            expected: header.decompressed_len,
            actual,
        });
    }

    if let Some(expected) = header.crc32 {
        let actual = crc32fast::hash(&out);
        if actual != expected {
            return Err(QueryError::ChecksumMismatch {
                what: "crc32",
                expected,
                actual,
            });
        }
    }

    debug!("decompressed {} -> {} bytes", data.len(), out.len());
    Ok(out)
}

/// Joins fragments whose variable-length records straddle datagram boundaries
///
/// Some servers cut the last variable of a fragment short and send it again,
/// complete, at the start of the next fragment together with the section name
/// it belongs to. Two passes undo that:
///
/// 1. if the last variable of fragment N is contained in the first variable of
///    fragment N+1 (read after the leading name, its NUL and one offset byte),
///    the truncated variable is removed from fragment N;
/// 2. if the leading name of fragment N+1 appears anywhere in fragment N, every
///    occurrence of it is removed from N+1 and the two bytes that follow the
///    first one (NUL plus offset byte) are dropped.
///
/// The offset byte is skipped unconditionally, whether or not it was sent.
pub fn join_deduplicated(mut parts: Vec<Vec<u8>>) -> Vec<u8> {
    let count = parts.len();

    for i in 0..count.saturating_sub(1) {
        let first = &parts[i][..parts[i].len().saturating_sub(1)];
        let first_var = match first.iter().rposition(|b| *b == 0) {
            Some(pos) => &first[pos + 1..],
            None => first.get(1..).unwrap_or(&[]),
        };

        let second = &parts[i + 1];
        let skip = second.iter().position(|b| *b == 0).map_or(2, |pos| pos + 2);
        let second = second.get(skip..).unwrap_or(&[]);
        let second_var = match second.iter().position(|b| *b == 0) {
            Some(pos) => &second[..pos],
            None => &[][..],
        };

        let has_var = !first_var.is_empty() && first_var != b"0";
        if has_var && contains(second_var, first_var) {
            strip_trailing_variable(&mut parts[i]);
        }
    }

    for x in 1..count {
        let prefix_len = parts[x]
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(parts[x].len());
        if prefix_len == 0 {
            continue;
        }
        let prefix = parts[x][..prefix_len].to_vec();
        if contains(&parts[x - 1], &prefix) {
            let cleaned = remove_all(&parts[x], &prefix);
            parts[x] = cleaned.get(2..).map(<[u8]>::to_vec).unwrap_or_default();
        }
    }

    parts.concat()
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|w| w == needle)
}

fn remove_all(data: &[u8], needle: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        if data[i..].starts_with(needle) {
            i += needle.len();
        } else {
            out.push(data[i]);
            i += 1;
        }
    }
    out
}

/// Turns a trailing `\0<var>\0` into a single `\0`
fn strip_trailing_variable(part: &mut Vec<u8>) {
    if part.len() < 3 || part[part.len() - 1] != 0 {
        return;
    }
    let body = &part[..part.len() - 1];
    if let Some(pos) = body.iter().rposition(|b| *b == 0) {
        if pos + 1 < body.len() {
            part.truncate(pos + 1);
        }
    }
}
