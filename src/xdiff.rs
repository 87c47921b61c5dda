use std::borrow::Cow;

pub type ConflictStyle = diffy::ConflictStyle;

pub const DEFAULT_MARKER_SIZE: usize = 7;

/// Which side wins conflicted hunks. `Normal` leaves the markers in.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MergeFavor {
    Normal,
    Ours,
    Theirs,
}

impl Default for MergeFavor {
    fn default() -> Self {
        MergeFavor::Normal
    }
}

pub struct BlobMergeResult {
    pub bytes: Vec<u8>,
    pub clean: bool,
}

/// Three-way merge of blob contents. A missing ancestor merges against the
/// empty blob. Infallible: a conflicted merge returns the marker-annotated
/// buffer with `clean: false` rather than an error.
pub fn merge_blobs(
    style: ConflictStyle,
    marker_size: usize,
    favor: MergeFavor,
    base: Option<&[u8]>,
    ours: &[u8],
    theirs: &[u8],
) -> BlobMergeResult {
    let ancestor = base.unwrap_or(b"");
    let merged = diffy::MergeOptions::new()
        .set_conflict_marker_length(marker_size)
        .set_conflict_style(style)
        .merge_bytes(ancestor, ours, theirs);
    match merged {
        Ok(bytes) => BlobMergeResult { bytes, clean: true },
        Err(conflicted) => match favor {
            MergeFavor::Normal => BlobMergeResult { bytes: conflicted, clean: false },
            MergeFavor::Ours => BlobMergeResult {
                bytes: strip_conflict_hunks(&conflicted, marker_size, true),
                clean: true,
            },
            MergeFavor::Theirs => BlobMergeResult {
                bytes: strip_conflict_hunks(&conflicted, marker_size, false),
                clean: true,
            },
        },
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ConflictRegion {
    None,
    Ours,
    Original,
    Theirs,
}

fn is_marker(line: &[u8], marker: u8, marker_size: usize) -> bool {
    line.len() >= marker_size
        && line[..marker_size].iter().all(|&b| b == marker)
        && line.get(marker_size).map_or(true, |&b| b == b' ' || b == b'\n' || b == b'\r')
}

/// Resolve conflicted output by keeping only the chosen side of every
/// conflict hunk. Works for both conflict styles since the `|||||||`
/// original section is just another region to drop.
fn strip_conflict_hunks(bytes: &[u8], marker_size: usize, keep_ours: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut region = ConflictRegion::None;
    for line in split_lines(bytes) {
        if is_marker(line, b'<', marker_size) {
            region = ConflictRegion::Ours;
            continue;
        } else if is_marker(line, b'|', marker_size) && region == ConflictRegion::Ours {
            region = ConflictRegion::Original;
            continue;
        } else if is_marker(line, b'=', marker_size) && region != ConflictRegion::None {
            region = ConflictRegion::Theirs;
            continue;
        } else if is_marker(line, b'>', marker_size) && region == ConflictRegion::Theirs {
            region = ConflictRegion::None;
            continue;
        }

        let keep = match region {
            ConflictRegion::None => true,
            ConflictRegion::Ours => keep_ours,
            ConflictRegion::Original => false,
            ConflictRegion::Theirs => !keep_ours,
        };
        if keep {
            out.extend_from_slice(line);
        }
    }
    out
}

fn split_lines(bytes: &[u8]) -> impl Iterator<Item = &[u8]> {
    let mut rest = bytes;
    std::iter::from_fn(move || {
        if rest.is_empty() {
            return None;
        }
        let end = rest.iter().position(|&b| b == b'\n').map(|i| i + 1).unwrap_or(rest.len());
        let (line, tail) = rest.split_at(end);
        rest = tail;
        Some(line)
    })
}

/// Equality after line-ending normalization; the check behind treating a
/// crlf-only difference as "unchanged" when `renormalize` is on.
pub fn renormalized_eq(a: &[u8], b: &[u8]) -> bool {
    normalize_crlf(a) == normalize_crlf(b)
}

fn normalize_crlf(bytes: &[u8]) -> Cow<'_, [u8]> {
    if !bytes.windows(2).any(|w| w == b"\r\n") {
        return Cow::Borrowed(bytes);
    }
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\r' && bytes.get(i + 1) == Some(&b'\n') {
            i += 1;
            continue;
        }
        out.push(bytes[i]);
        i += 1;
    }
    Cow::Owned(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &[u8] = b"1\n2\n3\n";
    const OURS: &[u8] = b"1\n2a\n3\n";
    const THEIRS: &[u8] = b"1\n2b\n3\n";

    #[test]
    fn merge_is_clean_when_one_side_is_unchanged() {
        let result =
            merge_blobs(ConflictStyle::Merge, DEFAULT_MARKER_SIZE, MergeFavor::Normal, Some(BASE), OURS, BASE);
        assert!(result.clean);
        assert_eq!(result.bytes, OURS);
    }

    #[test]
    fn conflicting_hunks_produce_markers_of_the_requested_size() {
        let result =
            merge_blobs(ConflictStyle::Merge, 11, MergeFavor::Normal, Some(BASE), OURS, THEIRS);
        assert!(!result.clean);
        let text = String::from_utf8(result.bytes).unwrap();
        assert!(text.contains(&"<".repeat(11)));
        assert!(text.contains(&">".repeat(11)));
        assert!(text.contains("2a\n"));
        assert!(text.contains("2b\n"));
    }

    #[test]
    fn favoring_a_side_resolves_conflicts() {
        let ours =
            merge_blobs(ConflictStyle::Merge, DEFAULT_MARKER_SIZE, MergeFavor::Ours, Some(BASE), OURS, THEIRS);
        assert!(ours.clean);
        assert_eq!(ours.bytes, OURS);

        let theirs =
            merge_blobs(ConflictStyle::Diff3, DEFAULT_MARKER_SIZE, MergeFavor::Theirs, Some(BASE), OURS, THEIRS);
        assert!(theirs.clean);
        assert_eq!(theirs.bytes, THEIRS);
    }

    #[test]
    fn renormalized_equality_ignores_crlf() {
        assert!(renormalized_eq(b"a\r\nb\r\n", b"a\nb\n"));
        assert!(!renormalized_eq(b"a\nb\n", b"a\nc\n"));
    }
}
