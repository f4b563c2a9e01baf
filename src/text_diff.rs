use std::ops::Range;

use similar::{Algorithm, DiffOp, DiffTag};

/// How many leading bytes are inspected when classifying content as binary.
pub const DEFAULT_SNIFF_LEN: usize = 8000;

/// Fraction of control bytes in the sniffed prefix above which content is binary.
pub const DEFAULT_BINARY_RATIO: f64 = 0.10;

/// Split a buffer into lines. Every line keeps its terminating `\n`; only the
/// last line may lack one.
pub fn split_lines(data: &[u8]) -> Vec<&[u8]> {
    data.split_inclusive(|&b| b == b'\n').collect()
}

/// Returns true when `data` looks like binary content and should be copied
/// whole instead of diffed.
pub fn is_binary(data: &[u8]) -> bool {
    is_binary_with(data, DEFAULT_SNIFF_LEN, DEFAULT_BINARY_RATIO)
}

/// Binary classification: a NUL byte anywhere, or a ratio of non-text
/// control bytes above `ratio` within the first `sniff_len` bytes.
pub fn is_binary_with(data: &[u8], sniff_len: usize, ratio: f64) -> bool {
    if data.contains(&0) {
        return true;
    }
    let prefix = &data[..data.len().min(sniff_len)];
    if prefix.is_empty() {
        return false;
    }
    let control = prefix
        .iter()
        .filter(|&&b| (b < 0x20 && !matches!(b, b'\t' | b'\n' | b'\r' | 0x0c | 0x1b)) || b == 0x7f)
        .count();
    control as f64 / prefix.len() as f64 > ratio
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditKind {
    Insert,
    Delete,
    Replace,
}

/// One changed region, as 0-based half-open line ranges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edit {
    pub kind: EditKind,
    pub old: Range<usize>,
    pub new: Range<usize>,
}

/// Line-level comparison of two byte buffers.
///
/// Lines are compared as raw bytes including their terminator, so the text
/// encoding never matters and a missing final newline counts as a change.
pub struct TextDiff<'a> {
    old_lines: Vec<&'a [u8]>,
    new_lines: Vec<&'a [u8]>,
    ops: Vec<DiffOp>,
}

impl<'a> TextDiff<'a> {
    pub fn new(old: &'a [u8], new: &'a [u8]) -> Self {
        let old_lines = split_lines(old);
        let new_lines = split_lines(new);
        let ops = if old == new {
            Vec::new()
        } else {
            similar::capture_diff_slices(Algorithm::Myers, &old_lines, &new_lines)
        };
        Self {
            old_lines,
            new_lines,
            ops,
        }
    }

    pub fn old_lines(&self) -> &[&'a [u8]] {
        &self.old_lines
    }

    pub fn new_lines(&self) -> &[&'a [u8]] {
        &self.new_lines
    }

    pub fn has_differences(&self) -> bool {
        self.ops.iter().any(|op| op.tag() != DiffTag::Equal)
    }

    /// The edit script, in old-file order.
    pub fn edits(&self) -> impl Iterator<Item = Edit> + '_ {
        self.ops.iter().filter_map(|op| {
            let (tag, old, new) = op.as_tag_tuple();
            let kind = match tag {
                DiffTag::Equal => return None,
                DiffTag::Insert => EditKind::Insert,
                DiffTag::Delete => EditKind::Delete,
                DiffTag::Replace => EditKind::Replace,
            };
            Some(Edit { kind, old, new })
        })
    }

    /// Group edits that are at most `2 * context` unchanged lines apart, so
    /// each group becomes one hunk.
    pub fn grouped_edits(&self, context: usize) -> Vec<Vec<Edit>> {
        let mut groups: Vec<Vec<Edit>> = Vec::new();
        for edit in self.edits() {
            match groups.last_mut() {
                Some(group)
                    if group
                        .last()
                        .is_some_and(|prev| edit.old.start - prev.old.end <= 2 * context) =>
                {
                    group.push(edit)
                }
                _ => groups.push(vec![edit]),
            }
        }
        groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_data() {
        let data = b"one\ntwo\nthree\n";
        let diff = TextDiff::new(data, data);
        assert!(!diff.has_differences());
        assert_eq!(diff.edits().count(), 0);
    }

    #[test]
    fn test_single_line_replaced() {
        let diff = TextDiff::new(b"A\nB\nC\nD\nE\n", b"A\nX\nC\nD\nE\n");
        assert!(diff.has_differences());
        let edits: Vec<Edit> = diff.edits().collect();
        assert_eq!(
            edits,
            vec![Edit {
                kind: EditKind::Replace,
                old: 1..2,
                new: 1..2
            }]
        );
    }

    #[test]
    fn test_insert_and_delete() {
        let diff = TextDiff::new(b"a\nb\nc\n", b"a\nc\nd\n");
        let kinds: Vec<EditKind> = diff.edits().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EditKind::Delete, EditKind::Insert]);
    }

    #[test]
    fn test_missing_final_newline_is_a_change() {
        let diff = TextDiff::new(b"a\nb\n", b"a\nb");
        assert!(diff.has_differences());
        assert_eq!(diff.new_lines().last().copied(), Some(&b"b"[..]));
    }

    #[test]
    fn test_non_utf8_lines() {
        let old = b"caf\xe9\nok\n";
        let new = b"caf\xe9\nok\n\xff\xfe\n";
        let diff = TextDiff::new(old, new);
        let edits: Vec<Edit> = diff.edits().collect();
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0].kind, EditKind::Insert);
        assert_eq!(edits[0].new, 2..3);
    }

    #[test]
    fn test_grouping_respects_context() {
        let old = b"1\n2\n3\n4\n5\n6\n7\n8\n9\n10\n";
        let new = b"1\nX\n3\n4\n5\n6\n7\n8\nY\n10\n";
        let diff = TextDiff::new(old, new);
        assert_eq!(diff.grouped_edits(0).len(), 2);
        assert_eq!(diff.grouped_edits(3).len(), 1);
    }

    #[test]
    fn test_binary_detection() {
        assert!(!is_binary(b""));
        assert!(!is_binary(b"plain text\r\nwith\ttabs\n"));
        assert!(!is_binary("unicode \u{00e9}\u{4e16}\n".as_bytes()));
        assert!(is_binary(b"regf\0\0\0\x01"));
        assert!(is_binary(&[0x01, 0x02, 0x03, b'a', 0x04]));
    }

    #[test]
    fn test_control_ratio_sniff_is_bounded() {
        let mut data = vec![b'a'; 100];
        data.extend_from_slice(&[0x01; 20]);
        assert!(!is_binary_with(&data, 50, DEFAULT_BINARY_RATIO));
        assert!(is_binary_with(&data, 200, DEFAULT_BINARY_RATIO));
    }

    #[test]
    fn test_late_nul_is_binary() {
        let mut data = vec![b'a'; 100];
        data.push(0);
        assert!(is_binary_with(&data, 50, DEFAULT_BINARY_RATIO));
    }
}
