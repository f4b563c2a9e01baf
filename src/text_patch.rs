use crate::error::{DiffError, Result};
use crate::patch_format::{Hunk, PatchScript};
use crate::text_diff::split_lines;

/// Lines compared at each end of a hunk's old side before it is applied.
pub const CONTEXT_CHECK_LINES: usize = 3;

/// Reconstruct the new content from `base` and a patch script.
///
/// Hunks are applied in old-line order; each one must match the base
/// literally at its stated position. Nothing is returned unless every hunk
/// applies.
pub fn apply_patch(base: &[u8], script: &PatchScript) -> Result<Vec<u8>> {
    let lines = split_lines(base);

    let mut ordered: Vec<&Hunk> = script.hunks().iter().collect();
    ordered.sort_by_key(|h| h.old_start);

    let mut result = Vec::with_capacity(base.len());
    let mut cursor = 0usize;

    for hunk in ordered {
        let start = hunk.old_index();
        let end = start + hunk.old_count;
        if start < cursor {
            return Err(mismatch(hunk, format!("overlaps the previous hunk ending at line {cursor}")));
        }
        if end > lines.len() {
            return Err(mismatch(
                hunk,
                format!("extends past the end of the base ({} lines)", lines.len()),
            ));
        }

        if let Some(line) = hunk.unknown_line() {
            return Err(mismatch(
                hunk,
                format!("unrecognized body line {:?}", String::from_utf8_lossy(line)),
            ));
        }

        for line in &lines[cursor..start] {
            result.extend_from_slice(line);
        }
        check_context(hunk, &lines[start..end])?;
        result.extend_from_slice(&hunk.result_lines());
        cursor = end;
    }

    for line in &lines[cursor..] {
        result.extend_from_slice(line);
    }

    Ok(result)
}

/// Compare the first and last few old-side lines of `hunk` with `actual`.
fn check_context(hunk: &Hunk, actual: &[&[u8]]) -> Result<()> {
    let expected = hunk.old_lines();
    if expected.len() != actual.len() {
        return Err(mismatch(
            hunk,
            format!("body has {} old lines, header declares {}", expected.len(), actual.len()),
        ));
    }

    let n = expected.len();
    let k = CONTEXT_CHECK_LINES.min(n);
    let first_line = hunk.old_index() + 1;
    for i in (0..k).chain(n - k..n) {
        if expected[i] != actual[i] {
            return Err(mismatch(
                hunk,
                format!(
                    "line {} is {:?}, expected {:?}",
                    first_line + i,
                    String::from_utf8_lossy(actual[i]),
                    String::from_utf8_lossy(expected[i])
                ),
            ));
        }
    }
    Ok(())
}

fn mismatch(hunk: &Hunk, reason: String) -> DiffError {
    DiffError::ContextMismatch {
        hunk: hunk.header(),
        reason,
    }
}

impl PatchScript {
    pub fn apply(&self, base: &[u8]) -> Result<Vec<u8>> {
        apply_patch(base, self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::text_diff::TextDiff;

    fn round_trip(old: &[u8], new: &[u8], context: usize) {
        let diff = TextDiff::new(old, new);
        let bytes = PatchScript::from_diff(&diff, context).to_bytes();
        let script = PatchScript::parse(&bytes).unwrap();
        let result = apply_patch(old, &script).unwrap();
        assert_eq!(result, new, "patch:\n{}", String::from_utf8_lossy(&bytes));
    }

    #[test]
    fn test_apply_example_hunk() {
        let script = PatchScript::parse(b"@@ -2,1 +2,1 @@\n-B\n+X\n").unwrap();
        let result = apply_patch(b"A\nB\nC\nD\nE\n", &script).unwrap();
        assert_eq!(result, b"A\nX\nC\nD\nE\n");
    }

    #[test]
    fn test_round_trips() {
        for context in [0, 1, 3] {
            round_trip(b"A\nB\nC\nD\nE\n", b"A\nX\nC\nD\nE\n", context);
            round_trip(b"", b"brand\nnew\n", context);
            round_trip(b"going\naway\n", b"", context);
            round_trip(b"a\nb", b"a\nb\n", context);
            round_trip(b"a\nb\n", b"a\nc", context);
            round_trip(b"1\n2\n3\n4\n5\n6\n7\n8\n9\n", b"0\n1\n2\n4\n5\n6\n7\nx\n9\n10\n", context);
            round_trip(b"\xff\xfe\r\nbin\x01ary\n", b"\xff\xfe\r\nbin\x02ary\n", context);
        }
    }

    #[test]
    fn test_no_op_patch_returns_base() {
        let base = b"same\ncontent\n";
        let diff = TextDiff::new(base, base);
        let script = PatchScript::from_diff(&diff, 3);
        assert!(script.is_empty());
        assert_eq!(apply_patch(base, &script).unwrap(), base);
    }

    #[test]
    fn test_reordered_hunks_apply_in_line_order() {
        let old = b"1\n2\n3\n4\n5\n6\n7\n8\n9\n10\n";
        let new = b"1\nX\n3\n4\n5\n6\n7\n8\nY\n10\n";
        let diff = TextDiff::new(old, new);
        let mut hunks = PatchScript::from_diff(&diff, 0).hunks().to_vec();
        assert_eq!(hunks.len(), 2);
        hunks.reverse();
        let reordered = PatchScript::from_hunks(hunks);
        assert_eq!(apply_patch(old, &reordered).unwrap(), new);
    }

    #[test]
    fn test_context_mismatch_rejected() {
        let script = PatchScript::parse(b"@@ -2,3 +2,3 @@\n b\n-c\n+C\n d\n").unwrap();
        let err = apply_patch(b"a\nb\nzzz\nd\ne\n", &script).unwrap_err();
        match err {
            DiffError::ContextMismatch { hunk, reason } => {
                assert_eq!(hunk, "@@ -2,3 +2,3 @@");
                assert!(reason.contains("line 3"), "{reason}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_hunk_past_end_rejected() {
        let script = PatchScript::parse(b"@@ -5,2 +5,2 @@\n-x\n-y\n+z\n+w\n").unwrap();
        assert!(matches!(
            apply_patch(b"a\nb\n", &script),
            Err(DiffError::ContextMismatch { .. })
        ));
    }

    #[test]
    fn test_overlapping_hunks_rejected() {
        let first = Hunk::new(1, 2, 1, 2, b"-a\n-b\n+A\n+B\n".to_vec());
        let second = Hunk::new(2, 1, 2, 1, b"-b\n+Q\n".to_vec());
        let script = PatchScript::from_hunks(vec![first, second]);
        let err = apply_patch(b"a\nb\nc\n", &script).unwrap_err();
        assert!(err.to_string().contains("overlaps"));
    }

    #[test]
    fn test_not_safe_to_reapply() {
        let old = b"a\nb\nc\n";
        let new = b"a\nb\nb2\nc\n";
        let diff = TextDiff::new(old, new);
        let script = PatchScript::from_diff(&diff, 1);
        let once = apply_patch(old, &script).unwrap();
        assert_eq!(once, new);
        // context no longer lines up on the patched output
        let again = apply_patch(&once, &script);
        assert!(again.is_err() || again.unwrap() != new.to_vec());
    }

    #[test]
    fn test_unrecognized_body_line_is_rejected() {
        let hunk = Hunk::new(2, 1, 2, 2, b"-B\n+X\n?stray\n".to_vec());
        let script = PatchScript::from_hunks(vec![hunk]);
        match apply_patch(b"A\nB\nC\n", &script) {
            Err(DiffError::ContextMismatch { reason, .. }) => assert!(reason.contains("?stray")),
            other => panic!("expected a context mismatch, got {other:?}"),
        }
    }
}
