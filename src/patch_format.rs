use std::sync::Arc;

use crate::error::{FormatError, Severity};
use crate::text_diff::{Edit, TextDiff};

pub const HUNK_PREFIX: &[u8] = b"@@ -";
pub const SIGNATURE_FOOTER: &[u8] = b"-- \n";
pub const NO_NEWLINE_MARKER: &[u8] = b"\\ No newline at end of file\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    Context,
    Added,
    Removed,
}

/// A body line with its prefix stripped. `text` keeps the trailing `\n`
/// unless the line was followed by a no-newline marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HunkLine<'a> {
    pub kind: LineKind,
    pub text: &'a [u8],
}

/// One contiguous change region of a patch script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    pub old_start: usize,
    pub old_count: usize,
    pub new_start: usize,
    pub new_count: usize,
    /// Raw body bytes: prefixed lines and no-newline markers.
    pub body: Vec<u8>,
}

impl Hunk {
    pub fn new(old_start: usize, old_count: usize, new_start: usize, new_count: usize, body: Vec<u8>) -> Self {
        Self {
            old_start,
            old_count,
            new_start,
            new_count,
            body,
        }
    }

    pub fn header(&self) -> String {
        format!(
            "@@ -{},{} +{},{} @@",
            self.old_start, self.old_count, self.new_start, self.new_count
        )
    }

    /// 0-based index of the first base line this hunk replaces. An empty old
    /// side names the line it inserts after.
    pub fn old_index(&self) -> usize {
        if self.old_count == 0 {
            self.old_start
        } else {
            self.old_start.saturating_sub(1)
        }
    }

    /// The first body line that is not a context, added, removed or
    /// no-newline line. [`Hunk::lines`] skips such lines.
    pub fn unknown_line(&self) -> Option<&[u8]> {
        self.body
            .split_inclusive(|&b| b == b'\n')
            .find(|raw| !matches!(raw[0], b' ' | b'+' | b'-' | b'\n' | b'\\'))
    }

    pub fn lines(&self) -> Vec<HunkLine<'_>> {
        let mut lines: Vec<HunkLine<'_>> = Vec::new();
        for raw in self.body.split_inclusive(|&b| b == b'\n') {
            let kind = match raw[0] {
                b' ' => LineKind::Context,
                b'+' => LineKind::Added,
                b'-' => LineKind::Removed,
                b'\n' => {
                    lines.push(HunkLine {
                        kind: LineKind::Context,
                        text: raw,
                    });
                    continue;
                }
                b'\\' => {
                    if let Some(prev) = lines.last_mut() {
                        let text: &[u8] = prev.text;
                        if let Some(stripped) = text.strip_suffix(b"\n") {
                            prev.text = stripped;
                        }
                    }
                    continue;
                }
                _ => continue,
            };
            lines.push(HunkLine {
                kind,
                text: &raw[1..],
            });
        }
        lines
    }

    /// Context and removed lines: what the base must contain.
    pub fn old_lines(&self) -> Vec<&[u8]> {
        self.lines()
            .into_iter()
            .filter(|l| l.kind != LineKind::Added)
            .map(|l| l.text)
            .collect()
    }

    /// Context and added lines, concatenated: what replaces the old lines.
    pub fn result_lines(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.body.len());
        for line in self.lines() {
            if line.kind != LineKind::Removed {
                out.extend_from_slice(line.text);
            }
        }
        out
    }
}

/// An ordered list of hunks, parsed from or serialized to the text grammar.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchScript {
    hunks: Vec<Hunk>,
    signature: bool,
    warnings: Vec<String>,
}

impl PatchScript {
    /// Build a script from hunks in the given order.
    pub fn from_hunks(hunks: Vec<Hunk>) -> Self {
        Self {
            hunks,
            ..Self::default()
        }
    }

    pub fn hunks(&self) -> &[Hunk] {
        &self.hunks
    }

    pub fn is_empty(&self) -> bool {
        self.hunks.is_empty()
    }

    pub fn has_signature(&self) -> bool {
        self.signature
    }

    /// Rendered `Warning` level problems tolerated during parsing.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Build the script turning the old side of `diff` into the new side,
    /// with up to `context` unchanged lines around every change.
    pub fn from_diff(diff: &TextDiff<'_>, context: usize) -> Self {
        let hunks = diff
            .grouped_edits(context)
            .iter()
            .map(|group| build_hunk(diff, group, context))
            .collect();
        Self::from_hunks(hunks)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for hunk in &self.hunks {
            out.extend_from_slice(hunk.header().as_bytes());
            out.push(b'\n');
            out.extend_from_slice(&hunk.body);
        }
        if self.signature {
            out.extend_from_slice(SIGNATURE_FOOTER);
        }
        out
    }

    /// Parse every hunk in `buf`. Lines outside hunks are skipped as noise;
    /// a `-- ` footer line ends the script.
    pub fn parse(buf: &[u8]) -> Result<Self, FormatError> {
        let shared: Arc<[u8]> = Arc::from(buf);
        let end = buf.len();
        let mut script = PatchScript::default();
        let mut c = 0;

        while c < end {
            if buf[c..].starts_with(HUNK_PREFIX) {
                let header = parse_header(buf, c).ok_or_else(|| {
                    FormatError::new(&shared, c, Severity::Error, "malformed hunk header")
                })?;
                let (hunk, next) = parse_body(&shared, header, &mut script.warnings)?;
                script.hunks.push(hunk);
                c = next;
                if c < end && !matches!(buf[c], b'@' | b'-' | b'd' | b'\n') {
                    return Err(FormatError::new(
                        &shared,
                        c,
                        Severity::Error,
                        "unexpected hunk trailer",
                    ));
                }
                continue;
            }
            if buf[c..].starts_with(SIGNATURE_FOOTER) {
                script.signature = true;
                break;
            }
            c = next_line(buf, c);
        }

        script.hunks.sort_by_key(|h| h.old_start);
        Ok(script)
    }
}

struct HunkHeader {
    old_start: usize,
    old_count: usize,
    new_start: usize,
    new_count: usize,
    body_start: usize,
}

fn next_line(buf: &[u8], pos: usize) -> usize {
    buf[pos..]
        .iter()
        .position(|&b| b == b'\n')
        .map_or(buf.len(), |p| pos + p + 1)
}

fn parse_number(buf: &[u8], pos: &mut usize) -> Option<usize> {
    let start = *pos;
    while *pos < buf.len() && buf[*pos].is_ascii_digit() {
        *pos += 1;
    }
    std::str::from_utf8(&buf[start..*pos]).ok()?.parse().ok()
}

/// `<start>[,<count>]`; the count defaults to 1.
fn parse_range(buf: &[u8], pos: &mut usize) -> Option<(usize, usize)> {
    let start = parse_number(buf, pos)?;
    if buf.get(*pos) == Some(&b',') {
        *pos += 1;
        let count = parse_number(buf, pos)?;
        Some((start, count))
    } else {
        Some((start, 1))
    }
}

fn expect(buf: &[u8], pos: &mut usize, token: &[u8]) -> Option<()> {
    if buf[*pos..].starts_with(token) {
        *pos += token.len();
        Some(())
    } else {
        None
    }
}

fn parse_header(buf: &[u8], at: usize) -> Option<HunkHeader> {
    let mut pos = at + HUNK_PREFIX.len();
    let (old_start, old_count) = parse_range(buf, &mut pos)?;
    expect(buf, &mut pos, b" +")?;
    let (new_start, new_count) = parse_range(buf, &mut pos)?;
    expect(buf, &mut pos, b" @@")?;
    Some(HunkHeader {
        old_start,
        old_count,
        new_start,
        new_count,
        body_start: next_line(buf, pos),
    })
}

/// Read body lines until the header counts are satisfied.
fn parse_body(
    buf: &Arc<[u8]>,
    header: HunkHeader,
    warnings: &mut Vec<String>,
) -> Result<(Hunk, usize), FormatError> {
    let end = buf.len();
    let mut old_seen = 0;
    let mut new_seen = 0;
    let mut p = header.body_start;

    while old_seen < header.old_count || new_seen < header.new_count {
        if p >= end {
            return Err(FormatError::new(
                buf,
                p,
                Severity::Error,
                format!(
                    "truncated hunk: {} old and {} new lines missing",
                    header.old_count - old_seen.min(header.old_count),
                    header.new_count - new_seen.min(header.new_count)
                ),
            ));
        }
        match buf[p] {
            b' ' => {
                old_seen += 1;
                new_seen += 1;
            }
            b'-' => old_seen += 1,
            b'+' => new_seen += 1,
            b'\\' => {}
            b'\n' => {
                warnings.push(
                    FormatError::new(buf, p, Severity::Warning, "empty line treated as context").to_string(),
                );
                old_seen += 1;
                new_seen += 1;
            }
            _ => {
                return Err(FormatError::new(
                    buf,
                    p,
                    Severity::Error,
                    "unexpected line in hunk body",
                ))
            }
        }
        p = next_line(buf, p);
    }

    // A no-newline marker may follow the final body line.
    if p < end && buf[p] == b'\\' {
        p = next_line(buf, p);
    }

    if old_seen != header.old_count || new_seen != header.new_count {
        return Err(FormatError::new(
            buf,
            header.body_start,
            Severity::Error,
            format!(
                "hunk body has {old_seen} old and {new_seen} new lines, header declares {} and {}",
                header.old_count, header.new_count
            ),
        ));
    }

    let hunk = Hunk::new(
        header.old_start,
        header.old_count,
        header.new_start,
        header.new_count,
        buf[header.body_start..p].to_vec(),
    );
    Ok((hunk, p))
}

fn write_line(body: &mut Vec<u8>, prefix: u8, line: &[u8]) {
    body.push(prefix);
    body.extend_from_slice(line);
    if !line.ends_with(b"\n") {
        body.push(b'\n');
        body.extend_from_slice(NO_NEWLINE_MARKER);
    }
}

fn build_hunk(diff: &TextDiff<'_>, group: &[Edit], context: usize) -> Hunk {
    let old = diff.old_lines();
    let new = diff.new_lines();
    let first = &group[0];
    let last = &group[group.len() - 1];

    let old_lo = first.old.start.saturating_sub(context);
    let new_lo = first.new.start - (first.old.start - old_lo);
    let old_hi = (last.old.end + context).min(old.len());
    let new_hi = last.new.end + (old_hi - last.old.end);

    let mut body = Vec::new();
    let mut cursor = old_lo;
    for edit in group {
        for line in &old[cursor..edit.old.start] {
            write_line(&mut body, b' ', line);
        }
        for line in &old[edit.old.clone()] {
            write_line(&mut body, b'-', line);
        }
        for line in &new[edit.new.clone()] {
            write_line(&mut body, b'+', line);
        }
        cursor = edit.old.end;
    }
    for line in &old[cursor..old_hi] {
        write_line(&mut body, b' ', line);
    }

    let old_count = old_hi - old_lo;
    let new_count = new_hi - new_lo;
    Hunk::new(
        if old_count == 0 { old_lo } else { old_lo + 1 },
        old_count,
        if new_count == 0 { new_lo } else { new_lo + 1 },
        new_count,
        body,
    )
}
