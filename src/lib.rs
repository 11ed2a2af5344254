//! A parser and fuzz-tolerant applier for classic patch formats.
//!
//! `fuzzpatch` reads pre-existing diff text in the classic dialects, unified
//! (`---`/`+++`/`@@`), context (`***`/`---`), and the multi-project
//! "workspace patch" wrapper, and applies the recovered changes to target
//! content. Unlike a strict `patch(1)` run, hunks whose surrounding context
//! has drifted can still land: a configurable integer *fuzz* factor forgives
//! that many mismatched context lines at the edges of each hunk, the same
//! tolerance model `patch -F` uses.
//!
//! The engine itself performs no I/O beyond reading an already-opened stream:
//! parsing produces an in-memory [`PatchSet`], and application turns one
//! [`FilePatch`] plus caller-supplied content into a [`FileDiffResult`]
//! holding before/after line sequences, per-hunk outcomes, and rejects. A
//! thin filesystem layer ([`apply_patch_set`]) is provided for CLI use.
//!
//! ## Getting started
//!
//! Parse a unified diff and apply it to in-memory content:
//!
//! ```rust
//! use fuzzpatch::{parse_patch, FileDiffResult, PatchConfig};
//!
//! let set = parse_patch(concat!(
//!     "--- a/greeting.txt\n",
//!     "+++ b/greeting.txt\n",
//!     "@@ -1,3 +1,3 @@\n",
//!     " hello\n",
//!     "-world\n",
//!     "+there\n",
//!     " goodbye\n",
//! ));
//! assert_eq!(set.diffs.len(), 1);
//!
//! let config = PatchConfig::default();
//! let mut result = FileDiffResult::new(&set.diffs[0], &config);
//! result.refresh(Some("hello\nworld\ngoodbye\n"));
//!
//! assert!(result.has_matches());
//! assert!(!result.has_problems());
//! assert_eq!(result.patched_content(), "hello\nthere\ngoodbye\n");
//! ```
//!
//! ## Fuzz
//!
//! When the target has drifted, raise the fuzz ceiling and the engine finds
//! the smallest fuzz each hunk needs:
//!
//! ```rust
//! use fuzzpatch::{parse_patch, FileDiffResult, PatchConfig};
//!
//! let set = parse_patch(concat!(
//!     "--- a/f.txt\n",
//!     "+++ b/f.txt\n",
//!     "@@ -1,3 +1,3 @@\n",
//!     " first\n",
//!     "-second\n",
//!     "+SECOND\n",
//!     " third\n",
//! ));
//! let config = PatchConfig::builder().fuzz(2).build();
//! let mut result = FileDiffResult::new(&set.diffs[0], &config);
//! // The leading context line says "first" but the file says "1st".
//! result.refresh(Some("1st\nsecond\nthird\n"));
//!
//! assert!(result.has_matches());
//! assert_eq!(result.max_fuzz(), 1);
//! assert_eq!(result.patched_content(), "1st\nSECOND\nthird\n");
//! ```
//!
//! ## Key concepts
//!
//! - [`PatchSet`]: everything one parse produced, an ordered list of
//!   [`FilePatch`] values plus [`DiffProject`] groups for workspace patches.
//! - [`FilePatch`]: all hunks that apply to one logical file path.
//! - [`Hunk`]: one contiguous change region with interleaved
//!   [`HunkLine::Context`]/[`HunkLine::Added`]/[`HunkLine::Removed`] lines.
//! - [`FileDiffResult`]: a per-attempt application result, rebuilt from
//!   scratch by [`FileDiffResult::refresh`]; inspect it rather than catching
//!   errors, since a hunk that fails to match is data, not a fault.
//!
//! Lines everywhere keep their original terminator bytes (LF, CR, CRLF, or
//! none), so unchanged content survives application byte-for-byte, including
//! a missing terminator on the last line.
//!
//! ## Feature flags
//!
//! - `parallel` (default): batch application across files uses
//!   [`rayon`](https://crates.io/crates/rayon). Single-file application is
//!   always synchronous and single-threaded.

use chrono::NaiveDateTime;
use encoding_rs::Encoding;
use log::{debug, info, trace, warn};
#[cfg(feature = "parallel")]
use rayon::prelude::*;
use std::fmt;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

// --- Error Types ---

/// Hard errors from the filesystem application layer.
///
/// Parsing and in-memory application never produce these: malformed patch
/// text yields a best-effort partial [`PatchSet`], and a hunk that fails to
/// match is recorded on the [`FileDiffResult`]. `PatchError` only covers the
/// truly exceptional conditions around reading and writing real files.
#[derive(Error, Debug)]
pub enum PatchError {
    /// The patch attempted to reach a path outside the target directory
    /// (e.g. `--- a/../../etc/passwd`).
    #[error("Path '{0}' resolves outside the target directory. Aborting for security.")]
    PathTraversal(PathBuf),
    /// Neither side of the file diff names a usable path.
    #[error("Patch does not name a target file")]
    NoTargetPath,
    /// The target path exists but is a directory, not a file.
    #[error("Target path is a directory, not a file: {path:?}")]
    TargetIsDirectory { path: PathBuf },
    /// The user does not have permission to read or write the path.
    #[error("Permission denied for path: {path:?}")]
    PermissionDenied { path: PathBuf },
    /// An I/O error occurred while reading or writing a file.
    #[error("I/O error while processing {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Converts a `std::io::Error` into a more specific `PatchError`.
fn map_io_error(path: PathBuf, e: io::Error) -> PatchError {
    match e.kind() {
        io::ErrorKind::PermissionDenied => PatchError::PermissionDenied { path },
        _ => PatchError::Io { path, source: e },
    }
}

// --- Line Reading ---

/// The separator used when a join is asked to normalize line endings.
#[cfg(windows)]
const PLATFORM_SEPARATOR: &str = "\r\n";
#[cfg(not(windows))]
const PLATFORM_SEPARATOR: &str = "\n";

/// Splits a character stream into lines that keep their terminator bytes.
///
/// A line ends at LF, CR, or CR+LF, and the terminator stays part of the
/// line, so concatenating the result reproduces the input exactly. A final
/// line without a terminator is kept without one; an empty source yields no
/// lines at all.
///
/// By default a bare CR (not followed by LF) terminates a line. With
/// [`ignore_single_cr`](LineReader::ignore_single_cr) it is kept as ordinary
/// content instead, matching sources where lone CR is not a line ending.
///
/// # Example
///
/// ```rust
/// use fuzzpatch::LineReader;
///
/// let lines = LineReader::new("a\r\nb\nc".as_bytes()).read_lines().unwrap();
/// assert_eq!(lines, vec!["a\r\n", "b\n", "c"]);
/// ```
#[derive(Debug)]
pub struct LineReader<R> {
    reader: R,
    ignore_single_cr: bool,
}

impl<R: Read> LineReader<R> {
    /// Creates a reader over an already-opened character source.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            ignore_single_cr: false,
        }
    }

    /// Treat a bare CR that is not followed by LF as line content rather
    /// than a terminator.
    pub fn ignore_single_cr(mut self, ignore: bool) -> Self {
        self.ignore_single_cr = ignore;
        self
    }

    /// Reads the source to exhaustion and returns its lines.
    ///
    /// The only failure mode is a stream read error; it propagates as-is so
    /// the caller can tell "could not read" apart from "read but rejected".
    pub fn read_lines(mut self) -> io::Result<Vec<String>> {
        let mut buf = String::new();
        self.reader.read_to_string(&mut buf)?;
        Ok(split_lines(&buf, self.ignore_single_cr))
    }
}

fn split_lines(text: &str, ignore_single_cr: bool) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\n' => {
                current.push('\n');
                lines.push(std::mem::take(&mut current));
            }
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                    current.push_str("\r\n");
                    lines.push(std::mem::take(&mut current));
                } else if ignore_single_cr {
                    current.push('\r');
                } else {
                    current.push('\r');
                    lines.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

/// Returns the line without its terminator, if any.
///
/// ```rust
/// assert_eq!(fuzzpatch::line_content("abc\r\n"), "abc");
/// assert_eq!(fuzzpatch::line_content("abc"), "abc");
/// ```
pub fn line_content(line: &str) -> &str {
    if let Some(s) = line.strip_suffix("\r\n") {
        return s;
    }
    if let Some(s) = line.strip_suffix('\n') {
        return s;
    }
    if let Some(s) = line.strip_suffix('\r') {
        return s;
    }
    line
}

/// Length of a line in bytes, excluding its terminator.
pub fn line_content_len(line: &str) -> usize {
    line_content(line).len()
}

/// The terminator bytes of a line (`""`, `"\n"`, `"\r"`, or `"\r\n"`).
pub fn terminator_of(line: &str) -> &str {
    &line[line_content(line).len()..]
}

/// Joins a line sequence back into a single string.
///
/// With `preserve_terminators` the result is byte-identical to the original
/// stream the lines came from. Without it, every terminator that was present
/// is replaced by the platform separator; a final line that had no terminator
/// still gets none.
pub fn concatenate_lines(lines: &[String], preserve_terminators: bool) -> String {
    if preserve_terminators {
        return lines.concat();
    }
    let mut buf = String::new();
    for line in lines {
        let content = line_content(line);
        buf.push_str(content);
        if content.len() < line.len() {
            buf.push_str(PLATFORM_SEPARATOR);
        }
    }
    buf
}

// --- Data Model ---

/// One tagged line of a hunk. The text keeps its original terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HunkLine {
    /// Unchanged line that must be present in the target.
    Context(String),
    /// Line introduced by the patch.
    Added(String),
    /// Line the patch removes from the target.
    Removed(String),
}

impl HunkLine {
    /// The line text, terminator included.
    pub fn text(&self) -> &str {
        match self {
            HunkLine::Context(t) | HunkLine::Added(t) | HunkLine::Removed(t) => t,
        }
    }

    /// Drops the trailing terminator, used by the
    /// `\ No newline at end of file` marker.
    fn strip_terminator(&mut self) {
        let (HunkLine::Context(t) | HunkLine::Added(t) | HunkLine::Removed(t)) = self;
        let len = line_content(t).len();
        t.truncate(len);
    }

    fn prefix(&self) -> char {
        match self {
            HunkLine::Context(_) => ' ',
            HunkLine::Added(_) => '+',
            HunkLine::Removed(_) => '-',
        }
    }

    /// Swaps added and removed, leaving context untouched.
    fn reversed(&self) -> HunkLine {
        match self {
            HunkLine::Context(t) => HunkLine::Context(t.clone()),
            HunkLine::Added(t) => HunkLine::Removed(t.clone()),
            HunkLine::Removed(t) => HunkLine::Added(t.clone()),
        }
    }
}

/// Classification of a single hunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HunkKind {
    /// Only added lines, no context.
    Added,
    /// Only removed lines, no context.
    Removed,
    /// Any context line, or a mix of added and removed.
    Changed,
}

/// File-level classification of a [`FilePatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffKind {
    /// The file is created by the patch.
    Addition,
    /// The file is removed by the patch.
    Deletion,
    /// The file is modified in place.
    Change,
}

/// One contiguous change region within a file diff.
///
/// Starts are stored 0-based; the unified header's 1-based numbers are
/// converted during parsing. `old_length`/`new_length` are the declared
/// range lengths from the header, kept for display; matching itself walks
/// the tagged lines and never trusts the declared lengths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    /// 0-based start of the old-side range.
    pub old_start: usize,
    /// Declared length of the old-side range.
    pub old_length: usize,
    /// 0-based start of the new-side range.
    pub new_start: usize,
    /// Declared length of the new-side range.
    pub new_length: usize,
    /// Interleaved context/added/removed lines, in order.
    pub lines: Vec<HunkLine>,
}

impl Hunk {
    /// Classifies the hunk. Reversal swaps `Added` and `Removed`.
    pub fn kind(&self, reversed: bool) -> HunkKind {
        let mut has_context = false;
        let mut has_added = false;
        let mut has_removed = false;
        for line in &self.lines {
            match line {
                HunkLine::Context(_) => has_context = true,
                HunkLine::Added(_) => has_added = true,
                HunkLine::Removed(_) => has_removed = true,
            }
        }
        let base = if has_context || (has_added && has_removed) {
            HunkKind::Changed
        } else if has_added {
            HunkKind::Added
        } else if has_removed {
            HunkKind::Removed
        } else {
            HunkKind::Changed
        };
        match (base, reversed) {
            (HunkKind::Added, true) => HunkKind::Removed,
            (HunkKind::Removed, true) => HunkKind::Added,
            (k, _) => k,
        }
    }

    /// The declared start position in whichever half application reads from.
    pub fn start(&self, reversed: bool) -> usize {
        if reversed {
            self.new_start
        } else {
            self.old_start
        }
    }

    /// Net line-count change this hunk introduces when applied: added minus
    /// removed, sign flipped under reversal. Added to the running shift for
    /// the next hunk of the same file.
    pub fn delta(&self, reversed: bool) -> isize {
        let mut added = 0isize;
        let mut removed = 0isize;
        for line in &self.lines {
            match line {
                HunkLine::Added(_) => added += 1,
                HunkLine::Removed(_) => removed += 1,
                HunkLine::Context(_) => {}
            }
        }
        if reversed {
            removed - added
        } else {
            added - removed
        }
    }

    /// Creates the inverse hunk: additions become removals and vice versa,
    /// and the old and new ranges swap.
    pub fn reversed(&self) -> Hunk {
        Hunk {
            old_start: self.new_start,
            old_length: self.new_length,
            new_start: self.old_start,
            new_length: self.old_length,
            lines: self.lines.iter().map(HunkLine::reversed).collect(),
        }
    }

    /// The `@@ -old,len +new,len @@` header in unified display form.
    pub fn unified_header(&self) -> String {
        fn display_start(start: usize, length: usize) -> usize {
            // Unified convention: a zero-length range displays the line
            // before the gap, which is the stored 0-based start itself.
            if length == 0 {
                start
            } else {
                start + 1
            }
        }
        format!(
            "@@ -{},{} +{},{} @@",
            display_start(self.old_start, self.old_length),
            self.old_length,
            display_start(self.new_start, self.new_length),
            self.new_length,
        )
    }

    /// Checks whether the hunk would apply at its declared position plus
    /// `shift`, tolerating up to `fuzz` mismatched context lines at each
    /// edge. Read-only.
    pub fn try_match(
        &self,
        lines: &[String],
        shift: isize,
        fuzz: u32,
        config: &PatchConfig,
    ) -> bool {
        self.walk(Target::DryRun(lines), shift, fuzz, config)
    }

    /// Applies the hunk in place and returns its [`delta`](Hunk::delta).
    ///
    /// Callers must have verified feasibility with
    /// [`try_match`](Hunk::try_match) first: apply performs no equality
    /// checks of its own, only bounds assertions.
    pub fn apply(&self, lines: &mut Vec<String>, shift: isize, config: &PatchConfig) -> isize {
        let ok = self.walk(Target::Commit(lines), shift, 0, config);
        debug_assert!(ok);
        self.delta(config.reversed)
    }

    /// The shared try/apply traversal. `Target::DryRun` verifies without
    /// mutating; `Target::Commit` mutates without verifying. Keeping both
    /// modes in one walk guarantees they cannot diverge.
    fn walk(&self, mut target: Target<'_>, shift: isize, fuzz: u32, config: &PatchConfig) -> bool {
        let fuzz = fuzz as usize;
        let commit = matches!(target, Target::Commit(_));
        let mut pos = self.start(config.reversed) as isize + shift;

        // The most recent contiguous run of context lines, and whether every
        // line of that run matched the target.
        let mut run: Vec<&str> = Vec::new();
        let mut run_matched = true;
        let mut boundary_checked = false;

        enum Step<'a> {
            Context(&'a str),
            Add(&'a str),
            Remove(&'a str),
        }
        for line in &self.lines {
            let step = match (line, config.reversed) {
                (HunkLine::Context(t), _) => Step::Context(t),
                (HunkLine::Added(t), false) | (HunkLine::Removed(t), true) => Step::Add(t),
                (HunkLine::Removed(t), false) | (HunkLine::Added(t), true) => Step::Remove(t),
            };
            match step {
                Step::Context(text) => {
                    if !commit {
                        // A context position outside the target (the file
                        // lost lines at its boundary) is an ordinary
                        // mismatch; the edge leniency may still forgive it.
                        let in_bounds = pos >= 0 && (pos as usize) < target.lines().len();
                        if !in_bounds || !lines_match(config, text, &target.lines()[pos as usize])
                        {
                            if fuzz == 0 {
                                return false;
                            }
                            run_matched = false;
                        }
                        run.push(text);
                    }
                    pos += 1;
                }
                Step::Remove(text) => {
                    if commit {
                        target.remove(pos as usize);
                        // No advance: removal shifts later content left.
                    } else {
                        if !check_run_boundary(
                            config,
                            target.lines(),
                            &mut run,
                            &mut run_matched,
                            &mut boundary_checked,
                            fuzz,
                            pos,
                        ) {
                            return false;
                        }
                        if pos < 0 || pos as usize >= target.lines().len() {
                            return false;
                        }
                        if !lines_match(config, text, &target.lines()[pos as usize]) {
                            return false;
                        }
                        pos += 1;
                    }
                }
                Step::Add(text) => {
                    if commit {
                        let idx = (pos.max(0) as usize).min(target.lines().len());
                        let adapted = adapt_line_ending(text, target.lines());
                        target.insert(idx, adapted);
                        pos += 1;
                    } else if !check_run_boundary(
                        config,
                        target.lines(),
                        &mut run,
                        &mut run_matched,
                        &mut boundary_checked,
                        fuzz,
                        pos,
                    ) {
                        return false;
                    }
                }
            }
        }

        // Trailing leniency: forgive the newest `fuzz` lines of an unmatched
        // trailing context run, the rest must still match.
        if !commit && !run_matched && !run.is_empty() {
            let verify = run.len().saturating_sub(fuzz);
            for (i, text) in run.iter().enumerate().take(verify) {
                let idx = pos - run.len() as isize + i as isize;
                if idx < 0 || idx as usize >= target.lines().len() {
                    return false;
                }
                if !lines_match(config, text, &target.lines()[idx as usize]) {
                    return false;
                }
            }
        }
        true
    }
}

impl fmt::Display for Hunk {
    /// Renders the hunk in unified shape, as used for reject output.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.unified_header())?;
        for line in &self.lines {
            write!(f, "{}{}", line.prefix(), line.text())?;
            if terminator_of(line.text()).is_empty() {
                writeln!(f)?;
            }
        }
        Ok(())
    }
}

/// Dry-run/commit parameterization of the hunk walk.
enum Target<'t> {
    DryRun(&'t [String]),
    Commit(&'t mut Vec<String>),
}

impl Target<'_> {
    fn lines(&self) -> &[String] {
        match self {
            Target::DryRun(l) => l,
            Target::Commit(v) => v,
        }
    }

    fn remove(&mut self, idx: usize) {
        match self {
            Target::Commit(v) => {
                assert!(
                    idx < v.len(),
                    "hunk removal walked past the target during apply"
                );
                v.remove(idx);
            }
            Target::DryRun(_) => unreachable!("dry-run walk never mutates"),
        }
    }

    fn insert(&mut self, idx: usize, line: String) {
        match self {
            Target::Commit(v) => v.insert(idx, line),
            Target::DryRun(_) => unreachable!("dry-run walk never mutates"),
        }
    }
}

/// Verifies the context run preceding the first non-context line of a hunk,
/// forgiving the oldest `fuzz` lines; once that boundary has been checked,
/// any later mid-hunk context run must have matched in full. Clears the run
/// either way.
fn check_run_boundary(
    config: &PatchConfig,
    lines: &[String],
    run: &mut Vec<&str>,
    run_matched: &mut bool,
    boundary_checked: &mut bool,
    fuzz: usize,
    pos: isize,
) -> bool {
    let ok = if *boundary_checked {
        *run_matched || run.is_empty()
    } else {
        *boundary_checked = true;
        if !*run_matched && !run.is_empty() {
            let mut all_ok = true;
            for (i, text) in run.iter().enumerate().skip(fuzz) {
                let idx = pos - run.len() as isize + i as isize;
                if idx < 0
                    || idx as usize >= lines.len()
                    || !lines_match(config, text, &lines[idx as usize])
                {
                    all_ok = false;
                    break;
                }
            }
            all_ok
        } else {
            true
        }
    };
    run.clear();
    *run_matched = true;
    ok
}

/// Picks a terminator for a line inserted into `target`: imitate the
/// target's own convention when it has one, otherwise keep the patch's. A
/// patch line that deliberately has no terminator (stripped by the
/// `\ No newline at end of file` marker) is inserted untouched.
fn adapt_line_ending(text: &str, target: &[String]) -> String {
    let own = terminator_of(text);
    if own.is_empty() {
        return text.to_string();
    }
    let sample = target
        .iter()
        .map(|l| terminator_of(l))
        .find(|t| !t.is_empty());
    match sample {
        Some(t) if t != own => format!("{}{}", line_content(text), t),
        _ => text.to_string(),
    }
}

/// All hunks that apply to one logical file path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePatch {
    /// Path on the old side; `None` when the header said `/dev/null`.
    pub old_path: Option<PathBuf>,
    /// Timestamp token from the `---` line, when one parsed.
    pub old_date: Option<NaiveDateTime>,
    /// Path on the new side; `None` when the header said `/dev/null`.
    pub new_path: Option<PathBuf>,
    /// Timestamp token from the `+++` line, when one parsed.
    pub new_date: Option<NaiveDateTime>,
    /// The hunks, in patch order.
    pub hunks: Vec<Hunk>,
    /// Free text that preceded this file's header lines in the patch.
    pub header: Option<String>,
}

impl FilePatch {
    /// File-level classification. Addition or deletion is only reported for
    /// a file with exactly one hunk of that pure kind; multiple hunks, or a
    /// single mixed hunk, always classify as a change.
    pub fn kind(&self, reversed: bool) -> DiffKind {
        if self.hunks.len() == 1 {
            match self.hunks[0].kind(reversed) {
                HunkKind::Added => return DiffKind::Addition,
                HunkKind::Removed => return DiffKind::Deletion,
                HunkKind::Changed => {}
            }
        }
        DiffKind::Change
    }

    /// The path the patch should be applied to, honoring reversal and
    /// falling back to the other side when the preferred one is `/dev/null`.
    pub fn path(&self, reversed: bool) -> Option<&Path> {
        if self.kind(reversed) == DiffKind::Addition {
            return if reversed {
                self.old_path.as_deref().or(self.new_path.as_deref())
            } else {
                self.new_path.as_deref().or(self.old_path.as_deref())
            };
        }
        if reversed {
            self.new_path.as_deref().or(self.old_path.as_deref())
        } else {
            self.old_path.as_deref().or(self.new_path.as_deref())
        }
    }

    /// The minimum path-segment count across the old and new paths, the cap
    /// for leading-segment stripping.
    pub fn segment_count(&self) -> usize {
        [&self.old_path, &self.new_path]
            .into_iter()
            .flatten()
            .map(|p| p.components().count())
            .min()
            .unwrap_or(0)
    }

    /// The target path with up to `strip` leading segments removed. Strip
    /// counts at or beyond the path's own segment count are ignored so a
    /// file name always remains.
    pub fn stripped_path(&self, strip: usize, reversed: bool) -> Option<PathBuf> {
        let path = self.path(reversed)?;
        let segments = path.components().count();
        if strip > 0 && strip < segments {
            Some(path.components().skip(strip).collect())
        } else {
            Some(path.to_path_buf())
        }
    }

    /// Creates the inverse file diff: paths and dates swap sides and every
    /// hunk is reversed.
    pub fn reversed(&self) -> FilePatch {
        FilePatch {
            old_path: self.new_path.clone(),
            old_date: self.new_date,
            new_path: self.old_path.clone(),
            new_date: self.old_date,
            hunks: self.hunks.iter().map(Hunk::reversed).collect(),
            header: self.header.clone(),
        }
    }
}

/// A named group of file diffs, only produced by the workspace dialect.
///
/// Holds indices into [`PatchSet::diffs`] rather than owning the diffs; each
/// diff belongs to at most one project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffProject {
    /// The project name from the `#P` marker (empty for the default group).
    pub name: String,
    /// Indices into the owning [`PatchSet`]'s `diffs` vector.
    pub diffs: Vec<usize>,
}

/// Everything one parse produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchSet {
    /// All file diffs, in input order.
    pub diffs: Vec<FilePatch>,
    /// Project groups; empty unless the input was a workspace patch.
    pub projects: Vec<DiffProject>,
    /// Whether the input opened with the workspace patch banner.
    pub is_workspace: bool,
    /// Whether a `diff --git` header was seen. Informational only; git
    /// patch bodies are ordinary unified hunks.
    pub is_git: bool,
}

impl PatchSet {
    /// File diffs with workspace project names folded into the paths.
    ///
    /// For a workspace patch, each diff's paths gain the owning project's
    /// name as a leading segment, making them usable without any external
    /// project-name resolution. For other dialects this is a plain copy.
    pub fn adjusted_diffs(&self) -> Vec<FilePatch> {
        if !self.is_workspace {
            return self.diffs.clone();
        }
        let mut owner: Vec<Option<&str>> = vec![None; self.diffs.len()];
        for project in &self.projects {
            for &idx in &project.diffs {
                if let Some(slot) = owner.get_mut(idx) {
                    *slot = Some(&project.name);
                }
            }
        }
        self.diffs
            .iter()
            .enumerate()
            .map(|(i, diff)| {
                let mut diff = diff.clone();
                if let Some(name) = owner[i].filter(|n| !n.is_empty()) {
                    diff.old_path = diff.old_path.map(|p| Path::new(name).join(p));
                    diff.new_path = diff.new_path.map(|p| Path::new(name).join(p));
                }
                diff
            })
            .collect()
    }
}

// --- Patch Parsing ---

/// First line of a multi-project workspace patch, as written by Eclipse's
/// Team > Create Patch wizard.
pub const WORKSPACE_PATCH_BANNER: &str = "### Eclipse Workspace Patch 1.0";

/// Marker selecting the current project inside a workspace patch.
const PROJECT_MARKER: &str = "#P ";

/// Timestamp formats tried, in order, against the date token of header
/// lines. GNU diff's default, ISO without zone, ctime, and the legacy
/// slash-separated form.
const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f %z",
    "%Y-%m-%d %H:%M:%S %z",
    "%Y-%m-%d %H:%M:%S%.f",
    "%a %b %e %H:%M:%S %Y",
    "%Y/%m/%d %H:%M:%S",
];

/// Parses patch text into a [`PatchSet`].
///
/// Parsing is best-effort and never fails: unrecognized or malformed lines
/// end the file block they appear in and rejoin the outer scan, so a partial
/// result is always produced.
///
/// ```rust
/// let set = fuzzpatch::parse_patch("--- /dev/null\n+++ b/new.txt\n@@ -0,0 +1 @@\n+hi\n");
/// assert_eq!(set.diffs.len(), 1);
/// assert!(set.diffs[0].old_path.is_none());
/// ```
pub fn parse_patch(content: &str) -> PatchSet {
    let lines = split_lines(content, false);
    PatchParser::new(&lines).parse()
}

/// Reads a character stream to exhaustion and parses it like
/// [`parse_patch`]. The only error is a stream read failure.
pub fn read_patch<R: Read>(reader: R) -> io::Result<PatchSet> {
    let lines = LineReader::new(reader).read_lines()?;
    Ok(PatchParser::new(&lines).parse())
}

struct PatchParser<'a> {
    lines: &'a [String],
    pos: usize,
    header: Vec<String>,
    fallback_name: Option<String>,
    current_project: Option<usize>,
    set: PatchSet,
}

impl<'a> PatchParser<'a> {
    fn new(lines: &'a [String]) -> Self {
        Self {
            lines,
            pos: 0,
            header: Vec::new(),
            fallback_name: None,
            current_project: None,
            set: PatchSet::default(),
        }
    }

    fn peek(&self) -> Option<&'a String> {
        self.lines.get(self.pos)
    }

    fn advance(&mut self) {
        self.pos += 1;
    }

    fn parse(mut self) -> PatchSet {
        let workspace = self
            .peek()
            .map(|l| line_content(l) == WORKSPACE_PATCH_BANNER)
            .unwrap_or(false);
        if workspace {
            debug!("workspace patch banner found, parsing per-project groups");
            self.parse_workspace();
        } else {
            self.parse_single();
        }
        debug!(
            "parsed {} file diff(s), {} project(s)",
            self.set.diffs.len(),
            self.set.projects.len()
        );
        self.set
    }

    /// The single-patch scan: unified and context file diffs interleaved
    /// with free text.
    fn parse_single(&mut self) {
        while let Some(line) = self.peek() {
            let content = line_content(line);
            if content.starts_with("--- ") {
                self.read_unified_diff();
            } else if content.starts_with("*** ") {
                self.read_context_diff();
            } else {
                self.scan_free_line(line);
                self.advance();
            }
        }
    }

    /// The workspace scan: `#P` project markers around unified diff blocks.
    fn parse_workspace(&mut self) {
        self.set.is_workspace = true;
        self.advance(); // the banner line
        while let Some(line) = self.peek() {
            let content = line_content(line);
            if let Some(name) = content.strip_prefix(PROJECT_MARKER) {
                let name = name.trim().to_string();
                trace!("entering project '{}'", name);
                self.current_project = Some(self.project_index(&name));
                self.advance();
            } else if content.starts_with("--- ") {
                let before = self.set.diffs.len();
                self.read_unified_diff();
                let project = match self.current_project {
                    Some(p) => p,
                    None => self.project_index(""),
                };
                self.current_project = Some(project);
                for idx in before..self.set.diffs.len() {
                    self.set.projects[project].diffs.push(idx);
                }
            } else {
                self.scan_free_line(line);
                self.advance();
            }
        }
    }

    /// Accumulates a non-header line as free text, picking out the
    /// `Index:` fallback filename and the git marker along the way.
    fn scan_free_line(&mut self, line: &'a String) {
        let content = line_content(line);
        if let Some(name) = content.strip_prefix("Index: ") {
            self.fallback_name = Some(name.trim().to_string());
        } else if content.starts_with("diff --git ") {
            self.set.is_git = true;
        }
        self.header.push(line.clone());
    }

    fn project_index(&mut self, name: &str) -> usize {
        if let Some(idx) = self.set.projects.iter().position(|p| p.name == name) {
            return idx;
        }
        self.set.projects.push(DiffProject {
            name: name.to_string(),
            diffs: Vec::new(),
        });
        self.set.projects.len() - 1
    }

    fn take_header(&mut self) -> Option<String> {
        if self.header.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.header).concat())
        }
    }

    /// Reads one `---`/`+++` file header and its `@@` hunks. Called with the
    /// cursor on the `--- ` line; on any malformed or foreign line, reading
    /// stops with that line unconsumed so the outer scan can pick it up.
    fn read_unified_diff(&mut self) {
        let header_pos = self.pos;
        let old_header = line_content(&self.lines[header_pos]).to_string();
        self.advance();

        let new_header = match self.peek() {
            Some(line) if line_content(line).starts_with("+++ ") => {
                line_content(line).to_string()
            }
            _ => {
                // A `---` line without its `+++` partner is not a file
                // header; hand it back to the free-text scan.
                warn!("'---' line without matching '+++', treating as free text");
                let line = &self.lines[header_pos];
                self.scan_free_line(line);
                return;
            }
        };
        self.advance();

        let (old_path, old_date) = self.parse_header_args(&old_header[4..]);
        let (new_path, new_date) = self.parse_header_args(&new_header[4..]);
        trace!("unified diff header: {:?} -> {:?}", old_path, new_path);
        let mut diff = FilePatch {
            old_path,
            old_date,
            new_path,
            new_date,
            hunks: Vec::new(),
            header: self.take_header(),
        };

        let mut hunk_lines: Vec<HunkLine> = Vec::new();
        let mut old_range = (0usize, 0usize);
        let mut new_range = (0usize, 0usize);
        let mut have_ranges = false;
        let mut remaining_old = 0isize;
        let mut remaining_new = 0isize;

        while let Some(line) = self.peek() {
            let content = line_content(line);
            if content.starts_with("@@ -") {
                match parse_unified_ranges(content) {
                    Some((old, new)) => {
                        flush_hunk(&mut diff, &mut hunk_lines, old_range, new_range);
                        old_range = old;
                        new_range = new;
                        have_ranges = true;
                        remaining_old = old.1 as isize;
                        remaining_new = new.1 as isize;
                        self.advance();
                        continue;
                    }
                    None => break, // malformed ranges end this file
                }
            }
            if !have_ranges || content.is_empty() {
                break;
            }
            match content.as_bytes()[0] {
                b' ' => {
                    if remaining_old <= 0 && remaining_new <= 0 {
                        break;
                    }
                    hunk_lines.push(HunkLine::Context(line[1..].to_string()));
                    remaining_old -= 1;
                    remaining_new -= 1;
                    self.advance();
                }
                b'+' => {
                    if remaining_new <= 0 {
                        break;
                    }
                    hunk_lines.push(HunkLine::Added(line[1..].to_string()));
                    remaining_new -= 1;
                    self.advance();
                }
                b'-' => {
                    if remaining_old <= 0 {
                        break;
                    }
                    hunk_lines.push(HunkLine::Removed(line[1..].to_string()));
                    remaining_old -= 1;
                    self.advance();
                }
                b'\\' => {
                    // "\ No newline at end of file": the preceding line has
                    // no terminator in the real file.
                    if let Some(last) = hunk_lines.last_mut() {
                        last.strip_terminator();
                    } else if let Some(last) =
                        diff.hunks.last_mut().and_then(|h| h.lines.last_mut())
                    {
                        last.strip_terminator();
                    }
                    self.advance();
                }
                _ => break,
            }
        }
        flush_hunk(&mut diff, &mut hunk_lines, old_range, new_range);
        self.set.diffs.push(diff);
    }

    /// Reads one context-dialect file: `*** old` / `--- new` headers and
    /// `***************`-separated hunks whose halves get unified.
    fn read_context_diff(&mut self) {
        let header_pos = self.pos;
        let old_header = line_content(&self.lines[header_pos]).to_string();
        self.advance();

        // A few blank lines may sit between the two header lines.
        while self
            .peek()
            .map(|l| line_content(l).is_empty())
            .unwrap_or(false)
        {
            self.advance();
        }
        let new_header = match self.peek() {
            Some(line) if line_content(line).starts_with("--- ") => {
                line_content(line).to_string()
            }
            _ => {
                warn!("'***' line without matching '---', treating as free text");
                self.pos = header_pos;
                let line = &self.lines[header_pos];
                self.scan_free_line(line);
                self.advance();
                return;
            }
        };
        self.advance();

        let (old_path, old_date) = self.parse_header_args(&old_header[4..]);
        let (new_path, new_date) = self.parse_header_args(&new_header[4..]);
        trace!("context diff header: {:?} -> {:?}", old_path, new_path);
        let mut diff = FilePatch {
            old_path,
            old_date,
            new_path,
            new_date,
            hunks: Vec::new(),
            header: self.take_header(),
        };

        'hunks: while let Some(line) = self.peek() {
            if !line_content(line).starts_with("***************") {
                break;
            }
            self.advance();

            // Old-half sub-header: "*** start,end ****".
            let old_range = match self.peek() {
                Some(line) if line_content(line).starts_with("*** ") => {
                    match parse_context_range(&line_content(line)[4..]) {
                        Some(range) => range,
                        None => break,
                    }
                }
                _ => break,
            };
            self.advance();

            // Old-half body lines, up to the "--- start,end ----" sub-header.
            let mut old_half: Vec<&'a String> = Vec::new();
            loop {
                match self.peek() {
                    Some(line) if line_content(line).starts_with("--- ") => break,
                    Some(line) if is_context_body_line(line) => {
                        old_half.push(line);
                        self.advance();
                    }
                    _ => break 'hunks,
                }
            }

            let new_range = match self.peek() {
                Some(line) if line_content(line).starts_with("--- ") => {
                    match parse_context_range(&line_content(line)[4..]) {
                        Some(range) => range,
                        None => break,
                    }
                }
                _ => break,
            };
            self.advance();

            let mut new_half: Vec<&'a String> = Vec::new();
            while let Some(line) = self.peek() {
                if is_context_body_line(line) {
                    new_half.push(line);
                    self.advance();
                } else {
                    break;
                }
            }

            let lines = unify_context_halves(&old_half, &new_half);
            if !lines.is_empty() {
                diff.hunks.push(Hunk {
                    old_start: old_range.0,
                    old_length: old_range.1,
                    new_start: new_range.0,
                    new_length: new_range.1,
                    lines,
                });
            }
        }
        self.set.diffs.push(diff);
    }

    /// Splits a header-line remainder into path and timestamp. Tokens are
    /// tab-separated; `/dev/null` maps to no path; a missing path token
    /// falls back to the most recent `Index:` name.
    fn parse_header_args(&self, rest: &str) -> (Option<PathBuf>, Option<NaiveDateTime>) {
        let mut tokens = rest.split('\t');
        let path_token = tokens.next().map(str::trim).unwrap_or("");
        let date_token = tokens.next().map(str::trim);

        let path = if path_token.is_empty() {
            self.fallback_name.as_ref().map(PathBuf::from)
        } else if path_token == "/dev/null" {
            None
        } else {
            Some(PathBuf::from(path_token.trim_matches('"')))
        };
        let date = date_token.and_then(parse_timestamp);
        (path, date)
    }
}

/// Tries the configured timestamp formats in order; an unrecognized token is
/// simply "unknown", never an error.
fn parse_timestamp(token: &str) -> Option<NaiveDateTime> {
    for format in DATE_FORMATS {
        if let Ok(dt) = chrono::DateTime::parse_from_str(token, format) {
            return Some(dt.naive_local());
        }
        if let Ok(dt) = NaiveDateTime::parse_from_str(token, format) {
            return Some(dt);
        }
    }
    None
}

/// Parses `@@ -os[,ol] +ns[,nl] @@`; an omitted length means 1. Returns
/// 0-based starts.
fn parse_unified_ranges(content: &str) -> Option<((usize, usize), (usize, usize))> {
    let mut tokens = content.split_whitespace();
    if tokens.next() != Some("@@") {
        return None;
    }
    let old = parse_range(tokens.next()?.strip_prefix('-')?)?;
    let new = parse_range(tokens.next()?.strip_prefix('+')?)?;
    if !tokens.next()?.starts_with("@@") {
        return None;
    }
    Some((old, new))
}

/// Parses `start[,length]` into a 0-based `(start, length)` pair. A
/// zero-length range names the line the gap follows, so its 1-based number
/// is already the 0-based insertion index and stays undecremented.
fn parse_range(token: &str) -> Option<(usize, usize)> {
    let (start, length) = match token.split_once(',') {
        Some((s, l)) => (s.parse::<usize>().ok()?, l.parse::<usize>().ok()?),
        None => (token.parse::<usize>().ok()?, 1),
    };
    if length == 0 {
        return Some((start, 0));
    }
    Some((start.saturating_sub(1), length))
}

/// Parses the `start,end ****` form of a context-diff sub-header. Ranges are
/// end-inclusive; a start of 0 forces a zero length (pure addition or
/// removal at the file boundary). Returns a 0-based `(start, length)` pair.
fn parse_context_range(rest: &str) -> Option<(usize, usize)> {
    let token = rest.split_whitespace().next()?;
    let (start, end) = match token.split_once(',') {
        Some((s, e)) => (s.parse::<usize>().ok()?, e.parse::<usize>().ok()?),
        None => {
            let s = token.parse::<usize>().ok()?;
            (s, s)
        }
    };
    if start == 0 {
        return Some((0, 0));
    }
    if end < start {
        return None;
    }
    Some((start - 1, end - start + 1))
}

fn is_context_body_line(line: &str) -> bool {
    let content = line_content(line);
    content.starts_with("  ")
        || content.starts_with("+ ")
        || content.starts_with("- ")
        || content.starts_with("! ")
}

/// Merges the separately-recorded old and new halves of a context-diff hunk
/// into one interleaved unified-style line sequence.
///
/// Runs of `- ` become removals, runs of `+ ` become additions, paired `! `
/// runs become the old run as removals followed by the new run as additions,
/// and matching context lines collapse into one. The two halves disagreeing
/// about a shared context line is a parser defect, not recoverable input,
/// and asserts.
fn unify_context_halves(old: &[&String], new: &[&String]) -> Vec<HunkLine> {
    fn starts(line: Option<&&String>, prefix: &str) -> bool {
        line.map(|l| line_content(l).starts_with(prefix))
            .unwrap_or(false)
    }

    let mut result = Vec::new();
    let (mut oi, mut ni) = (0usize, 0usize);
    while oi < old.len() || ni < new.len() {
        if starts(old.get(oi), "- ") {
            while starts(old.get(oi), "- ") {
                result.push(HunkLine::Removed(old[oi][2..].to_string()));
                oi += 1;
            }
        } else if starts(new.get(ni), "+ ") {
            while starts(new.get(ni), "+ ") {
                result.push(HunkLine::Added(new[ni][2..].to_string()));
                ni += 1;
            }
        } else if starts(old.get(oi), "! ") {
            while starts(old.get(oi), "! ") {
                result.push(HunkLine::Removed(old[oi][2..].to_string()));
                oi += 1;
            }
            while starts(new.get(ni), "! ") {
                result.push(HunkLine::Added(new[ni][2..].to_string()));
                ni += 1;
            }
        } else {
            // Context on whichever halves still have lines; when both do,
            // they must agree.
            match (old.get(oi), new.get(ni)) {
                (Some(o), Some(n)) => {
                    assert_eq!(
                        line_content(&o[2..]),
                        line_content(&n[2..]),
                        "context diff halves disagree about a shared context line"
                    );
                    result.push(HunkLine::Context(o[2..].to_string()));
                    oi += 1;
                    ni += 1;
                }
                (Some(o), None) => {
                    assert!(
                        line_content(o).starts_with("  "),
                        "unexpected interleaving in context diff hunk"
                    );
                    result.push(HunkLine::Context(o[2..].to_string()));
                    oi += 1;
                }
                (None, Some(n)) => {
                    assert!(
                        line_content(n).starts_with("  "),
                        "unexpected interleaving in context diff hunk"
                    );
                    result.push(HunkLine::Context(n[2..].to_string()));
                    ni += 1;
                }
                (None, None) => unreachable!(),
            }
        }
    }
    result
}

/// Emits the buffered hunk lines as a hunk, unless the buffer is empty; a
/// hunk with zero counted lines is never emitted.
fn flush_hunk(
    diff: &mut FilePatch,
    hunk_lines: &mut Vec<HunkLine>,
    old_range: (usize, usize),
    new_range: (usize, usize),
) {
    if hunk_lines.is_empty() {
        return;
    }
    diff.hunks.push(Hunk {
        old_start: old_range.0,
        old_length: old_range.1,
        new_start: new_range.0,
        new_length: new_range.1,
        lines: std::mem::take(hunk_lines),
    });
}

// --- Hunk Matching Configuration ---

/// Options for one application attempt.
#[derive(Debug, Clone, Copy)]
pub struct PatchConfig {
    /// Apply the patch as if undoing it: `+`/`-` swap meaning and the old
    /// and new path roles swap.
    pub reversed: bool,
    /// Fuzz ceiling: the maximum number of mismatched context lines
    /// tolerated at each hunk edge. 0 means exact matching.
    pub fuzz: u32,
    /// Compare context lines with all whitespace removed.
    pub ignore_whitespace: bool,
    /// Compare context lines without their terminators (on by default, so a
    /// CRLF target still matches an LF patch).
    pub ignore_line_endings: bool,
    /// Leading path segments to strip from patch paths, clamped to each
    /// file's own segment count.
    pub strip_prefix_segments: usize,
}

impl Default for PatchConfig {
    fn default() -> Self {
        Self {
            reversed: false,
            fuzz: 0,
            ignore_whitespace: false,
            ignore_line_endings: true,
            strip_prefix_segments: 0,
        }
    }
}

impl PatchConfig {
    /// Creates a new builder for `PatchConfig`.
    ///
    /// # Example
    ///
    /// ```
    /// # use fuzzpatch::PatchConfig;
    /// let config = PatchConfig::builder()
    ///     .reversed(true)
    ///     .fuzz(2)
    ///     .build();
    ///
    /// assert!(config.reversed);
    /// assert_eq!(config.fuzz, 2);
    /// ```
    pub fn builder() -> PatchConfigBuilder {
        PatchConfigBuilder::default()
    }
}

/// A builder for creating [`PatchConfig`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PatchConfigBuilder {
    reversed: Option<bool>,
    fuzz: Option<u32>,
    ignore_whitespace: Option<bool>,
    ignore_line_endings: Option<bool>,
    strip_prefix_segments: Option<usize>,
}

impl PatchConfigBuilder {
    /// Apply the patch as if undoing it.
    pub fn reversed(mut self, reversed: bool) -> Self {
        self.reversed = Some(reversed);
        self
    }

    /// Sets the fuzz ceiling (0 = exact matching).
    pub fn fuzz(mut self, fuzz: u32) -> Self {
        self.fuzz = Some(fuzz);
        self
    }

    /// Compare context lines ignoring all whitespace.
    pub fn ignore_whitespace(mut self, ignore: bool) -> Self {
        self.ignore_whitespace = Some(ignore);
        self
    }

    /// Compare context lines ignoring their terminators.
    pub fn ignore_line_endings(mut self, ignore: bool) -> Self {
        self.ignore_line_endings = Some(ignore);
        self
    }

    /// Leading path segments to strip from patch paths.
    pub fn strip_prefix_segments(mut self, strip: usize) -> Self {
        self.strip_prefix_segments = Some(strip);
        self
    }

    /// Builds the `PatchConfig`.
    pub fn build(self) -> PatchConfig {
        let default = PatchConfig::default();
        PatchConfig {
            reversed: self.reversed.unwrap_or(default.reversed),
            fuzz: self.fuzz.unwrap_or(default.fuzz),
            ignore_whitespace: self.ignore_whitespace.unwrap_or(default.ignore_whitespace),
            ignore_line_endings: self
                .ignore_line_endings
                .unwrap_or(default.ignore_line_endings),
            strip_prefix_segments: self
                .strip_prefix_segments
                .unwrap_or(default.strip_prefix_segments),
        }
    }
}

/// Line equality under the configured comparison mode.
fn lines_match(config: &PatchConfig, patch_line: &str, target_line: &str) -> bool {
    if config.ignore_whitespace {
        return strip_whitespace(patch_line) == strip_whitespace(target_line);
    }
    if config.ignore_line_endings {
        return line_content(patch_line) == line_content(target_line);
    }
    patch_line == target_line
}

fn strip_whitespace(line: &str) -> String {
    line.chars().filter(|c| !c.is_whitespace()).collect()
}

// --- Application Driver ---

/// Per-hunk outcome of one application attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HunkOutcome {
    /// Whether the hunk found a match and was applied.
    pub matched: bool,
    /// The smallest fuzz that let the hunk match (0 when unmatched).
    pub fuzz: u32,
    /// The accumulated shift in effect when this hunk was attempted.
    pub shift: isize,
}

/// The result of applying one [`FilePatch`] to one piece of target content.
///
/// A `FileDiffResult` is short-lived: create it, call
/// [`refresh`](FileDiffResult::refresh) with the current target content, and
/// read the outcome. `refresh` rebuilds everything from scratch each time;
/// nothing is mutated incrementally.
///
/// Failures are data, never errors: a missing target or an unmatched hunk
/// sets flags and messages on the result for the caller to inspect.
#[derive(Debug)]
pub struct FileDiffResult<'a> {
    diff: &'a FilePatch,
    config: &'a PatchConfig,
    before: Vec<String>,
    after: Vec<String>,
    outcomes: Vec<HunkOutcome>,
    diff_problem: bool,
    error_message: Option<String>,
    max_fuzz: u32,
}

impl<'a> FileDiffResult<'a> {
    /// Creates an empty result for one file diff. Call
    /// [`refresh`](FileDiffResult::refresh) to populate it.
    pub fn new(diff: &'a FilePatch, config: &'a PatchConfig) -> Self {
        Self {
            diff,
            config,
            before: Vec::new(),
            after: Vec::new(),
            outcomes: Vec::new(),
            diff_problem: false,
            error_message: None,
            max_fuzz: 0,
        }
    }

    /// Recomputes the result against `content` (`None` when the target file
    /// does not exist).
    ///
    /// An addition requires the target to be missing or empty; any other
    /// diff kind requires it to exist. When the precondition fails, the
    /// problem is recorded at the diff level, `after` mirrors `before`, and
    /// every hunk reports unmatched without any matching being attempted.
    pub fn refresh(&mut self, content: Option<&str>) {
        self.before.clear();
        self.after.clear();
        self.outcomes.clear();
        self.diff_problem = false;
        self.error_message = None;
        self.max_fuzz = 0;

        let kind = self.diff.kind(self.config.reversed);
        match kind {
            DiffKind::Addition => {
                if content.map(|c| !c.is_empty()).unwrap_or(false) {
                    self.mark_problem("target file already exists", content);
                    return;
                }
            }
            _ => {
                if content.is_none() {
                    self.mark_problem("target file does not exist", None);
                    return;
                }
            }
        }

        let lines = split_lines(content.unwrap_or(""), false);
        self.before = lines.clone();
        let mut after = lines;
        let mut shift: isize = 0;
        for (i, hunk) in self.diff.hunks.iter().enumerate() {
            let found =
                (0..=self.config.fuzz).find(|&f| hunk.try_match(&after, shift, f, self.config));
            match found {
                Some(fuzz) => {
                    let delta = hunk.apply(&mut after, shift, self.config);
                    trace!(
                        "hunk {} matched at fuzz {} (shift {}, delta {})",
                        i + 1,
                        fuzz,
                        shift,
                        delta
                    );
                    self.outcomes.push(HunkOutcome {
                        matched: true,
                        fuzz,
                        shift,
                    });
                    shift += delta;
                    self.max_fuzz = self.max_fuzz.max(fuzz);
                }
                None => {
                    debug!(
                        "hunk {} found no match up to fuzz {}",
                        i + 1,
                        self.config.fuzz
                    );
                    self.outcomes.push(HunkOutcome {
                        matched: false,
                        fuzz: 0,
                        shift,
                    });
                }
            }
        }
        self.after = after;
        if self.outcomes.iter().any(|o| !o.matched) {
            self.error_message = Some(format!(
                "{} of {} hunk(s) failed to match",
                self.outcomes.iter().filter(|o| !o.matched).count(),
                self.outcomes.len()
            ));
        }
    }

    /// Records a diff-level problem: before/after are populated (after is a
    /// copy of before) and every hunk reports unmatched, for display.
    fn mark_problem(&mut self, message: &str, content: Option<&str>) {
        self.diff_problem = true;
        self.error_message = Some(message.to_string());
        self.before = split_lines(content.unwrap_or(""), false);
        self.after = self.before.clone();
        self.outcomes = self
            .diff
            .hunks
            .iter()
            .map(|_| HunkOutcome {
                matched: false,
                fuzz: 0,
                shift: 0,
            })
            .collect();
    }

    /// Marks the whole attempt as failed without matching, used when a
    /// batch run is cancelled mid-flight.
    pub fn mark_cancelled(&mut self) {
        self.mark_problem("operation cancelled", None);
    }

    /// True when at least one hunk matched. A partially-successful file
    /// still reports `true`; only a file where nothing matched (or a
    /// diff-level problem) reports `false`.
    pub fn has_matches(&self) -> bool {
        self.outcomes.iter().any(|o| o.matched)
    }

    /// True when the diff-level precondition failed or any hunk is
    /// unmatched.
    pub fn has_problems(&self) -> bool {
        self.diff_problem || self.outcomes.iter().any(|o| !o.matched)
    }

    /// True only for diff-level problems (missing target, target already
    /// exists, cancellation) as opposed to per-hunk mismatches.
    pub fn diff_problem(&self) -> bool {
        self.diff_problem
    }

    /// Human-readable description of the problem, when there is one.
    pub fn problem_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    /// The largest fuzz any hunk needed in the last refresh.
    pub fn max_fuzz(&self) -> u32 {
        self.max_fuzz
    }

    /// The target lines as read, terminators preserved.
    pub fn before_lines(&self) -> &[String] {
        &self.before
    }

    /// The target lines after applying every matched hunk.
    pub fn after_lines(&self) -> &[String] {
        &self.after
    }

    /// Per-hunk outcomes, parallel to the diff's hunks.
    pub fn hunk_outcomes(&self) -> &[HunkOutcome] {
        &self.outcomes
    }

    /// The original content, reconstructed byte-for-byte.
    pub fn original_content(&self) -> String {
        concatenate_lines(&self.before, true)
    }

    /// The patched content; unchanged lines keep their exact bytes.
    pub fn patched_content(&self) -> String {
        concatenate_lines(&self.after, true)
    }

    /// The original content encoded under `charset` (UTF-8 when `None` or
    /// unknown).
    pub fn original_bytes(&self, charset: Option<&str>) -> Vec<u8> {
        encode_content(&self.original_content(), charset)
    }

    /// The patched content encoded under `charset` (UTF-8 when `None` or
    /// unknown).
    pub fn patched_bytes(&self, charset: Option<&str>) -> Vec<u8> {
        encode_content(&self.patched_content(), charset)
    }

    /// The hunks that failed to match, in patch order.
    pub fn rejects(&self) -> Vec<&Hunk> {
        self.diff
            .hunks
            .iter()
            .zip(&self.outcomes)
            .filter(|(_, outcome)| !outcome.matched)
            .map(|(hunk, _)| hunk)
            .collect()
    }

    /// The rejected hunks rendered as unified-shaped `@@ ... @@` blocks,
    /// suitable for a `.rej` file.
    pub fn reject_content(&self) -> String {
        self.rejects().iter().map(|h| h.to_string()).collect()
    }
}

/// Encodes text under a charset label, silently falling back to UTF-8 when
/// the label is absent or unknown.
pub fn encode_content(content: &str, charset: Option<&str>) -> Vec<u8> {
    let encoding = charset
        .and_then(|label| Encoding::for_label(label.as_bytes()))
        .unwrap_or(encoding_rs::UTF_8);
    encoding.encode(content).0.into_owned()
}

/// Decodes file bytes, honoring an explicit charset label first, then a
/// BOM, then UTF-8. Returns the text and the encoding actually used.
pub fn decode_bytes(bytes: &[u8], charset: Option<&str>) -> (String, &'static Encoding) {
    let encoding = charset
        .and_then(|label| Encoding::for_label(label.as_bytes()))
        .or_else(|| Encoding::for_bom(bytes).map(|(e, _)| e))
        .unwrap_or(encoding_rs::UTF_8);
    let (text, used, _) = encoding.decode(bytes);
    (text.into_owned(), used)
}

// --- Filesystem Application ---

/// Outcome of applying one file diff to the filesystem.
#[derive(Debug, Clone)]
pub struct FileReport {
    /// The resolved target path, relative to the target directory.
    pub path: PathBuf,
    /// Whether at least one hunk matched.
    pub matched: bool,
    /// Number of hunks that failed to match.
    pub failed_hunks: usize,
    /// Total hunks in the file diff.
    pub total_hunks: usize,
    /// Diff-level or summary problem message, when any.
    pub problem: Option<String>,
    /// Where rejected hunks were written, when any were.
    pub reject_file: Option<PathBuf>,
}

impl FileReport {
    /// True when every hunk matched and no diff-level problem occurred.
    pub fn applied_cleanly(&self) -> bool {
        self.matched && self.failed_hunks == 0 && self.problem.is_none()
    }
}

/// The result of applying a whole [`PatchSet`] to a directory.
#[derive(Debug)]
pub struct BatchReport {
    /// One entry per file diff attempted, in patch order.
    pub results: Vec<(PathBuf, Result<FileReport, PatchError>)>,
    /// Whether the run stopped early on the cancellation flag.
    pub cancelled: bool,
}

impl BatchReport {
    /// True when no entry hit a hard error (I/O, traversal). Per-hunk
    /// failures do not count; inspect the individual [`FileReport`]s.
    pub fn all_succeeded(&self) -> bool {
        self.results.iter().all(|(_, r)| r.is_ok())
    }

    /// Entries that hit a hard error.
    pub fn hard_failures(&self) -> Vec<(&PathBuf, &PatchError)> {
        self.results
            .iter()
            .filter_map(|(path, r)| r.as_ref().err().map(|e| (path, e)))
            .collect()
    }

    /// Entries that completed but left at least one hunk unapplied.
    pub fn partial_files(&self) -> Vec<&FileReport> {
        self.results
            .iter()
            .filter_map(|(_, r)| r.as_ref().ok())
            .filter(|report| !report.applied_cleanly())
            .collect()
    }
}

/// Ensures a relative path, joined to a base directory, still resolves
/// inside that directory.
///
/// Guards against traversal via patches like `--- a/../../etc/passwd`. Both
/// the base and the target's parent are canonicalized (creating the parent
/// when absent) and the result must stay under the base.
pub fn ensure_path_is_safe(base_dir: &Path, relative_path: &Path) -> Result<PathBuf, PatchError> {
    trace!(
        "checking path safety of '{}' under '{}'",
        relative_path.display(),
        base_dir.display()
    );
    let base = fs::canonicalize(base_dir).map_err(|e| map_io_error(base_dir.to_path_buf(), e))?;
    let target = base_dir.join(relative_path);
    let parent = target.parent().unwrap_or(Path::new(""));
    fs::create_dir_all(parent).map_err(|e| map_io_error(parent.to_path_buf(), e))?;
    let resolved = fs::canonicalize(parent)
        .map_err(|e| map_io_error(parent.to_path_buf(), e))?
        .join(target.file_name().unwrap_or_default());
    if !resolved.starts_with(&base) {
        return Err(PatchError::PathTraversal(relative_path.to_path_buf()));
    }
    Ok(resolved)
}

/// Applies one file diff to its target under `target_dir`.
///
/// Resolves the target path (reversal and strip aware), reads and decodes
/// the current content, runs [`FileDiffResult::refresh`], and, unless
/// `dry_run`, writes the patched bytes back (or deletes the file for a
/// fully-applied deletion) and writes failed hunks to `<target>.rej`.
pub fn apply_file_patch(
    diff: &FilePatch,
    target_dir: &Path,
    config: &PatchConfig,
    dry_run: bool,
) -> Result<FileReport, PatchError> {
    let rel = diff
        .stripped_path(config.strip_prefix_segments, config.reversed)
        .ok_or(PatchError::NoTargetPath)?;
    info!("applying patch for '{}'", rel.display());
    let safe = ensure_path_is_safe(target_dir, &rel)?;
    if safe.is_dir() {
        return Err(PatchError::TargetIsDirectory { path: safe });
    }

    let (content, encoding) = if safe.is_file() {
        let bytes = fs::read(&safe).map_err(|e| map_io_error(safe.clone(), e))?;
        let (text, encoding) = decode_bytes(&bytes, None);
        (Some(text), encoding)
    } else {
        (None, encoding_rs::UTF_8)
    };

    let mut result = FileDiffResult::new(diff, config);
    result.refresh(content.as_deref());

    let mut reject_file = None;
    if !dry_run {
        if result.has_matches() && !result.diff_problem() {
            if diff.kind(config.reversed) == DiffKind::Deletion && !result.has_problems() {
                info!("deleting '{}'", rel.display());
                fs::remove_file(&safe).map_err(|e| map_io_error(safe.clone(), e))?;
            } else {
                fs::write(&safe, result.patched_bytes(Some(encoding.name())))
                    .map_err(|e| map_io_error(safe.clone(), e))?;
            }
        }
        let rejects = result.rejects();
        if !rejects.is_empty() {
            let name = safe
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let rej = safe.with_file_name(format!("{}.rej", name));
            warn!(
                "{} hunk(s) rejected for '{}', writing '{}'",
                rejects.len(),
                rel.display(),
                rej.display()
            );
            fs::write(&rej, result.reject_content()).map_err(|e| map_io_error(rej.clone(), e))?;
            reject_file = Some(rej);
        }
    }

    let failed = result
        .hunk_outcomes()
        .iter()
        .filter(|o| !o.matched)
        .count();
    Ok(FileReport {
        path: rel,
        matched: result.has_matches(),
        failed_hunks: failed,
        total_hunks: diff.hunks.len(),
        problem: result.problem_message().map(String::from),
        reject_file,
    })
}

/// Applies every file diff of a patch set to `target_dir`.
///
/// Workspace patches are applied through [`PatchSet::adjusted_diffs`], so
/// project names become leading path segments. When a cancellation flag is
/// supplied, it is polled between files: the file in flight when the flag
/// flips is reported as a failure and the rest are skipped, while results
/// already produced are kept. Without a flag, files are processed
/// independently (in parallel with the `parallel` feature).
pub fn apply_patch_set(
    set: &PatchSet,
    target_dir: &Path,
    config: &PatchConfig,
    dry_run: bool,
    cancel: Option<&AtomicBool>,
) -> BatchReport {
    let diffs = set.adjusted_diffs();

    if let Some(flag) = cancel {
        let mut results = Vec::with_capacity(diffs.len());
        let mut cancelled = false;
        for diff in &diffs {
            let path = diff
                .stripped_path(config.strip_prefix_segments, config.reversed)
                .unwrap_or_default();
            if flag.load(Ordering::Relaxed) {
                warn!(
                    "cancellation requested, stopping before '{}'",
                    path.display()
                );
                let mut result = FileDiffResult::new(diff, config);
                result.mark_cancelled();
                results.push((
                    path.clone(),
                    Ok(FileReport {
                        path,
                        matched: result.has_matches(),
                        failed_hunks: result
                            .hunk_outcomes()
                            .iter()
                            .filter(|o| !o.matched)
                            .count(),
                        total_hunks: diff.hunks.len(),
                        problem: result.problem_message().map(String::from),
                        reject_file: None,
                    }),
                ));
                cancelled = true;
                break;
            }
            results.push((path, apply_file_patch(diff, target_dir, config, dry_run)));
        }
        return BatchReport { results, cancelled };
    }

    #[cfg(feature = "parallel")]
    let results = diffs
        .par_iter()
        .map(|diff| {
            let path = diff
                .stripped_path(config.strip_prefix_segments, config.reversed)
                .unwrap_or_default();
            (path, apply_file_patch(diff, target_dir, config, dry_run))
        })
        .collect();

    #[cfg(not(feature = "parallel"))]
    let results = diffs
        .iter()
        .map(|diff| {
            let path = diff
                .stripped_path(config.strip_prefix_segments, config.reversed)
                .unwrap_or_default();
            (path, apply_file_patch(diff, target_dir, config, dry_run))
        })
        .collect();

    BatchReport {
        results,
        cancelled: false,
    }
}
