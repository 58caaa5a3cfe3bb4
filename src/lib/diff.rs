use crate::error::{CoreError, Result};

/// What a file block of a unified diff does to its path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Add,
    Modify,
    Delete,
    Rename,
}

/// One `@@` hunk with its raw prefixed lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffHunk {
    pub old_start: u32,
    pub old_count: u32,
    pub new_start: u32,
    pub new_count: u32,
    /// Lines including their `' '`/`'+'`/`'-'` prefix.
    pub lines: Vec<String>,
}

impl DiffHunk {
    /// The pre-image fragment this hunk expects at `old_start`.
    pub fn base_lines(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter(|l| l.starts_with(' ') || l.starts_with('-'))
            .map(|l| &l[1..])
            .collect()
    }

    /// The post-image fragment this hunk produces at `new_start`.
    pub fn target_lines(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter(|l| l.starts_with(' ') || l.starts_with('+'))
            .map(|l| &l[1..])
            .collect()
    }
}

/// One file block of a multi-file unified diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffFile {
    pub old_path: Option<String>,
    pub new_path: Option<String>,
    pub change: ChangeKind,
    pub is_binary: bool,
    pub hunks: Vec<DiffHunk>,
}

impl DiffFile {
    /// The path the change lands on.
    pub fn path(&self) -> &str {
        self.new_path
            .as_deref()
            .or(self.old_path.as_deref())
            .unwrap_or("")
    }

    pub fn has_hunks(&self) -> bool {
        !self.hunks.is_empty()
    }

    /// Pre-image fragments as `(1-based start line, lines)` pairs.
    pub fn base_fragments(&self) -> Vec<(u32, Vec<&str>)> {
        self.hunks
            .iter()
            .map(|h| (h.old_start, h.base_lines()))
            .collect()
    }

    /// Applies the hunks to `base`, producing the post-image. Fails with
    /// `invalid-input` when a hunk's pre-image does not match `base`.
    pub fn apply_to(&self, base: &str) -> Result<String> {
        let base_lines: Vec<&str> = base.lines().collect();
        let mut out: Vec<String> = Vec::new();
        let mut cursor: usize = 0; // 0-based index into base_lines
        for hunk in &self.hunks {
            let hunk_start = (hunk.old_start.max(1) - 1) as usize;
            if hunk_start < cursor || hunk_start > base_lines.len() {
                return Err(CoreError::invalid_input(format!(
                    "hunk at line {} does not fit the file ({} lines)",
                    hunk.old_start,
                    base_lines.len()
                )));
            }
            out.extend(base_lines[cursor..hunk_start].iter().map(|l| l.to_string()));
            cursor = hunk_start;
            for line in &hunk.lines {
                match line.chars().next() {
                    Some(' ') | Some('-') => {
                        let expected = &line[1..];
                        let actual = base_lines.get(cursor).copied().unwrap_or_default();
                        if actual != expected {
                            return Err(CoreError::invalid_input(format!(
                                "hunk pre-image mismatch at line {}: expected '{expected}', found '{actual}'",
                                cursor + 1
                            )));
                        }
                        if line.starts_with(' ') {
                            out.push(expected.to_string());
                        }
                        cursor += 1;
                    }
                    Some('+') => out.push(line[1..].to_string()),
                    _ => {} // "\ No newline at end of file"
                }
            }
        }
        out.extend(base_lines[cursor..].iter().map(|l| l.to_string()));
        let mut text = out.join("\n");
        if base.ends_with('\n') || base.is_empty() {
            text.push('\n');
        }
        Ok(text)
    }
}

fn parse_git_header_paths(line: &str) -> (Option<String>, Option<String>) {
    // `diff --git a/<old> b/<new>`; split on the ` b/` separator so paths
    // containing spaces survive
    let Some(rest) = line.strip_prefix("diff --git a/") else {
        return (None, None);
    };
    match rest.find(" b/") {
        Some(idx) => (
            Some(rest[..idx].to_string()),
            Some(rest[idx + 3..].to_string()),
        ),
        None => (None, None),
    }
}

fn parse_hunk_header(line: &str) -> Option<(u32, u32, u32, u32)> {
    let mut parts = line.split_whitespace();
    if parts.next() != Some("@@") {
        return None;
    }
    let old = parts.next()?.strip_prefix('-')?;
    let new = parts.next()?.strip_prefix('+')?;
    let parse_range = |s: &str| -> Option<(u32, u32)> {
        match s.split_once(',') {
            Some((start, count)) => Some((start.parse().ok()?, count.parse().ok()?)),
            None => Some((s.parse().ok()?, 1)),
        }
    };
    let (old_start, old_count) = parse_range(old)?;
    let (new_start, new_count) = parse_range(new)?;
    Some((old_start, old_count, new_start, new_count))
}

fn strip_marker_path(line: &str, marker: &str) -> Option<Option<String>> {
    let rest = line.strip_prefix(marker)?;
    let rest = rest.trim_end();
    if rest == "/dev/null" {
        return Some(None);
    }
    let rest = rest
        .strip_prefix("a/")
        .or_else(|| rest.strip_prefix("b/"))
        .unwrap_or(rest);
    Some(Some(rest.to_string()))
}

/// Splits a multi-file `git diff` stream into per-file blocks with parsed
/// hunks. Returns `invalid-input` when the content is empty or does not
/// begin with a `diff --git` header.
pub fn parse_unified_diff(raw: &str) -> Result<Vec<DiffFile>> {
    let trimmed = raw.trim_start();
    if trimmed.is_empty() {
        return Err(CoreError::invalid_input("empty diff"));
    }
    if !trimmed.starts_with("diff --git") {
        return Err(CoreError::invalid_input(
            "diff does not start with a 'diff --git' header",
        ));
    }

    let mut files: Vec<DiffFile> = Vec::new();
    let mut current: Option<DiffFile> = None;
    let mut current_hunk: Option<DiffHunk> = None;

    let flush_hunk = |file: &mut Option<DiffFile>, hunk: &mut Option<DiffHunk>| {
        if let (Some(file), Some(hunk)) = (file.as_mut(), hunk.take()) {
            file.hunks.push(hunk);
        }
    };

    for line in trimmed.lines() {
        if line.starts_with("diff --git") {
            flush_hunk(&mut current, &mut current_hunk);
            if let Some(file) = current.take() {
                files.push(file);
            }
            let (old_path, new_path) = parse_git_header_paths(line);
            current = Some(DiffFile {
                old_path,
                new_path,
                change: ChangeKind::Modify,
                is_binary: false,
                hunks: Vec::new(),
            });
            continue;
        }
        let Some(file) = current.as_mut() else {
            continue;
        };

        if let Some(header) = parse_hunk_header(line) {
            flush_hunk(&mut current, &mut current_hunk);
            let (old_start, old_count, new_start, new_count) = header;
            current_hunk = Some(DiffHunk {
                old_start,
                old_count,
                new_start,
                new_count,
                lines: Vec::new(),
            });
            continue;
        }
        if let Some(hunk) = current_hunk.as_mut() {
            if line.starts_with([' ', '+', '-', '\\']) {
                hunk.lines.push(line.to_string());
                continue;
            }
            // anything else terminates the hunk
            flush_hunk(&mut current, &mut current_hunk);
            continue;
        }

        if line.starts_with("new file mode") {
            file.change = ChangeKind::Add;
        } else if line.starts_with("deleted file mode") {
            file.change = ChangeKind::Delete;
        } else if let Some(from) = line.strip_prefix("rename from ") {
            file.change = ChangeKind::Rename;
            file.old_path = Some(from.trim_end().to_string());
        } else if let Some(to) = line.strip_prefix("rename to ") {
            file.change = ChangeKind::Rename;
            file.new_path = Some(to.trim_end().to_string());
        } else if line.starts_with("Binary files") && line.ends_with("differ")
            || line.starts_with("GIT binary patch")
        {
            file.is_binary = true;
        } else if let Some(path) = strip_marker_path(line, "--- ") {
            file.old_path = path;
            if file.old_path.is_none() {
                file.change = ChangeKind::Add;
            }
        } else if let Some(path) = strip_marker_path(line, "+++ ") {
            file.new_path = path;
            if file.new_path.is_none() {
                file.change = ChangeKind::Delete;
            }
        }
    }
    flush_hunk(&mut current, &mut current_hunk);
    if let Some(file) = current.take() {
        files.push(file);
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn multi_file() -> String {
        [
            "diff --git a/src/a.rs b/src/a.rs",
            "index 1111111..2222222 100644",
            "--- a/src/a.rs",
            "+++ b/src/a.rs",
            "@@ -1,3 +1,4 @@",
            " fn main() {",
            "-    println!(\"old\");",
            "+    println!(\"new\");",
            "+    println!(\"extra\");",
            " }",
            "diff --git a/docs/new.md b/docs/new.md",
            "new file mode 100644",
            "index 0000000..3333333",
            "--- /dev/null",
            "+++ b/docs/new.md",
            "@@ -0,0 +1,2 @@",
            "+# title",
            "+body",
            "diff --git a/gone.txt b/gone.txt",
            "deleted file mode 100644",
            "index 4444444..0000000",
            "--- a/gone.txt",
            "+++ /dev/null",
            "@@ -1,1 +0,0 @@",
            "-bye",
            "diff --git a/logo.png b/logo.png",
            "index 5555555..6666666 100644",
            "Binary files a/logo.png and b/logo.png differ",
        ]
        .join("\n")
            + "\n"
    }

    #[test]
    fn rejects_empty_and_non_git_content() {
        assert!(parse_unified_diff("").is_err());
        assert!(parse_unified_diff("   \n").is_err());
        assert!(parse_unified_diff("From abc Mon Sep 17\n").is_err());
    }

    #[test]
    fn splits_files_and_classifies_changes() {
        let files = parse_unified_diff(&multi_file()).unwrap();
        assert_eq!(files.len(), 4);
        assert_eq!(files[0].change, ChangeKind::Modify);
        assert_eq!(files[0].path(), "src/a.rs");
        assert_eq!(files[1].change, ChangeKind::Add);
        assert_eq!(files[1].path(), "docs/new.md");
        assert_eq!(files[2].change, ChangeKind::Delete);
        assert_eq!(files[2].path(), "gone.txt");
        assert!(files[3].is_binary);
        assert!(!files[3].has_hunks());
    }

    #[test]
    fn hunk_headers_and_lines_are_parsed() {
        let files = parse_unified_diff(&multi_file()).unwrap();
        let hunk = &files[0].hunks[0];
        assert_eq!(
            (hunk.old_start, hunk.old_count, hunk.new_start, hunk.new_count),
            (1, 3, 1, 4)
        );
        assert_eq!(hunk.base_lines(), vec![
            "fn main() {",
            "    println!(\"old\");",
            "}"
        ]);
        assert_eq!(hunk.target_lines(), vec![
            "fn main() {",
            "    println!(\"new\");",
            "    println!(\"extra\");",
            "}"
        ]);
    }

    #[test]
    fn counts_default_to_one_when_omitted() {
        let diff = "diff --git a/f b/f\n--- a/f\n+++ b/f\n@@ -1 +1 @@\n-a\n+b\n";
        let files = parse_unified_diff(diff).unwrap();
        let hunk = &files[0].hunks[0];
        assert_eq!((hunk.old_start, hunk.old_count), (1, 1));
        assert_eq!((hunk.new_start, hunk.new_count), (1, 1));
    }

    #[test]
    fn renames_carry_both_paths() {
        let diff = "diff --git a/old_name.rs b/new_name.rs\n\
similarity index 95%\n\
rename from old_name.rs\n\
rename to new_name.rs\n";
        let files = parse_unified_diff(diff).unwrap();
        assert_eq!(files[0].change, ChangeKind::Rename);
        assert_eq!(files[0].old_path.as_deref(), Some("old_name.rs"));
        assert_eq!(files[0].new_path.as_deref(), Some("new_name.rs"));
    }

    mod apply_to {
        use super::*;

        #[test]
        fn applies_cleanly_on_matching_base() {
            let files = parse_unified_diff(&multi_file()).unwrap();
            let base = "fn main() {\n    println!(\"old\");\n}\n";
            let result = files[0].apply_to(base).unwrap();
            assert_eq!(
                result,
                "fn main() {\n    println!(\"new\");\n    println!(\"extra\");\n}\n"
            );
        }

        #[test]
        fn new_file_applies_on_empty_base() {
            let files = parse_unified_diff(&multi_file()).unwrap();
            let result = files[1].apply_to("").unwrap();
            assert_eq!(result, "# title\nbody\n");
        }

        #[test]
        fn mismatched_base_is_rejected() {
            let files = parse_unified_diff(&multi_file()).unwrap();
            let err = files[0]
                .apply_to("fn main() {\n    println!(\"diverged\");\n}\n")
                .unwrap_err();
            assert_eq!(err.code, crate::error::ErrorCode::InvalidInput);
        }

        #[test]
        fn preserves_unreferenced_context() {
            let diff = "diff --git a/f b/f\n--- a/f\n+++ b/f\n@@ -3,2 +3,2 @@\n line3\n-line4\n+LINE4\n";
            let files = parse_unified_diff(diff).unwrap();
            let result = files[0]
                .apply_to("line1\nline2\nline3\nline4\nline5\n")
                .unwrap();
            assert_eq!(result, "line1\nline2\nline3\nLINE4\nline5\n");
        }
    }
}
