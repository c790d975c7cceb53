//! Canonical path handling shared by every backend.
//!
//! Canonical paths use `/` as the only separator, carry no `.` or empty
//! segments and keep a leading `/` only when the input had a root marker.

pub const SEPARATOR: char = '/';

/// Normalizes separators and `.`/`..` segments.
///
/// A `..` with nothing left to pop is kept literally, so `"/.."` stays `"/.."`.
pub fn canonicalize(path: &str) -> String {
    let rooted = path.starts_with(['/', '\\']);
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => match segments.last() {
                Some(&last) if last != ".." => {
                    segments.pop();
                }
                _ => segments.push(".."),
            },
            other => segments.push(other),
        }
    }
    let joined = segments.join("/");
    if rooted { format!("/{joined}") } else { joined }
}

pub fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        return canonicalize(name);
    }
    canonicalize(&format!("{parent}/{name}"))
}

/// Last segment of a canonical path; empty for the root.
pub fn file_name(path: &str) -> &str {
    path.rsplit(SEPARATOR).next().unwrap_or("")
}

pub fn parent(path: &str) -> Option<String> {
    match path.rfind(SEPARATOR) {
        Some(0) if path.len() > 1 => Some("/".to_string()),
        Some(0) => None,
        Some(idx) => Some(path[..idx].to_string()),
        None => None,
    }
}

/// A child name must be a single, non-special segment without control characters.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
        && !name.chars().any(char::is_control)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_parent_segments() {
        assert_eq!(canonicalize("/a/b/../c"), "/a/c");
        assert_eq!(canonicalize("/a/./b/./"), "/a/b");
    }

    #[test]
    fn unifies_mixed_separators_without_adding_root() {
        assert_eq!(canonicalize("a\\b/c"), "a/b/c");
        assert_eq!(canonicalize("\\srv\\share"), "/srv/share");
        assert_eq!(canonicalize("C:\\Users\\me"), "C:/Users/me");
    }

    #[test]
    fn keeps_parent_marker_at_root() {
        assert_eq!(canonicalize("/.."), "/..");
        assert_eq!(canonicalize("/../a"), "/../a");
        assert_eq!(canonicalize("../../a"), "../../a");
        assert_eq!(canonicalize("a/../.."), "..");
    }

    #[test]
    fn handles_degenerate_inputs() {
        assert_eq!(canonicalize(""), "");
        assert_eq!(canonicalize("/"), "/");
        assert_eq!(canonicalize("//"), "/");
        assert_eq!(canonicalize("a/.."), "");
    }

    #[test]
    fn canonicalization_is_idempotent() {
        let samples = [
            "",
            "/",
            "/a/b/../c",
            "a\\b/c",
            "/../x/../../y",
            "./a/./b/",
            "..\\..\\z",
            "C:\\dir\\..\\file.txt",
            "//srv//share///x",
        ];
        for sample in samples {
            let once = canonicalize(sample);
            assert_eq!(canonicalize(&once), once, "input {sample:?}");
        }
    }

    #[test]
    fn joins_and_splits_paths() {
        assert_eq!(join("/", "home"), "/home");
        assert_eq!(join("/home/", "file.txt"), "/home/file.txt");
        assert_eq!(join("", "x"), "x");
        assert_eq!(file_name("/home/file.txt"), "file.txt");
        assert_eq!(file_name("/"), "");
        assert_eq!(parent("/home/file.txt").as_deref(), Some("/home"));
        assert_eq!(parent("/home").as_deref(), Some("/"));
        assert_eq!(parent("/"), None);
        assert_eq!(parent("relative"), None);
    }

    #[test]
    fn validates_child_names() {
        assert!(is_valid_name("report.pdf"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name(".."));
        assert!(!is_valid_name("a/b"));
        assert!(!is_valid_name("a\\b"));
        assert!(!is_valid_name("x\r\nDELE important.txt"));
        assert!(!is_valid_name("tab\there"));
        assert!(is_valid_name("résumé 2024.pdf"));
    }
}
