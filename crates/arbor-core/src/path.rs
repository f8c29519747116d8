/// Normalizes an explorer path.
///
/// Backslashes become `/`, repeated separators collapse, and trailing separators are removed
/// (the root `/` is kept as is).
pub fn normalize_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut prev_sep = false;
    for ch in path.chars() {
        let ch = if ch == '\\' { '/' } else { ch };
        if ch == '/' {
            if prev_sep {
                continue;
            }
            prev_sep = true;
        } else {
            prev_sep = false;
        }
        out.push(ch);
    }
    while out.len() > 1 && out.ends_with('/') {
        out.pop();
    }
    out
}

fn trim_trailing(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() && path.starts_with('/') {
        "/"
    } else {
        trimmed
    }
}

/// Returns the parent of `path`, or `None` for a root (`/` or a single relative segment).
pub fn parent_path(path: &str) -> Option<&str> {
    let trimmed = trim_trailing(path);
    if trimmed == "/" || trimmed.is_empty() {
        return None;
    }
    match trimmed.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&trimmed[..idx]),
        None => None,
    }
}

/// Last path segment (`"c"` for `/a/b/c`).
pub fn file_name(path: &str) -> &str {
    let trimmed = trim_trailing(path);
    match trimmed.rfind('/') {
        Some(idx) if trimmed.len() > 1 => &trimmed[idx + 1..],
        _ => trimmed,
    }
}

/// Non-empty segments of `path`.
pub fn path_segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|segment| !segment.is_empty())
}

pub fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        return name.to_string();
    }
    if parent.ends_with('/') {
        format!("{parent}{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// Returns `true` when `path` lies strictly below `ancestor`.
pub fn is_descendant(path: &str, ancestor: &str) -> bool {
    let ancestor = trim_trailing(ancestor);
    let path = trim_trailing(path);
    if ancestor == "/" {
        return path.len() > 1 && path.starts_with('/');
    }
    path.len() > ancestor.len()
        && path.starts_with(ancestor)
        && path.as_bytes()[ancestor.len()] == b'/'
}

/// Iterator over every ancestor of a path, nearest first.
#[derive(Debug, Clone)]
pub struct Ancestors<'a> {
    next: Option<&'a str>,
}

impl<'a> Iterator for Ancestors<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = parent_path(current);
        Some(current)
    }
}

/// Ancestors of `path` up to (and including) the root, excluding `path` itself.
pub fn ancestors(path: &str) -> Ancestors<'_> {
    Ancestors {
        next: parent_path(path),
    }
}
