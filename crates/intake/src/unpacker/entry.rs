use thiserror::Error;

/// A leaf file extracted from the uploaded archive.
#[derive(Debug, Clone)]
pub struct Entry {
    /// Member path inside its immediate container, `/`-separated.
    pub path: String,
    /// Final path component.
    pub name: String,
    pub content: Vec<u8>,
    /// Containers traversed to reach this entry, root archive first. Each
    /// element is the container's member path inside its own parent.
    pub origin: Vec<String>,
    /// Nesting level: members of the root archive are at depth 0.
    pub depth: usize,
}

impl Entry {
    pub fn size(&self) -> u64 {
        self.content.len() as u64
    }

    pub fn display_path(&self) -> String {
        display_path(&self.origin, &self.path)
    }
}

/// A member the walk could not turn into a leaf entry.
#[derive(Debug, Clone)]
pub struct FailedEntry {
    pub path: String,
    pub name: String,
    pub origin: Vec<String>,
    pub depth: usize,
    pub reason: EntryFailure,
}

impl FailedEntry {
    pub fn display_path(&self) -> String {
        display_path(&self.origin, &self.path)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EntryFailure {
    #[error("unreadable member: {0}")]
    Unreadable(String),

    #[error("corrupt nested archive: {0}")]
    CorruptContainer(String),

    #[error("nested archive exceeds maximum depth {limit}")]
    DepthExceeded { limit: usize },

    #[error("decompressed size budget of {limit} bytes exceeded")]
    SizeLimitExceeded { limit: u64 },

    #[error("member path escapes its archive")]
    UnsafePath,
}

#[derive(Debug, Clone)]
pub enum UnpackItem {
    Leaf(Entry),
    Failed(FailedEntry),
}

fn display_path(origin: &[String], path: &str) -> String {
    let mut parts: Vec<&str> = origin.iter().map(String::as_str).collect();
    parts.push(path);
    parts.join(" > ")
}

/// Returns the last `/`-separated component of a member path.
pub fn leaf_name(path: &str) -> &str {
    path.rsplit('/').find(|s| !s.is_empty()).unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_path_joins_origin() {
        let entry = Entry {
            path: "essay.txt".to_string(),
            name: "essay.txt".to_string(),
            content: b"text".to_vec(),
            origin: vec!["session1.zip".to_string(), "S010.zip".to_string()],
            depth: 1,
        };
        assert_eq!(entry.display_path(), "session1.zip > S010.zip > essay.txt");
        assert_eq!(entry.size(), 4);
    }

    #[test]
    fn test_leaf_name() {
        assert_eq!(leaf_name("a/b/c.pdf"), "c.pdf");
        assert_eq!(leaf_name("c.pdf"), "c.pdf");
        assert_eq!(leaf_name("dir/"), "dir");
    }
}
