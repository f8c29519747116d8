use crate::field::CacheField;

/// Version tag of the field-tiered key layout.
pub const FIELD_KEY_VERSION: &str = "v1";

/// Key of one cached field of a file: `v1:<path>:<field>`.
pub fn field_key(path: &str, field: CacheField) -> String {
    format!("{FIELD_KEY_VERSION}:{path}:{field}")
}

/// Key layout of the tree cache under a namespace prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeKeys {
    root: String,
    dir: String,
    meta: String,
    all: String,
}

impl TreeKeys {
    pub fn new(prefix: &str) -> Self {
        let all = format!("{prefix}:tree:");
        Self {
            root: format!("{all}root:"),
            dir: format!("{all}dir:"),
            meta: format!("{all}meta:"),
            all,
        }
    }

    pub fn root(&self, path: &str) -> String {
        format!("{}{path}", self.root)
    }

    pub fn dir(&self, path: &str) -> String {
        format!("{}{path}", self.dir)
    }

    pub fn meta(&self, path: &str) -> String {
        format!("{}{path}", self.meta)
    }

    /// Directory path encoded in a directory entry key.
    pub fn dir_path<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.dir.as_str())
    }

    pub fn meta_path<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.meta.as_str())
    }

    /// Whether `key` belongs to the tree cache at all.
    pub fn owns(&self, key: &str) -> bool {
        key.starts_with(self.all.as_str())
    }
}
