/// Outcome of a read that may consult several fallible stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<T> {
    Hit(T),
    /// Every store answered and none holds the key.
    Miss,
    /// Nothing was found, but at least one store failed, so absence is not confirmed.
    Unknown,
}

impl<T> Lookup<T> {
    pub fn is_hit(&self) -> bool {
        matches!(self, Lookup::Hit(_))
    }

    pub fn is_miss(&self) -> bool {
        matches!(self, Lookup::Miss)
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Lookup::Unknown)
    }

    pub fn hit(self) -> Option<T> {
        match self {
            Lookup::Hit(value) => Some(value),
            Lookup::Miss | Lookup::Unknown => None,
        }
    }

    pub fn as_ref(&self) -> Lookup<&T> {
        match self {
            Lookup::Hit(value) => Lookup::Hit(value),
            Lookup::Miss => Lookup::Miss,
            Lookup::Unknown => Lookup::Unknown,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Lookup<U> {
        match self {
            Lookup::Hit(value) => Lookup::Hit(f(value)),
            Lookup::Miss => Lookup::Miss,
            Lookup::Unknown => Lookup::Unknown,
        }
    }
}
