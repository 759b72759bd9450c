use std::fmt;

/// A collection namespace of the form `<db>.<coll>`.
///
/// The collection name is kept as an offset into the owned string rather than
/// a second allocation or a borrowed pointer.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    full: String,
    coll_start: usize,
}

impl Namespace {
    /// Parse a namespace string. Returns `None` if it contains no `.`.
    /// The collection name is everything after the first `.`.
    pub fn parse(ns: &str) -> Option<Self> {
        let dot = ns.find('.')?;
        Some(Namespace {
            full: ns.to_string(),
            coll_start: dot + 1,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.full
    }

    pub fn db(&self) -> &str {
        &self.full[..self.coll_start - 1]
    }

    pub fn coll(&self) -> &str {
        &self.full[self.coll_start..]
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full)
    }
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Namespace({})", self.full)
    }
}
