use serde::{Deserialize, Serialize};
use std::{borrow::Borrow, fmt, str::FromStr};

/// A resource identifier.
///
/// RIDs are opaque dotted strings (`"example.model"`, `"library.book.42"`,
/// possibly with a query part). The client never interprets them beyond
/// using them as cache keys and splitting on `.` for pattern matching.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Rid(String);

impl Rid {
    /// Creates a RID from anything string-like.
    pub fn new(rid: impl Into<String>) -> Self {
        Self(rid.into())
    }

    /// The RID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for the empty RID, which no valid resource may use.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The dot-separated segments of the RID.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }
}

impl fmt::Display for Rid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Rid {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Rid {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<Rid> for String {
    fn from(rid: Rid) -> Self {
        rid.0
    }
}

impl AsRef<str> for Rid {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// Lets `HashMap<Rid, _>` be indexed by `&str`.
impl Borrow<str> for Rid {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Thrown when a resource-ID glob pattern cannot be parsed.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid resource pattern: {pattern}: {reason}")]
pub struct InvalidPattern {
    /// The offending pattern string.
    pub pattern: String,
    /// Why it was rejected.
    pub reason: &'static str,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Seg {
    Literal(String),
    // `*`, exactly one segment
    AnyOne,
    // `>`, one or more trailing segments
    Tail,
}

/// A resource-ID glob pattern.
///
/// Patterns use the RES subject syntax: `*` matches exactly one segment,
/// and a trailing `>` matches one or more remaining segments.
/// `"library.book.*"` matches `"library.book.42"`;
/// `"library.>"` matches both.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pattern {
    segments: Vec<Seg>,
}

impl Pattern {
    /// Parses a pattern string.
    pub fn parse(pattern: &str) -> Result<Self, InvalidPattern> {
        let err = |reason| InvalidPattern { pattern: pattern.to_owned(), reason };
        if pattern.is_empty() {
            return Err(err("pattern is empty"));
        }
        let raw: Vec<&str> = pattern.split('.').collect();
        let mut segments = Vec::with_capacity(raw.len());
        for (i, seg) in raw.iter().enumerate() {
            match *seg {
                "" => return Err(err("empty segment")),
                "*" => segments.push(Seg::AnyOne),
                ">" => {
                    if i + 1 != raw.len() {
                        return Err(err("`>` is only allowed as the last segment"));
                    }
                    segments.push(Seg::Tail);
                }
                lit => segments.push(Seg::Literal(lit.to_owned())),
            }
        }
        Ok(Self { segments })
    }

    /// True if the pattern matches the RID.
    pub fn matches(&self, rid: &Rid) -> bool {
        let mut rid_segs = rid.segments();
        for seg in &self.segments {
            match seg {
                Seg::Tail => {
                    // validated to be last; matches one or more segments
                    return rid_segs.next().is_some();
                }
                Seg::AnyOne => {
                    if rid_segs.next().is_none() {
                        return false;
                    }
                }
                Seg::Literal(lit) => match rid_segs.next() {
                    Some(s) if s == lit => {}
                    _ => return false,
                },
            }
        }
        rid_segs.next().is_none()
    }

    /// True if `self` is a more specific pattern than `other`.
    ///
    /// Compared segment by segment: a literal beats `*`, which beats `>`.
    /// The first differing segment decides.
    pub fn more_specific_than(&self, other: &Pattern) -> bool {
        fn rank(seg: Option<&Seg>) -> u8 {
            match seg {
                Some(Seg::Literal(_)) => 3,
                Some(Seg::AnyOne) => 2,
                Some(Seg::Tail) => 1,
                None => 0,
            }
        }
        let len = self.segments.len().max(other.segments.len());
        for i in 0..len {
            let a = rank(self.segments.get(i));
            let b = rank(other.segments.get(i));
            if a != b {
                return a > b;
            }
        }
        false
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, seg) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            match seg {
                Seg::Literal(lit) => f.write_str(lit)?,
                Seg::AnyOne => f.write_str("*")?,
                Seg::Tail => f.write_str(">")?,
            }
        }
        Ok(())
    }
}

impl FromStr for Pattern {
    type Err = InvalidPattern;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
