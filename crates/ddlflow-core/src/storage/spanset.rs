//! Declared key spans and access enforcement.
//!
//! Every operation advertises the spans it reads and writes before it runs.
//! A [`SpanSet`] accumulates those declarations for a transaction and rejects
//! any access that falls outside them.

use super::StorageError;

/// A half-open key range `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Span {
    /// First key (inclusive).
    pub start: Vec<u8>,
    /// End key (exclusive).
    pub end: Vec<u8>,
}

impl Span {
    /// Create a span from explicit bounds.
    pub fn new(start: Vec<u8>, end: Vec<u8>) -> Self {
        Self { start, end }
    }

    /// Span covering exactly one key.
    pub fn key(key: Vec<u8>) -> Self {
        let mut end = key.clone();
        end.push(0);
        Self { start: key, end }
    }

    /// Span covering every key with the given prefix.
    pub fn prefix(prefix: Vec<u8>) -> Self {
        let end = Self::prefix_end(&prefix);
        Self { start: prefix, end }
    }

    /// Smallest key greater than every key carrying `prefix`.
    pub fn prefix_end(prefix: &[u8]) -> Vec<u8> {
        let mut end = prefix.to_vec();
        while let Some(last) = end.pop() {
            if last < u8::MAX {
                end.push(last + 1);
                return end;
            }
        }
        // All 0xff: unbounded above.
        vec![u8::MAX; prefix.len() + 1]
    }

    /// Whether `key` lies in the span.
    pub fn contains_key(&self, key: &[u8]) -> bool {
        key >= self.start.as_slice() && key < self.end.as_slice()
    }

    /// Whether `other` lies entirely within this span.
    pub fn contains(&self, other: &Span) -> bool {
        other.start >= self.start && other.end <= self.end
    }

    /// Whether the two spans share any key.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl std::fmt::Display for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", printable(&self.start), printable(&self.end))
    }
}

/// Render a key with its non-printable bytes hex-escaped.
pub fn printable(key: &[u8]) -> String {
    let mut out = String::with_capacity(key.len());
    for &b in key {
        if b.is_ascii_graphic() {
            out.push(b as char);
        } else {
            out.push_str("\\x");
            out.push_str(&hex::encode([b]));
        }
    }
    out
}

/// Spans an operation reads and writes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessSet {
    /// Spans read.
    pub reads: Vec<Span>,
    /// Spans written (implies read access).
    pub writes: Vec<Span>,
}

impl AccessSet {
    /// An access set that writes the given spans.
    pub fn writes(spans: Vec<Span>) -> Self {
        Self {
            reads: Vec::new(),
            writes: spans,
        }
    }

    /// Add a read span.
    pub fn with_read(mut self, span: Span) -> Self {
        self.reads.push(span);
        self
    }

    /// Add a write span.
    pub fn with_write(mut self, span: Span) -> Self {
        self.writes.push(span);
        self
    }

    /// Whether the two sets could conflict (a write of one overlaps anything
    /// of the other).
    pub fn conflicts_with(&self, other: &AccessSet) -> bool {
        let touches = |writes: &[Span], set: &AccessSet| {
            writes.iter().any(|w| {
                set.reads
                    .iter()
                    .chain(set.writes.iter())
                    .any(|s| w.overlaps(s))
            })
        };
        touches(&self.writes, other) || touches(&other.writes, self)
    }
}

/// Accumulated declarations of one transaction.
#[derive(Debug, Clone, Default)]
pub struct SpanSet {
    reads: Vec<Span>,
    writes: Vec<Span>,
}

impl SpanSet {
    /// Create an empty span set; every access is rejected until declared.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an operation's declared access.
    pub fn add(&mut self, access: &AccessSet) {
        self.reads.extend(access.reads.iter().cloned());
        self.writes.extend(access.writes.iter().cloned());
    }

    /// Number of declared spans.
    pub fn len(&self) -> usize {
        self.reads.len() + self.writes.len()
    }

    /// Check if nothing has been declared.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check a point read.
    pub fn check_read(&self, key: &[u8]) -> Result<(), StorageError> {
        if self
            .reads
            .iter()
            .chain(self.writes.iter())
            .any(|s| s.contains_key(key))
        {
            Ok(())
        } else {
            Err(StorageError::AccessViolation {
                access: "read",
                key: printable(key),
            })
        }
    }

    /// Check a range read.
    pub fn check_read_span(&self, span: &Span) -> Result<(), StorageError> {
        if self
            .reads
            .iter()
            .chain(self.writes.iter())
            .any(|s| s.contains(span))
        {
            Ok(())
        } else {
            Err(StorageError::AccessViolation {
                access: "read",
                key: span.to_string(),
            })
        }
    }

    /// Check a point write.
    pub fn check_write(&self, key: &[u8]) -> Result<(), StorageError> {
        if self.writes.iter().any(|s| s.contains_key(key)) {
            Ok(())
        } else {
            Err(StorageError::AccessViolation {
                access: "write",
                key: printable(key),
            })
        }
    }

    /// Check a range write (e.g. a range deletion).
    pub fn check_write_span(&self, span: &Span) -> Result<(), StorageError> {
        if self.writes.iter().any(|s| s.contains(span)) {
            Ok(())
        } else {
            Err(StorageError::AccessViolation {
                access: "write",
                key: span.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_end() {
        assert_eq!(Span::prefix_end(b"/a/"), b"/a0".to_vec());
        assert_eq!(Span::prefix_end(&[0x01, 0xff]), vec![0x02]);
    }

    #[test]
    fn test_span_containment() {
        let outer = Span::prefix(b"/desc/52/".to_vec());
        let inner = Span::key(b"/desc/52/meta".to_vec());
        assert!(outer.contains(&inner));
        assert!(!inner.contains(&outer));
        assert!(outer.overlaps(&inner));
        assert!(!outer.contains_key(b"/desc/520/meta"));
    }

    #[test]
    fn test_spanset_enforces_declarations() {
        let mut spans = SpanSet::new();
        assert!(spans.check_read(b"/desc/52/meta").is_err());

        spans.add(
            &AccessSet::default()
                .with_read(Span::prefix(b"/data/52/1/".to_vec()))
                .with_write(Span::prefix(b"/data/52/2/".to_vec())),
        );

        assert!(spans.check_read(b"/data/52/1/x").is_ok());
        assert!(spans.check_read(b"/data/52/2/x").is_ok());
        assert!(spans.check_write(b"/data/52/2/x").is_ok());
        assert!(matches!(
            spans.check_write(b"/data/52/1/x"),
            Err(StorageError::AccessViolation { access: "write", .. })
        ));
        assert!(spans
            .check_write_span(&Span::prefix(b"/data/52/".to_vec()))
            .is_err());
    }

    #[test]
    fn test_access_set_conflicts() {
        let a = AccessSet::writes(vec![Span::prefix(b"/data/52/2/".to_vec())]);
        let b = AccessSet::default().with_read(Span::prefix(b"/data/52/".to_vec()));
        let c = AccessSet::default().with_read(Span::prefix(b"/data/53/".to_vec()));
        assert!(a.conflicts_with(&b));
        assert!(!a.conflicts_with(&c));
        assert!(!b.conflicts_with(&c));
    }

    #[test]
    fn test_printable_escapes_binary() {
        assert_eq!(printable(&[b'/', b'a', 0x00]), "/a\\x00");
    }
}
