/// Closed table of literals an extensible enumeration may take on the wire.
///
/// The table is authoritative both ways: encoding a value outside it fails,
/// and so does decoding one. Matching is exact.
#[derive(Debug, Clone, Copy)]
pub struct Vocabulary {
    name: &'static str,
    literals: &'static [&'static str],
}

/// A literal not present in a vocabulary table.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("'{literal}' is not a known {vocabulary}")]
pub struct UnknownLiteral {
    pub vocabulary: &'static str,
    pub literal: String,
}

impl Vocabulary {
    pub const fn new(name: &'static str, literals: &'static [&'static str]) -> Self {
        Self { name, literals }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn literals(&self) -> &'static [&'static str] {
        self.literals
    }

    pub fn contains(&self, literal: &str) -> bool {
        self.lookup(literal).is_some()
    }

    /// Canonical table entry for `literal`.
    pub fn lookup(&self, literal: &str) -> Option<&'static str> {
        self.literals.iter().copied().find(|known| *known == literal)
    }

    /// Check an in-process value before it goes on the wire.
    pub fn encode(&self, literal: &str) -> Result<&'static str, UnknownLiteral> {
        self.lookup(literal).ok_or_else(|| self.unknown(literal))
    }

    /// Check a literal read from the wire.
    pub fn decode(&self, literal: &str) -> Result<&'static str, UnknownLiteral> {
        self.lookup(literal).ok_or_else(|| self.unknown(literal))
    }

    fn unknown(&self, literal: &str) -> UnknownLiteral {
        UnknownLiteral {
            vocabulary: self.name,
            literal: literal.to_string(),
        }
    }
}
