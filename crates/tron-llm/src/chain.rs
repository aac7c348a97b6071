use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainEntry {
    pub provider: String,
    pub model: String,
}

impl ChainEntry {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }
}

impl std::fmt::Display for ChainEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.provider, self.model)
    }
}

/// Ordered model preferences with a forward-only cursor.
///
/// The cursor never wraps: advancing past the last entry leaves the chain
/// exhausted until it is explicitly rewound.
#[derive(Clone, Debug)]
pub struct ModelChain {
    entries: Vec<ChainEntry>,
    cursor: usize,
}

impl ModelChain {
    pub fn new(entries: Vec<ChainEntry>) -> Self {
        Self { entries, cursor: 0 }
    }

    pub fn entries(&self) -> &[ChainEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn current(&self) -> Option<&ChainEntry> {
        self.entries.get(self.cursor)
    }

    pub fn is_exhausted(&self) -> bool {
        self.cursor >= self.entries.len()
    }

    /// Move to the next entry. Returns the new current entry, or `None` once
    /// the end is passed.
    pub fn advance(&mut self) -> Option<&ChainEntry> {
        if self.cursor < self.entries.len() {
            self.cursor += 1;
        }
        self.entries.get(self.cursor)
    }

    /// Jump forward to `index`. Moving backwards is only allowed via
    /// [`ModelChain::rewind_to`].
    pub fn seek(&mut self, index: usize) {
        self.cursor = self.cursor.max(index.min(self.entries.len()));
    }

    pub fn rewind_to(&mut self, index: usize) {
        self.cursor = index.min(self.entries.len());
    }

    /// Entries from the cursor onwards, with their chain index.
    pub fn remaining(&self) -> impl Iterator<Item = (usize, &ChainEntry)> {
        self.entries.iter().enumerate().skip(self.cursor)
    }
}
