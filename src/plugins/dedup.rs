//! Collapses immediately-repeated messages.
//!
//! A message is suppressed only when its (time, text, sender, type) signature equals
//! the last emitted one. One forward pass; create a new `Deduplicator` per conversation.

/// Fields compared between consecutive messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub time: String,
    pub text: String,
    pub sender: String,
    pub kind: String,
}

#[derive(Debug, Default)]
pub struct Deduplicator {
    last: Option<Signature>,
    suppressed: usize,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the item should be emitted, and remembers it if so.
    pub fn admit(&mut self, signature: Signature) -> bool {
        if self.last.as_ref() == Some(&signature) {
            self.suppressed += 1;
            return false;
        }
        self.last = Some(signature);
        true
    }

    pub fn suppressed(&self) -> usize {
        self.suppressed
    }

    pub fn reset(&mut self) {
        self.last = None;
        self.suppressed = 0;
    }
}

/// Order-preserving dedup of `items` by the signature `key` extracts.
pub fn dedup_by<T, F>(items: Vec<T>, key: F) -> (Vec<T>, usize)
where
    F: Fn(&T) -> Signature,
{
    let mut dedup = Deduplicator::new();
    let kept = items
        .into_iter()
        .filter(|item| dedup.admit(key(item)))
        .collect();
    (kept, dedup.suppressed())
}
