use std::ops::Range;

use crate::error::{Error, Result};

/// Maps every token slot of the ANN engine back to the document owning it.
///
/// Slots are assigned in document order and every document owns exactly
/// `tokens_per_doc` consecutive slots, so `map[slot] == slot / T`.
/// Documents of varying length are not supported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenDocumentMap {
    slots: Vec<i64>,
    tokens_per_doc: usize,
}

impl TokenDocumentMap {
    /// Build the map for `num_docs` documents of `tokens_per_doc` tokens.
    ///
    /// # Examples
    ///
    /// ```
    /// use openqa_index::TokenDocumentMap;
    ///
    /// let map = TokenDocumentMap::build(3, 2);
    /// assert_eq!(map.as_slice(), &[0, 0, 1, 1, 2, 2]);
    /// assert_eq!(map.document(-1).unwrap(), -1);
    /// ```
    pub fn build(num_docs: usize, tokens_per_doc: usize) -> Self {
        let slots = (0..num_docs as i64)
            .flat_map(|pid| std::iter::repeat_n(pid, tokens_per_doc))
            .collect();
        Self {
            slots,
            tokens_per_doc,
        }
    }

    /// Adopt a persisted map after checking it against the table shape.
    pub fn from_slots(
        slots: Vec<i64>,
        num_docs: usize,
        tokens_per_doc: usize,
    ) -> Result<Self> {
        let expected = num_docs * tokens_per_doc;
        if slots.len() != expected {
            return Err(Error::IndexCorruption(format!(
                "token map has {} slots, expected {num_docs} documents x \
                 {tokens_per_doc} tokens = {expected}",
                slots.len()
            )));
        }

        if let Some((slot, &pid)) = slots
            .iter()
            .enumerate()
            .find(|&(slot, &pid)| pid != (slot / tokens_per_doc) as i64)
        {
            return Err(Error::IndexCorruption(format!(
                "token slot {slot} maps to document {pid}, expected {}",
                slot / tokens_per_doc
            )));
        }

        Ok(Self {
            slots,
            tokens_per_doc,
        })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn tokens_per_doc(&self) -> usize {
        self.tokens_per_doc
    }

    pub fn num_docs(&self) -> usize {
        self.slots.len().checked_div(self.tokens_per_doc).unwrap_or(0)
    }

    pub fn as_slice(&self) -> &[i64] {
        &self.slots
    }

    /// Owning document of a slot. The sentinel `-1` maps to `-1`.
    pub fn document(&self, slot: i64) -> Result<i64> {
        if slot < 0 {
            return Ok(-1);
        }
        self.slots.get(slot as usize).copied().ok_or_else(|| {
            Error::IndexCorruption(format!(
                "token slot {slot} is outside the {} indexed slots",
                self.slots.len()
            ))
        })
    }

    pub fn documents(&self, slots: &[i64]) -> Result<Vec<i64>> {
        slots.iter().map(|&slot| self.document(slot)).collect()
    }

    /// Slots owned by a document.
    pub fn slots_of(&self, pid: usize) -> Range<usize> {
        let start = pid * self.tokens_per_doc;
        start..start + self.tokens_per_doc
    }
}
