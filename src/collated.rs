//! Collating iterator: one ordered column stream over many sources
//!
//! Merges the per-source column iterators of a read (memtables first, then
//! segments newest to oldest) into a single stream ordered by name. Each
//! source holds exactly one buffered column; the winner each round is the
//! smallest name in the iteration direction, ties going to the
//! lowest-index source. Exhausted sources are never pulled again. The
//! stream does not deduplicate: same-name columns from different sources
//! come out adjacent, and the consumer reconciles them. A source that
//! yields an error surfaces it immediately and is pulled no further.

use crate::model::Column;
use crate::Result;

pub struct CollatedIterator {
    sources: Vec<Box<dyn Iterator<Item = Result<Column>>>>,
    buffered: Vec<Option<Column>>,
    exhausted: Vec<bool>,
    reversed: bool,
}

impl CollatedIterator {
    pub fn new(sources: Vec<Box<dyn Iterator<Item = Result<Column>>>>, reversed: bool) -> Self {
        let n = sources.len();
        Self {
            sources,
            buffered: (0..n).map(|_| None).collect(),
            exhausted: vec![false; n],
            reversed,
        }
    }
}

impl Iterator for CollatedIterator {
    type Item = Result<Column>;

    fn next(&mut self) -> Option<Result<Column>> {
        for i in 0..self.sources.len() {
            if self.buffered[i].is_none() && !self.exhausted[i] {
                match self.sources[i].next() {
                    Some(Ok(column)) => self.buffered[i] = Some(column),
                    Some(Err(e)) => {
                        self.exhausted[i] = true;
                        return Some(Err(e));
                    }
                    None => self.exhausted[i] = true,
                }
            }
        }

        let mut best: Option<(usize, String)> = None;
        for (i, slot) in self.buffered.iter().enumerate() {
            if let Some(column) = slot {
                let name = column.name();
                // Strict comparison: ties keep the earlier source
                let better = match &best {
                    None => true,
                    Some((_, best_name)) => {
                        if self.reversed {
                            name > best_name.as_str()
                        } else {
                            name < best_name.as_str()
                        }
                    }
                };
                if better {
                    best = Some((i, name.to_string()));
                }
            }
        }

        let (winner, _) = best?;
        self.buffered[winner].take().map(Ok)
    }
}
