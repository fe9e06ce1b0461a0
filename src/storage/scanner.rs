#![forbid(unsafe_code)]

//! Range cursors over a [`BigSortedMap`].
//!
//! A scanner copies the in-range live records of one block per step and
//! releases the block before handing them out. The next step re-seeks from
//! the last key it returned rather than from a remembered block, so a split
//! racing with the scan can at worst make a record show up twice; no record
//! that stayed live is skipped.

use std::collections::VecDeque;

use crate::storage::block::SharedBlock;
use crate::storage::engine::BigSortedMap;
use crate::types::{BigMapError, Result};

/// An owned key/value pair returned by a [`Scanner`].
pub type Entry = (Vec<u8>, Vec<u8>);

/// Cursor over the live records in `[start, stop)`.
pub struct Scanner<'a> {
    engine: &'a BigSortedMap,
    start: Option<Vec<u8>>,
    stop: Option<Vec<u8>>,
    reverse: bool,
    batch: VecDeque<Entry>,
    last: Option<Vec<u8>>,
    done: bool,
}

impl<'a> Scanner<'a> {
    pub(crate) fn open(
        engine: &'a BigSortedMap,
        start: Option<&[u8]>,
        stop: Option<&[u8]>,
        reverse: bool,
    ) -> Result<Option<Self>> {
        if let (Some(start), Some(stop)) = (start, stop) {
            if start >= stop {
                return Ok(None);
            }
        }
        let mut scanner = Self {
            engine,
            start: start.map(<[u8]>::to_vec),
            stop: stop.map(<[u8]>::to_vec),
            reverse,
            batch: VecDeque::new(),
            last: None,
            done: false,
        };
        if !scanner.has_more()? {
            return Ok(None);
        }
        Ok(Some(scanner))
    }

    /// Whether the scanner walks from high keys to low keys.
    pub fn is_reverse(&self) -> bool {
        self.reverse
    }

    /// Returns the next record of a forward scan.
    pub fn next(&mut self) -> Result<Option<Entry>> {
        if self.reverse {
            return Err(BigMapError::Invalid("reverse scanner moves with previous()"));
        }
        self.advance()
    }

    /// Returns the next record of a reverse scan, in descending key order.
    pub fn previous(&mut self) -> Result<Option<Entry>> {
        if !self.reverse {
            return Err(BigMapError::Invalid("forward scanner moves with next()"));
        }
        self.advance()
    }

    /// Whether [`Scanner::next`] would return a record.
    pub fn has_next(&mut self) -> Result<bool> {
        Ok(!self.reverse && self.has_more()?)
    }

    /// Whether [`Scanner::previous`] would return a record.
    pub fn has_previous(&mut self) -> Result<bool> {
        Ok(self.reverse && self.has_more()?)
    }

    /// Lowest record currently in the range, independent of the cursor.
    pub fn first(&self) -> Result<Option<Entry>> {
        self.restart(false).advance()
    }

    /// Highest record currently in the range, independent of the cursor.
    pub fn last(&self) -> Result<Option<Entry>> {
        self.restart(true).advance()
    }

    /// Live records currently in the range, independent of the cursor.
    pub fn count(&self) -> Result<u64> {
        let mut scan = self.restart(false);
        let mut total = 0;
        while scan.advance()?.is_some() {
            total += 1;
        }
        Ok(total)
    }

    fn restart(&self, reverse: bool) -> Scanner<'a> {
        Scanner {
            engine: self.engine,
            start: self.start.clone(),
            stop: self.stop.clone(),
            reverse,
            batch: VecDeque::new(),
            last: None,
            done: false,
        }
    }

    fn advance(&mut self) -> Result<Option<Entry>> {
        if !self.has_more()? {
            return Ok(None);
        }
        let entry = self.batch.pop_front();
        if let Some((key, _)) = &entry {
            self.last = Some(key.clone());
        }
        Ok(entry)
    }

    fn has_more(&mut self) -> Result<bool> {
        while self.batch.is_empty() && !self.done {
            if self.reverse {
                self.fill_backward()?;
            } else {
                self.fill_forward()?;
            }
        }
        Ok(!self.batch.is_empty())
    }

    /// Copies the next non-empty run of records above the cursor.
    ///
    /// Keys below `seek` were examined already. The upper end of a locked
    /// block's range cannot move while the lock is held, so it becomes the
    /// next inclusive seek once the block turns out to hold nothing new.
    fn fill_forward(&mut self) -> Result<()> {
        let (mut seek, mut inclusive) = match &self.last {
            Some(last) => (Some(last.clone()), false),
            None => (self.start.clone(), true),
        };
        loop {
            let located = match &seek {
                Some(key) => self
                    .engine
                    .resolve(|index| index.floor(key), SharedBlock::read),
                None => self.engine.resolve(|index| index.first(), SharedBlock::read),
            };
            let Some(block) = located else {
                self.done = true;
                return Ok(());
            };
            let next = self
                .engine
                .index()
                .higher(&block.entry.anchor)
                .map(|entry| entry.anchor);
            for rec in block.guard.records() {
                let rec = rec?;
                if let Some(seek) = &seek {
                    let before = if inclusive {
                        rec.key < seek.as_slice()
                    } else {
                        rec.key <= seek.as_slice()
                    };
                    if before {
                        continue;
                    }
                }
                if self.stop.as_deref().is_some_and(|stop| rec.key >= stop) {
                    self.done = true;
                    break;
                }
                if !rec.deleted {
                    self.batch.push_back((rec.key.to_vec(), rec.value.to_vec()));
                }
            }
            drop(block);
            if self.done || !self.batch.is_empty() {
                return Ok(());
            }
            let next = next.filter(|next| {
                self.stop
                    .as_deref()
                    .map_or(true, |stop| next.as_slice() < stop)
            });
            let Some(next) = next else {
                self.done = true;
                return Ok(());
            };
            tracing::trace!(target: "bigmap::scanner", "no records in block range, moving right");
            seek = Some(next);
            inclusive = true;
        }
    }

    /// Mirror of [`Scanner::fill_forward`]: everything at or above `bound`
    /// was examined, and a block's anchor bounds what is left below it.
    fn fill_backward(&mut self) -> Result<()> {
        let mut bound = match &self.last {
            Some(last) => Some(last.clone()),
            None => self.stop.clone(),
        };
        loop {
            let located = match &bound {
                Some(key) => self
                    .engine
                    .resolve(|index| index.lower(key), SharedBlock::read),
                None => self.engine.resolve(|index| index.last(), SharedBlock::read),
            };
            let Some(block) = located else {
                self.done = true;
                return Ok(());
            };
            let anchor = block.entry.anchor.clone();
            let mut rows = Vec::new();
            for rec in block.guard.records() {
                let rec = rec?;
                if bound.as_deref().is_some_and(|bound| rec.key >= bound) {
                    break;
                }
                if rec.deleted || self.start.as_deref().is_some_and(|start| rec.key < start) {
                    continue;
                }
                rows.push((rec.key.to_vec(), rec.value.to_vec()));
            }
            drop(block);
            self.batch.extend(rows.into_iter().rev());
            let left_edge = anchor.is_empty()
                || self
                    .start
                    .as_deref()
                    .is_some_and(|start| anchor.as_slice() <= start);
            if left_edge {
                self.done = true;
                return Ok(());
            }
            if !self.batch.is_empty() {
                return Ok(());
            }
            tracing::trace!(target: "bigmap::scanner", "no records in block range, moving left");
            bound = Some(anchor);
        }
    }
}

impl std::fmt::Debug for Scanner<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scanner")
            .field("reverse", &self.reverse)
            .field("buffered", &self.batch.len())
            .field("done", &self.done)
            .finish()
    }
}
