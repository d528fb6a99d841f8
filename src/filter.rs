//! Query filters: which columns of a row a read wants
//!
//! Three shapes: everything (`Identity`), an explicit name set (`Names`),
//! or a contiguous name range with a direction and a live-column budget
//! (`Slice`). A filter knows how to cut an iterator from a memtable
//! version and from an on-disk row, and how to fold the collated stream of
//! all versions into a result family.

use crate::model::{Column, ColumnFamily, SuperColumn};
use crate::sstable::{NamesIterator, RowColumns, SSTableReader, SliceIterator};
use crate::Result;
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryFilter {
    /// Every column. Equivalent to an unbounded forward slice.
    Identity,
    /// Exactly the named columns.
    Names(BTreeSet<String>),
    /// Columns from `start` toward `finish`, at most `count` live ones.
    /// Empty bounds mean "from the first name" / "to the last name" in the
    /// iteration direction.
    Slice {
        start: String,
        finish: String,
        reversed: bool,
        count: usize,
    },
}

impl QueryFilter {
    pub fn identity() -> Self {
        QueryFilter::Identity
    }

    pub fn names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        QueryFilter::Names(names.into_iter().map(Into::into).collect())
    }

    pub fn slice(
        start: impl Into<String>,
        finish: impl Into<String>,
        reversed: bool,
        count: usize,
    ) -> Self {
        QueryFilter::Slice {
            start: start.into(),
            finish: finish.into(),
            reversed,
            count,
        }
    }

    pub fn is_reversed(&self) -> bool {
        matches!(self, QueryFilter::Slice { reversed: true, .. })
    }

    /// Columns of a memtable version, ordered and bounded per the filter.
    pub fn memtable_columns(&self, cf: &ColumnFamily) -> Vec<Column> {
        match self {
            QueryFilter::Identity => cf.columns().cloned().collect(),
            QueryFilter::Names(names) => names
                .iter()
                .filter_map(|name| cf.column(name))
                .cloned()
                .collect(),
            QueryFilter::Slice {
                start, reversed, ..
            } => {
                if *reversed {
                    cf.columns()
                        .rev()
                        .filter(|c| start.is_empty() || c.name() <= start.as_str())
                        .cloned()
                        .collect()
                } else {
                    cf.columns()
                        .filter(|c| start.is_empty() || c.name() >= start.as_str())
                        .cloned()
                        .collect()
                }
            }
        }
    }

    /// Columns of an on-disk row, with the row's deletion stamps.
    pub fn sstable_columns(
        &self,
        reader: &SSTableReader,
        decorated_key: &str,
    ) -> Result<Option<RowColumns>> {
        let Some(handle) = reader.open_row(decorated_key)? else {
            return Ok(None);
        };
        let local_deletion_time = handle.prelude.local_deletion_time;
        let marked_for_delete_at = handle.prelude.marked_for_delete_at;

        let columns: Box<dyn Iterator<Item = Result<Column>>> = match self {
            QueryFilter::Identity => Box::new(SliceIterator::new(handle, "", false)?),
            QueryFilter::Names(names) => Box::new(NamesIterator::new(handle, names)?),
            QueryFilter::Slice {
                start, reversed, ..
            } => Box::new(SliceIterator::new(handle, start.clone(), *reversed)?),
        };
        Ok(Some(RowColumns {
            local_deletion_time,
            marked_for_delete_at,
            columns,
        }))
    }

    /// Fold a collated column stream into `result`.
    ///
    /// Consecutive same-name columns are versions from different sources
    /// and reconcile into one before any decision is made. A column is
    /// *live* when it is not a tombstone and not shadowed by the result's
    /// family-level deletion stamp; folding stops once `count` live
    /// columns are in, or a name crosses the finish bound. Tombstones not
    /// yet past the GC horizon are kept so they keep suppressing older
    /// values elsewhere. A source error fails the whole read; a partial
    /// result would silently misreport deletions.
    pub fn collect_columns(
        &self,
        result: &mut ColumnFamily,
        iter: impl Iterator<Item = Result<Column>>,
        gc_before: i32,
    ) -> Result<()> {
        let (finish, reversed, count) = match self {
            QueryFilter::Slice {
                finish,
                reversed,
                count,
                ..
            } => (finish.as_str(), *reversed, *count),
            _ => ("", false, usize::MAX),
        };

        let mut live = 0usize;
        let mut iter = iter.peekable();
        while let Some(next) = iter.next() {
            let mut column = next?;
            while iter
                .peek()
                .is_some_and(|next| matches!(next, Ok(c) if c.name() == column.name()))
            {
                match iter.next() {
                    Some(Ok(version)) => column = column.reconcile(version),
                    _ => break,
                }
            }

            if !finish.is_empty() {
                let past_finish = if reversed {
                    column.name() < finish
                } else {
                    column.name() > finish
                };
                if past_finish {
                    break;
                }
            }

            let relevant = !result.is_marked_for_delete()
                || column.most_recent_change_at() > result.marked_for_delete_at;
            let is_live = !column.is_tombstone() && relevant;
            let keep =
                relevant && (!column.is_tombstone() || column.local_deletion_time() > gc_before);

            if keep {
                result.add_column(column);
            }
            if is_live {
                live += 1;
                if live >= count {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Apply this filter one level down, to the cells of a super column.
    /// Cells shadowed by the super column's deletion stamp or past the GC
    /// horizon are dropped along the way.
    pub fn filter_super_column(&self, sc: &SuperColumn, gc_before: i32) -> SuperColumn {
        let mut filtered = SuperColumn::new(sc.name.clone());
        filtered.marked_for_delete_at = sc.marked_for_delete_at;
        filtered.local_deletion_time = sc.local_deletion_time;

        let (start, finish, reversed, count) = match self {
            QueryFilter::Slice {
                start,
                finish,
                reversed,
                count,
            } => (start.as_str(), finish.as_str(), *reversed, *count),
            _ => ("", "", false, usize::MAX),
        };

        let mut live = 0usize;
        let cells: Vec<_> = if reversed {
            sc.cells().rev().cloned().collect()
        } else {
            sc.cells().cloned().collect()
        };
        for cell in cells {
            if let QueryFilter::Names(names) = self {
                if !names.contains(&cell.name) {
                    continue;
                }
            }
            if !start.is_empty() {
                let before = if reversed {
                    cell.name.as_str() > start
                } else {
                    cell.name.as_str() < start
                };
                if before {
                    continue;
                }
            }
            if !finish.is_empty() {
                let past = if reversed {
                    cell.name.as_str() < finish
                } else {
                    cell.name.as_str() > finish
                };
                if past {
                    break;
                }
            }

            let relevant = cell.timestamp > sc.marked_for_delete_at;
            let is_live = !cell.deleted && relevant;
            if relevant && (!cell.deleted || cell.local_deletion_time > gc_before) {
                filtered.insert(cell);
            }
            if is_live {
                live += 1;
                if live >= count {
                    break;
                }
            }
        }
        filtered
    }
}
