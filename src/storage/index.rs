use crate::catalog::types::{ColumnId, IndexId, RecordId, Row, TableId, Value};
use crate::storage::Direction;
use im::{OrdMap, OrdSet};
use std::ops::Bound;

/// Ordered secondary index over every stored version of a table. Visibility
/// is resolved by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderedIndex {
    pub index_id: IndexId,
    pub table_id: TableId,
    pub columns: Vec<ColumnId>,
    entries: OrdMap<Vec<Value>, OrdSet<RecordId>>,
}

impl OrderedIndex {
    pub fn new(index_id: IndexId, table_id: TableId, columns: Vec<ColumnId>) -> Self {
        Self {
            index_id,
            table_id,
            columns,
            entries: OrdMap::new(),
        }
    }

    pub fn key_for(&self, row: &Row) -> Vec<Value> {
        self.columns.iter().map(|c| row.get(*c).clone()).collect()
    }

    pub fn insert(&mut self, row: &Row, id: RecordId) {
        let key = self.key_for(row);
        let mut ids = self.entries.get(&key).cloned().unwrap_or_default();
        ids.insert(id);
        self.entries.insert(key, ids);
    }

    pub fn remove(&mut self, row: &Row, id: RecordId) {
        let key = self.key_for(row);
        let Some(mut ids) = self.entries.get(&key).cloned() else {
            return;
        };
        ids.remove(&id);
        if ids.is_empty() {
            self.entries.remove(&key);
        } else {
            self.entries.insert(key, ids);
        }
    }

    /// Record ids ordered by key, starting from the first key whose leading
    /// column is at or past `lower` in `direction`. NULL keys are skipped.
    pub fn scan_from(&self, lower: &Value, direction: Direction) -> Vec<RecordId> {
        let probe = vec![lower.clone()];
        let ids = |(key, ids): (&Vec<Value>, &OrdSet<RecordId>)| {
            if key.first().is_none_or(Value::is_null) {
                Vec::new()
            } else {
                ids.iter().copied().collect()
            }
        };
        match direction {
            Direction::Ascending => self
                .entries
                .range((Bound::Included(probe), Bound::Unbounded))
                .flat_map(ids)
                .collect(),
            Direction::Descending => {
                let mut out = Vec::new();
                for (key, set) in self.entries.iter().rev() {
                    if key.first().is_some_and(|v| v > lower) {
                        continue;
                    }
                    out.extend(ids((key, set)));
                }
                out
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(|ids| ids.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
