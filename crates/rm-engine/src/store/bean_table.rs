//! Keyed in-memory table of one bean kind.

use crate::domain::{Bean, BeanQuery};
use std::collections::BTreeMap;

/// Records of one kind, ordered by primary key so scans are deterministic.
#[derive(Debug)]
pub struct BeanTable<B: Bean> {
    rows: BTreeMap<String, B>,
}

impl<B: Bean> Default for BeanTable<B> {
    fn default() -> Self {
        Self {
            rows: BTreeMap::new(),
        }
    }
}

impl<B: Bean> BeanTable<B> {
    pub fn get(&self, key: &str) -> Option<&B> {
        self.rows.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.rows.contains_key(key)
    }

    /// Insert or overwrite; returns the previous row.
    pub fn put(&mut self, bean: B) -> Option<B> {
        self.rows.insert(bean.key().to_string(), bean)
    }

    pub fn remove(&mut self, key: &str) -> Option<B> {
        self.rows.remove(key)
    }

    /// Put back a prior image (`None` = the row did not exist).
    pub fn restore(&mut self, key: &str, prior: Option<B>) {
        match prior {
            Some(bean) => {
                self.rows.insert(key.to_string(), bean);
            }
            None => {
                self.rows.remove(key);
            }
        }
    }

    /// Keys of rows matching `query`.
    pub fn matching_keys<Q: BeanQuery<B> + ?Sized>(&self, query: &Q) -> Vec<String> {
        self.rows
            .iter()
            .filter(|(_, bean)| query.matches(bean))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Clones of rows matching `query`.
    pub fn matching<Q: BeanQuery<B> + ?Sized>(&self, query: &Q) -> Vec<B> {
        self.rows
            .values()
            .filter(|bean| query.matches(bean))
            .cloned()
            .collect()
    }

    pub fn values(&self) -> impl Iterator<Item = &B> {
        self.rows.values()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
