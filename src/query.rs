//! Query pools written by begin/end query commands.

use crate::error::Error;
use parking_lot::Mutex;
use std::{
    fmt::{self, Debug},
    ops::Range,
    sync::Arc,
    time::Instant,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Deserialize)]
pub enum QueryType {
    /// Nanoseconds elapsed between the begin and end query commands.
    Duration,
}

#[derive(Clone, Copy, Debug, Default)]
struct Slot {
    start: Option<Instant>,
    result: Option<u64>,
}

struct QueryPoolInner {
    kind: QueryType,
    slots: Mutex<Vec<Slot>>,
}

/** A pool of query slots.

Cloning yields another handle to the same pool. */
#[derive(Clone)]
pub struct QueryPool {
    inner: Arc<QueryPoolInner>,
}

impl QueryPool {
    pub fn new(kind: QueryType, count: usize) -> Result<Self, Error> {
        if count == 0 {
            return Err(Error::InvalidValue);
        }
        let mut slots = Vec::new();
        slots.try_reserve_exact(count)?;
        slots.resize(count, Slot::default());
        Ok(Self {
            inner: Arc::new(QueryPoolInner {
                kind,
                slots: Mutex::new(slots),
            }),
        })
    }
    pub fn kind(&self) -> QueryType {
        self.inner.kind
    }
    pub fn len(&self) -> usize {
        self.inner.slots.lock().len()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    pub(crate) fn check_range(&self, index: usize, count: usize) -> Result<Range<usize>, Error> {
        let end = index.checked_add(count).ok_or(Error::InvalidValue)?;
        if count == 0 || end > self.len() {
            return Err(Error::InvalidValue);
        }
        Ok(index..end)
    }
    pub(crate) fn begin(&self, index: usize, count: usize) -> Result<(), Error> {
        let range = self.check_range(index, count)?;
        let now = Instant::now();
        for slot in &mut self.inner.slots.lock()[range] {
            slot.start = Some(now);
            slot.result = None;
        }
        Ok(())
    }
    pub(crate) fn end(&self, index: usize, count: usize) -> Result<(), Error> {
        let range = self.check_range(index, count)?;
        let now = Instant::now();
        for slot in &mut self.inner.slots.lock()[range] {
            let start = slot.start.take().ok_or(Error::InvalidValue)?;
            slot.result = Some(now.duration_since(start).as_nanos() as u64);
        }
        Ok(())
    }
    pub(crate) fn reset(&self, index: usize, count: usize) -> Result<(), Error> {
        let range = self.check_range(index, count)?;
        for slot in &mut self.inner.slots.lock()[range] {
            *slot = Slot::default();
        }
        Ok(())
    }
    /// Results of `count` slots from `index`, `None` where no result is available.
    pub fn results(&self, index: usize, count: usize) -> Result<Vec<Option<u64>>, Error> {
        let range = self.check_range(index, count)?;
        Ok(self.inner.slots.lock()[range]
            .iter()
            .map(|slot| slot.result)
            .collect())
    }
}

impl PartialEq for QueryPool {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for QueryPool {}

impl Debug for QueryPool {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("QueryPool")
            .field("kind", &self.inner.kind)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_query() -> Result<(), Error> {
        let pool = QueryPool::new(QueryType::Duration, 4)?;
        assert_eq!(pool.results(0, 4)?, [None::<u64>; 4]);
        pool.begin(1, 2)?;
        pool.end(1, 2)?;
        let results = pool.results(0, 4)?;
        assert!(results[0].is_none() && results[3].is_none());
        assert!(results[1].is_some() && results[2].is_some());
        pool.reset(0, 4)?;
        assert_eq!(pool.results(0, 4)?, [None::<u64>; 4]);
        assert_eq!(pool.end(0, 1), Err(Error::InvalidValue));
        assert_eq!(pool.results(3, 2), Err(Error::InvalidValue));
        assert_eq!(QueryPool::new(QueryType::Duration, 0).err(), Some(Error::InvalidValue));
        Ok(())
    }
}
