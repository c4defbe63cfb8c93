use crate::error::{Result, RichnessError};
use log::debug;

/// One contiguous slice of the species list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch<'a, T> {
    /// Position of the batch in the plan
    pub index: usize,
    /// Start offset within the original list; names the checkpoint
    pub offset: usize,
    pub members: &'a [T],
}

impl<'a, T> Batch<'a, T> {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

pub struct BatchPlan<'a, T> {
    items: &'a [T],
    interval: usize,
    pub num_batches: usize,
}

impl<'a, T> BatchPlan<'a, T> {
    pub fn new(items: &'a [T], interval: usize) -> Result<Self> {
        if interval == 0 {
            return Err(RichnessError::InvalidInterval(interval));
        }

        // Ceiling division
        let num_batches = (items.len() + interval - 1) / interval;

        debug!(
            "BatchPlan: {} items, interval={} → {} batches",
            items.len(),
            interval,
            num_batches
        );

        Ok(Self {
            items,
            interval,
            num_batches,
        })
    }

    pub fn interval(&self) -> usize {
        self.interval
    }

    pub fn iter(&self) -> BatchIterator<'_, 'a, T> {
        BatchIterator::new(self)
    }

    pub fn get_batch(&self, batch_idx: usize) -> Option<Batch<'a, T>> {
        if batch_idx >= self.num_batches {
            return None;
        }

        let offset = batch_idx * self.interval;
        let end = (offset + self.interval).min(self.items.len());

        Some(Batch {
            index: batch_idx,
            offset,
            members: &self.items[offset..end],
        })
    }
}

pub struct BatchIterator<'p, 'a, T> {
    plan: &'p BatchPlan<'a, T>,
    current_idx: usize,
}

impl<'p, 'a, T> BatchIterator<'p, 'a, T> {
    fn new(plan: &'p BatchPlan<'a, T>) -> Self {
        Self {
            plan,
            current_idx: 0,
        }
    }
}

impl<'p, 'a, T> Iterator for BatchIterator<'p, 'a, T> {
    type Item = Batch<'a, T>;

    fn next(&mut self) -> Option<Self::Item> {
        let batch = self.plan.get_batch(self.current_idx)?;
        self.current_idx += 1;
        Some(batch)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.plan.num_batches.saturating_sub(self.current_idx);
        (remaining, Some(remaining))
    }
}
