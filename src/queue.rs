use std::collections::VecDeque;
use std::sync::Mutex;

use crate::model::IdRange;

/// Shared FIFO of chunks drained by the worker pool.
///
/// Filled once before the workers start; afterwards workers only pop. There is
/// no per-worker assignment, so a worker on a fast session simply comes back
/// for more work sooner.
#[derive(Debug, Default)]
pub struct WorkQueue {
    chunks: Mutex<VecDeque<IdRange>>,
}

impl WorkQueue {
    pub fn new(chunks: impl IntoIterator<Item = IdRange>) -> Self {
        Self {
            chunks: Mutex::new(chunks.into_iter().collect()),
        }
    }

    /// Non-blocking pop; `None` means the queue is drained.
    pub fn try_pop(&self) -> Option<IdRange> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<IdRange>> {
        match self.chunks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::*;

    #[test]
    fn pops_in_fifo_order() {
        let queue = WorkQueue::new([IdRange::new(0, 5), IdRange::new(5, 9)]);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.try_pop(), Some(IdRange::new(0, 5)));
        assert_eq!(queue.try_pop(), Some(IdRange::new(5, 9)));
        assert_eq!(queue.try_pop(), None);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn concurrent_consumers_take_each_chunk_once() {
        let queue = Arc::new(WorkQueue::new((0..200).map(|i| IdRange::new(i * 10, i * 10 + 10))));
        let mut join_set = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let queue = Arc::clone(&queue);
            join_set.spawn(async move {
                let mut taken = Vec::new();
                while let Some(chunk) = queue.try_pop() {
                    taken.push(chunk);
                    tokio::task::yield_now().await;
                }
                taken
            });
        }

        let mut seen = HashSet::new();
        while let Some(result) = join_set.join_next().await {
            for chunk in result.unwrap_or_default() {
                assert!(seen.insert(chunk), "chunk {chunk} handed out twice");
            }
        }
        assert_eq!(seen.len(), 200);
    }
}
