use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Mutex;

use tokio::sync::Notify;
use tracing::debug;

use super::error::SubmitError;
use super::task::Task;

/// Priority queue of pending tasks plus the open-task ledger that drives
/// drain semantics. A task is "open" from enqueue until `task_done`,
/// which covers queued, claimed, and backoff-scheduled states; `dequeue`
/// only reports exhaustion once the queue is closed and no open task
/// remains.
pub struct TaskQueue {
    inner: Mutex<QueueInner>,
    arrivals: Notify,
    drained: Notify,
    capacity: Option<usize>,
}

struct QueueInner {
    heap: BinaryHeap<QueuedTask>,
    seq: i64,
    front_seq: i64,
    open: usize,
    closed: bool,
}

struct QueuedTask {
    priority: i64,
    seq: i64,
    task: Task,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then lower sequence number
        // (earlier arrival) among equals.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl TaskQueue {
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                heap: BinaryHeap::new(),
                seq: 0,
                front_seq: 0,
                open: 0,
                closed: false,
            }),
            arrivals: Notify::new(),
            drained: Notify::new(),
            capacity,
        }
    }

    pub fn enqueue(&self, task: Task) -> Result<(), SubmitError> {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return Err(SubmitError::Closed);
            }
            if let Some(capacity) = self.capacity {
                if inner.heap.len() >= capacity {
                    return Err(SubmitError::CapacityExceeded);
                }
            }
            inner.seq += 1;
            let seq = inner.seq;
            inner.heap.push(QueuedTask {
                priority: task.priority,
                seq,
                task,
            });
            inner.open += 1;
        }
        self.arrivals.notify_one();
        Ok(())
    }

    /// Re-inserts a task whose attempt never ran (e.g. no session could be
    /// acquired). It goes ahead of newer submissions of equal priority and
    /// the open-task count is untouched.
    pub fn requeue_front(&self, task: Task) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.front_seq -= 1;
            let seq = inner.front_seq;
            inner.heap.push(QueuedTask {
                priority: task.priority,
                seq,
                task,
            });
        }
        self.arrivals.notify_one();
    }

    /// Re-inserts a task for another attempt after backoff. Ordering
    /// relative to newer submissions is not preserved.
    pub fn requeue(&self, task: Task) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.seq += 1;
            let seq = inner.seq;
            inner.heap.push(QueuedTask {
                priority: task.priority,
                seq,
                task,
            });
        }
        self.arrivals.notify_one();
    }

    /// Waits for the next task. Returns `None` once the queue is closed
    /// and every open task has reached a terminal outcome, so callers can
    /// exit without stranding in-flight retries.
    pub async fn dequeue(&self) -> Option<Task> {
        loop {
            let notified = self.arrivals.notified();
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(entry) = inner.heap.pop() {
                    return Some(entry.task);
                }
                if inner.closed && inner.open == 0 {
                    drop(inner);
                    // Cascade so every other blocked dequeuer also exits.
                    self.arrivals.notify_one();
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Retires one open task. Called exactly once per terminal outcome.
    pub fn task_done(&self) {
        let (idle, closed) = {
            let mut inner = self.inner.lock().unwrap();
            inner.open = inner.open.saturating_sub(1);
            (inner.open == 0, inner.closed)
        };
        if idle {
            self.drained.notify_one();
            if closed {
                self.arrivals.notify_one();
            }
        }
    }

    /// Stops accepting submissions. Requeues of in-flight tasks are still
    /// honored; blocked dequeuers wake to re-check the exit condition.
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.closed = true;
        }
        debug!("task queue closed to new submissions");
        self.arrivals.notify_one();
        self.drained.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn open_tasks(&self) -> usize {
        self.inner.lock().unwrap().open
    }

    /// Completes once the queue is closed and no task remains open.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.drained.notified();
            {
                let inner = self.inner.lock().unwrap();
                if inner.closed && inner.open == 0 {
                    drop(inner);
                    self.drained.notify_one();
                    return;
                }
            }
            notified.await;
        }
    }

    /// Empties the queue, retiring each removed task. Used by shutdown to
    /// resolve never-started tasks.
    pub fn drain_remaining(&self) -> Vec<Task> {
        let (tasks, idle, closed) = {
            let mut inner = self.inner.lock().unwrap();
            let mut tasks = Vec::with_capacity(inner.heap.len());
            while let Some(entry) = inner.heap.pop() {
                tasks.push(entry.task);
            }
            inner.open = inner.open.saturating_sub(tasks.len());
            (tasks, inner.open == 0, inner.closed)
        };
        if idle {
            self.drained.notify_one();
            if closed {
                self.arrivals.notify_one();
            }
        }
        tasks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn task(id: &str, priority: i64) -> Task {
        Task::with_id(id, "https://example.com").priority(priority)
    }

    #[tokio::test]
    async fn fifo_among_equal_priority() {
        let queue = TaskQueue::new(None);
        queue.enqueue(task("a", 0)).unwrap();
        queue.enqueue(task("b", 0)).unwrap();
        queue.enqueue(task("c", 0)).unwrap();
        assert_eq!(queue.dequeue().await.unwrap().id, "a");
        assert_eq!(queue.dequeue().await.unwrap().id, "b");
        assert_eq!(queue.dequeue().await.unwrap().id, "c");
    }

    #[tokio::test]
    async fn higher_priority_dequeues_first() {
        let queue = TaskQueue::new(None);
        queue.enqueue(task("low", 0)).unwrap();
        queue.enqueue(task("high", 10)).unwrap();
        queue.enqueue(task("mid", 5)).unwrap();
        assert_eq!(queue.dequeue().await.unwrap().id, "high");
        assert_eq!(queue.dequeue().await.unwrap().id, "mid");
        assert_eq!(queue.dequeue().await.unwrap().id, "low");
    }

    #[tokio::test]
    async fn requeue_front_goes_ahead_of_newer_submissions() {
        let queue = TaskQueue::new(None);
        queue.enqueue(task("first", 0)).unwrap();
        let claimed = queue.dequeue().await.unwrap();
        queue.enqueue(task("second", 0)).unwrap();
        queue.requeue_front(claimed);
        assert_eq!(queue.dequeue().await.unwrap().id, "first");
        assert_eq!(queue.dequeue().await.unwrap().id, "second");
    }

    #[test]
    fn capacity_bound_is_enforced() {
        let queue = TaskQueue::new(Some(2));
        queue.enqueue(task("a", 0)).unwrap();
        queue.enqueue(task("b", 0)).unwrap();
        assert!(matches!(
            queue.enqueue(task("c", 0)),
            Err(SubmitError::CapacityExceeded)
        ));
    }

    #[test]
    fn enqueue_after_close_is_rejected() {
        let queue = TaskQueue::new(None);
        queue.close();
        assert!(matches!(
            queue.enqueue(task("late", 0)),
            Err(SubmitError::Closed)
        ));
    }

    #[tokio::test]
    async fn dequeue_returns_none_once_closed_and_drained() {
        let queue = Arc::new(TaskQueue::new(None));
        queue.enqueue(task("only", 0)).unwrap();
        let claimed = queue.dequeue().await.unwrap();
        assert_eq!(claimed.id, "only");

        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue().await })
        };
        queue.close();
        // Still one open task: the waiter must keep blocking in case the
        // claimed task gets requeued.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        queue.task_done();
        assert!(waiter.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn requeue_after_close_reaches_a_dequeuer() {
        let queue = Arc::new(TaskQueue::new(None));
        queue.enqueue(task("retry-me", 0)).unwrap();
        let claimed = queue.dequeue().await.unwrap();
        queue.close();
        queue.requeue(claimed);
        let again = queue.dequeue().await.unwrap();
        assert_eq!(again.id, "retry-me");
    }

    #[tokio::test]
    async fn wait_idle_completes_after_last_outcome() {
        let queue = Arc::new(TaskQueue::new(None));
        queue.enqueue(task("a", 0)).unwrap();
        let _ = queue.dequeue().await.unwrap();
        queue.close();

        let idle = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.wait_idle().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!idle.is_finished());
        queue.task_done();
        idle.await.unwrap();
    }

    #[test]
    fn drain_remaining_retires_queued_tasks() {
        let queue = TaskQueue::new(None);
        queue.enqueue(task("a", 0)).unwrap();
        queue.enqueue(task("b", 1)).unwrap();
        queue.close();
        let remaining = queue.drain_remaining();
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining[0].id, "b");
        assert_eq!(queue.open_tasks(), 0);
    }
}
