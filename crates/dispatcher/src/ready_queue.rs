use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};

use gpu_scheduler_domain::entities::Task;

/// 就绪队列中的排序键：优先级高者在前，同优先级按创建时间先到先得，
/// 避免同优先级任务饿死
#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueKey {
    priority: i32,
    created_at: DateTime<Utc>,
    task_id: String,
}

impl Ord for QueueKey {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| self.created_at.cmp(&other.created_at))
            .then_with(|| self.task_id.cmp(&other.task_id))
    }
}

impl PartialOrd for QueueKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// 待调度任务的内存有序队列，由调度器独占持有。
/// 崩溃恢复时从存储中的pending任务重建。
#[derive(Debug, Default)]
pub struct ReadyQueue {
    ordered: BTreeSet<QueueKey>,
    index: HashMap<String, QueueKey>,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// 入队；同一任务重复入队为no-op
    pub fn enqueue(&mut self, task: &Task) {
        self.enqueue_parts(&task.id, task.priority, task.created_at);
    }

    pub fn enqueue_parts(&mut self, task_id: &str, priority: i32, created_at: DateTime<Utc>) {
        if self.index.contains_key(task_id) {
            return;
        }
        let key = QueueKey {
            priority,
            created_at,
            task_id: task_id.to_string(),
        };
        self.index.insert(task_id.to_string(), key.clone());
        self.ordered.insert(key);
    }

    /// 取出排序最高的就绪任务
    pub fn pop(&mut self) -> Option<String> {
        let key = self.ordered.first()?.clone();
        self.ordered.remove(&key);
        self.index.remove(&key.task_id);
        Some(key.task_id)
    }

    /// 移除指定任务；任务不在队列中时为no-op（幂等）
    pub fn remove(&mut self, task_id: &str) -> bool {
        match self.index.remove(task_id) {
            Some(key) => self.ordered.remove(&key),
            None => false,
        }
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.index.contains_key(task_id)
    }

    /// 按调度顺序快照所有就绪任务ID
    pub fn peek_ready(&self) -> Vec<String> {
        self.ordered.iter().map(|k| k.task_id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}
