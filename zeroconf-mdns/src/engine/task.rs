use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::net::SocketAddr;
use std::time::Instant;

use crate::message::Message;
use crate::service::ServiceInfo;
use crate::state::DnsState;

pub(crate) type TaskId = u64;

/// A received query waiting for its response delay to elapse.
#[derive(Debug)]
pub(crate) struct PendingQuery {
    pub(crate) msg: Message,
    pub(crate) src: SocketAddr,
}

/// Work items fired from `handle_timeout`. Prober and Announcer own
/// the entities they drive through task id slots; a stale id means
/// another task took over and the firing is a no-op.
#[derive(Debug)]
pub(crate) enum Task {
    Prober {
        id: TaskId,
        phase: DnsState,
    },
    Announcer {
        id: TaskId,
        phase: DnsState,
    },
    Renewer {
        id: TaskId,
    },
    /// `None` means answer whatever accumulated in the truncated-query
    /// slot by the time this fires.
    Responder {
        query: Option<PendingQuery>,
    },
    Canceler {
        infos: Vec<ServiceInfo>,
        rounds: u8,
    },
    Reaper,
    ServiceInfoResolver {
        key: String,
        rounds: u8,
    },
    ResolveDeadline {
        key: String,
    },
    ServiceResolver {
        service_type: String,
        rounds: u8,
    },
    TypeResolver {
        rounds: u8,
    },
}

#[derive(Debug)]
struct Scheduled {
    at: Instant,
    seq: u64,
    task: Task,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    // Reversed so the earliest deadline sits on top of the max-heap,
    // with insertion order breaking ties.
    fn cmp(&self, other: &Self) -> Ordering {
        (other.at, other.seq).cmp(&(self.at, self.seq))
    }
}

/// Single timer wheel for every engine task.
#[derive(Default, Debug)]
pub(crate) struct Scheduler {
    heap: BinaryHeap<Scheduled>,
    seq: u64,
}

impl Scheduler {
    pub(crate) fn new() -> Self {
        Scheduler::default()
    }

    pub(crate) fn schedule(&mut self, at: Instant, task: Task) {
        let seq = self.seq;
        self.seq += 1;
        self.heap.push(Scheduled { at, seq, task });
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|s| s.at)
    }

    pub(crate) fn pop_due(&mut self, now: Instant) -> Option<Task> {
        if self.heap.peek().is_some_and(|s| s.at <= now) {
            self.heap.pop().map(|s| s.task)
        } else {
            None
        }
    }

    pub(crate) fn clear(&mut self) {
        self.heap.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_tasks_fire_in_deadline_order() {
        let now = Instant::now();
        let mut sched = Scheduler::new();
        sched.schedule(now + Duration::from_millis(250), Task::Reaper);
        sched.schedule(
            now,
            Task::Prober {
                id: 1,
                phase: DnsState::Probing1,
            },
        );

        assert_eq!(sched.next_deadline(), Some(now));
        assert!(matches!(sched.pop_due(now), Some(Task::Prober { id: 1, .. })));
        assert!(sched.pop_due(now).is_none());
        assert!(matches!(
            sched.pop_due(now + Duration::from_secs(1)),
            Some(Task::Reaper)
        ));
        assert!(sched.next_deadline().is_none());
    }

    #[test]
    fn test_same_deadline_keeps_insertion_order() {
        let now = Instant::now();
        let mut sched = Scheduler::new();
        sched.schedule(now, Task::TypeResolver { rounds: 0 });
        sched.schedule(now, Task::TypeResolver { rounds: 1 });

        assert!(matches!(
            sched.pop_due(now),
            Some(Task::TypeResolver { rounds: 0 })
        ));
        assert!(matches!(
            sched.pop_due(now),
            Some(Task::TypeResolver { rounds: 1 })
        ));
    }
}
