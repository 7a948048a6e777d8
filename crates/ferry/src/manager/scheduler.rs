//! Bookkeeping for queued and running downloads.
//!
//! One [`TaskEntry`] exists per URL while a download is queued or running;
//! every `ensure` for that URL subscribes to the same outcome channel.
//! Callers arriving while a cancelled download is still winding down get a
//! successor task instead, queued once the cancelled one has finished.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::DownloadError;
use crate::progress::{Progress, ProgressSink};

/// Final result of a download, shared by every attached caller.
pub(crate) type Outcome = Option<Result<(), DownloadError>>;

/// Progress sinks attached to one download.
#[derive(Clone, Default)]
pub(crate) struct SinkSet {
    sinks: Arc<Mutex<Vec<ProgressSink>>>,
}

impl SinkSet {
    pub(crate) fn push(&self, sink: ProgressSink) {
        self.sinks.lock().push(sink);
    }

    pub(crate) fn emit(&self, progress: Progress) {
        // Clone out so sinks run without the lock held.
        let sinks = self.sinks.lock().clone();
        for sink in sinks {
            sink(progress);
        }
    }

    /// A single sink forwarding to every attached one.
    pub(crate) fn as_sink(&self) -> ProgressSink {
        let set = self.clone();
        Arc::new(move |progress| set.emit(progress))
    }
}

pub(crate) struct TaskEntry {
    pub id: u64,
    pub outcome: watch::Sender<Outcome>,
    pub sinks: SinkSet,
    pub cancel: CancellationToken,
    pub started: bool,
}

impl TaskEntry {
    fn subscribe(&self, sink: Option<ProgressSink>) -> watch::Receiver<Outcome> {
        if let Some(sink) = sink {
            self.sinks.push(sink);
        }
        self.outcome.subscribe()
    }
}

/// A task handed to a worker.
pub(crate) struct StartedTask {
    pub id: u64,
    pub url: String,
    pub sinks: SinkSet,
    pub cancel: CancellationToken,
}

#[derive(Default)]
pub(crate) struct SchedulerState {
    queue: VecDeque<String>,
    tasks: HashMap<String, TaskEntry>,
    /// Follow-up downloads waiting for a cancelled task of the same URL.
    successors: HashMap<String, TaskEntry>,
    active: usize,
    next_id: u64,
}

impl SchedulerState {
    /// Subscribe to the download of `url`, queueing a new task if none exists.
    /// The flag tells whether a task was created.
    pub(crate) fn attach(
        &mut self,
        url: &str,
        sink: Option<ProgressSink>,
    ) -> (watch::Receiver<Outcome>, bool) {
        let winding_down = match self.tasks.get(url) {
            Some(task) if !task.cancel.is_cancelled() => {
                return (task.subscribe(sink), false);
            }
            Some(_) => true,
            None => false,
        };

        if winding_down {
            if let Some(next) = self.successors.get(url) {
                return (next.subscribe(sink), false);
            }
            let (entry, receiver) = self.new_entry(sink);
            self.successors.insert(url.to_owned(), entry);
            return (receiver, true);
        }

        let (entry, receiver) = self.new_entry(sink);
        self.tasks.insert(url.to_owned(), entry);
        self.queue.push_back(url.to_owned());
        (receiver, true)
    }

    fn new_entry(&mut self, sink: Option<ProgressSink>) -> (TaskEntry, watch::Receiver<Outcome>) {
        let (outcome, receiver) = watch::channel(None);
        let sinks = SinkSet::default();
        if let Some(sink) = sink {
            sinks.push(sink);
        }
        self.next_id += 1;
        let entry = TaskEntry {
            id: self.next_id,
            outcome,
            sinks,
            cancel: CancellationToken::new(),
            started: false,
        };
        (entry, receiver)
    }

    /// Pop queued tasks in FIFO order while fewer than `limit` are running.
    pub(crate) fn start_ready(&mut self, limit: usize) -> Vec<StartedTask> {
        let mut started = Vec::new();
        while self.active < limit {
            let Some(url) = self.queue.pop_front() else {
                break;
            };
            let Some(task) = self.tasks.get_mut(&url) else {
                continue;
            };
            task.started = true;
            self.active += 1;
            started.push(StartedTask {
                id: task.id,
                sinks: task.sinks.clone(),
                cancel: task.cancel.clone(),
                url,
            });
        }
        started
    }

    /// Release the slot of a finished task and hand back its entry. A waiting
    /// successor for the same URL joins the back of the queue.
    pub(crate) fn finish(&mut self, url: &str, id: u64) -> Option<TaskEntry> {
        self.active = self.active.saturating_sub(1);
        let finished = match self.tasks.get(url) {
            Some(task) if task.id == id => self.tasks.remove(url),
            _ => return None,
        };
        if let Some(next) = self.successors.remove(url) {
            self.tasks.insert(url.to_owned(), next);
            self.queue.push_back(url.to_owned());
        }
        finished
    }

    /// Remove a task that has not started yet, either queued or waiting on a
    /// cancelled predecessor.
    pub(crate) fn take_queued(&mut self, url: &str) -> Option<TaskEntry> {
        if let Some(next) = self.successors.remove(url) {
            return Some(next);
        }
        match self.tasks.get(url) {
            Some(task) if !task.started => {
                self.queue.retain(|queued| queued != url);
                self.tasks.remove(url)
            }
            _ => None,
        }
    }

    pub(crate) fn get(&self, url: &str) -> Option<&TaskEntry> {
        self.tasks.get(url)
    }

    pub(crate) fn queued_len(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn active_len(&self) -> usize {
        self.active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_deduplicates_and_starts_in_order() {
        let mut state = SchedulerState::default();
        let (_a, created_a) = state.attach("a", None);
        let (_a2, created_a2) = state.attach("a", None);
        let (_b, _) = state.attach("b", None);
        let (_c, _) = state.attach("c", None);
        assert!(created_a);
        assert!(!created_a2);
        assert_eq!(state.queued_len(), 3);

        let started: Vec<String> = state.start_ready(2).into_iter().map(|t| t.url).collect();
        assert_eq!(started, vec!["a", "b"]);
        assert_eq!(state.active_len(), 2);
        assert!(state.start_ready(2).is_empty());

        let id = state.get("a").unwrap().id;
        assert!(state.finish("a", id).is_some());
        let started: Vec<String> = state.start_ready(2).into_iter().map(|t| t.url).collect();
        assert_eq!(started, vec!["c"]);
    }

    #[test]
    fn only_queued_tasks_can_be_taken() {
        let mut state = SchedulerState::default();
        state.attach("a", None);
        state.attach("b", None);
        state.start_ready(1);

        assert!(state.take_queued("a").is_none());
        assert!(state.take_queued("b").is_some());
        assert_eq!(state.queued_len(), 0);
        assert!(state.get("b").is_none());
    }

    #[test]
    fn cancelled_task_gets_a_successor_after_it_finishes() {
        let mut state = SchedulerState::default();
        state.attach("a", None);
        let first = state.start_ready(2).remove(0);
        first.cancel.cancel();

        let (_next, created) = state.attach("a", None);
        let (_next2, created2) = state.attach("a", None);
        assert!(created);
        assert!(!created2);
        // Never two running tasks for one URL.
        assert!(state.start_ready(2).is_empty());
        assert_eq!(state.get("a").unwrap().id, first.id);

        let finished = state.finish("a", first.id).unwrap();
        assert_eq!(finished.id, first.id);
        let started = state.start_ready(2);
        assert_eq!(started.len(), 1);
        assert_ne!(started[0].id, first.id);
        assert!(!started[0].cancel.is_cancelled());
    }

    #[test]
    fn waiting_successor_can_be_taken() {
        let mut state = SchedulerState::default();
        state.attach("a", None);
        let first = state.start_ready(1).remove(0);
        first.cancel.cancel();
        state.attach("a", None);

        assert!(state.take_queued("a").is_some());
        assert!(state.take_queued("a").is_none());
        state.finish("a", first.id);
        assert!(state.get("a").is_none());
        assert!(state.start_ready(1).is_empty());
    }
}
