/*
 *  Copyright 2025 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Timer-heap stage between PreloadedChan and ReadyChan (§4.4).
//!
//! Holds each preloaded task until its `exec_time`, then forwards it.
//! Grounded on the teacher's `dispatcher::work_distributor` wakeup
//! discipline: a single worker selects on (timer, notification) rather
//! than busy-polling, using `tokio::sync::Notify` to interrupt a sleep
//! when a task with an earlier `exec_time` arrives.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tokio_util::sync::CancellationToken;

use crate::models::Task;
use crate::sink::MonitoringSink;

/// Min-heap entry ordering tasks by ascending `exec_time`.
#[derive(Debug, Clone, Eq, PartialEq)]
struct HeapEntry(Task);

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.exec_time.as_secs().cmp(&other.0.exec_time.as_secs())
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Delays each task arriving on PreloadedChan until its `exec_time`, then
/// forwards it to ReadyChan.
pub struct WaitingStage {
    preloaded_rx: AsyncMutex<mpsc::Receiver<Task>>,
    ready_tx: mpsc::Sender<Task>,
    heap: Mutex<BinaryHeap<Reverse<HeapEntry>>>,
    notify: Arc<Notify>,
    monitoring: Arc<dyn MonitoringSink>,
    cancel: CancellationToken,
}

impl WaitingStage {
    pub fn new(
        preloaded_rx: mpsc::Receiver<Task>,
        channel_capacity: usize,
        monitoring: Arc<dyn MonitoringSink>,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Receiver<Task>) {
        let (ready_tx, ready_rx) = mpsc::channel(channel_capacity.max(1));
        (
            Self {
                preloaded_rx: AsyncMutex::new(preloaded_rx),
                ready_tx,
                heap: Mutex::new(BinaryHeap::new()),
                notify: Arc::new(Notify::new()),
                monitoring,
                cancel,
            },
            ready_rx,
        )
    }

    /// Runs the enqueue/fire loop until PreloadedChan closes or the engine
    /// is cancelled.
    pub async fn run(&self) {
        loop {
            if self.cancel.is_cancelled() {
                return;
            }

            let sleep_for = self.time_until_head();

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = self.notify.notified() => {
                    // A new task may have preempted the current head; loop
                    // back around to re-evaluate instead of acting now.
                    continue;
                }
                incoming = self.recv_preloaded() => {
                    match incoming {
                        Some(task) => {
                            self.push(task);
                            continue;
                        }
                        None => return,
                    }
                }
                _ = sleep(sleep_for) => {
                    if self.fire_head().await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    async fn recv_preloaded(&self) -> Option<Task> {
        self.preloaded_rx.lock().await.recv().await
    }

    fn push(&self, task: Task) {
        let mut heap = self.heap.lock().unwrap_or_else(|e| e.into_inner());
        heap.push(Reverse(HeapEntry(task)));
        self.monitoring.gauge("heap_size", heap.len() as f64);
        drop(heap);
        // Wake the worker in case it's sleeping on a head that this task
        // now precedes.
        self.notify.notify_waiters();
    }

    /// Computes how long to sleep before the current head is due, or a
    /// generous fallback when the heap is empty (re-checked on every wakeup
    /// anyway, so this just bounds how long a spurious empty-heap sleep
    /// can run).
    fn time_until_head(&self) -> Duration {
        let heap = self.heap.lock().unwrap_or_else(|e| e.into_inner());
        match heap.peek() {
            Some(Reverse(entry)) => {
                let relative = entry.0.exec_time.as_secs() - crate::database::universal_types::UniversalTimestamp::now().as_secs();
                if relative <= 0 {
                    Duration::ZERO
                } else {
                    Duration::from_secs(relative as u64)
                }
            }
            None => Duration::from_secs(3600),
        }
    }

    /// Pops and emits the head if it's actually due; a task may have been
    /// pushed ahead of it between the sleep being armed and firing.
    async fn fire_head(&self) -> Result<(), ()> {
        let due = {
            let mut heap = self.heap.lock().unwrap_or_else(|e| e.into_inner());
            match heap.peek() {
                Some(Reverse(entry))
                    if entry.0.exec_time.as_secs()
                        <= crate::database::universal_types::UniversalTimestamp::now().as_secs() =>
                {
                    heap.pop().map(|Reverse(e)| e.0)
                }
                _ => None,
            }
        };

        if let Some(task) = due {
            self.ready_tx.send(task).await.map_err(|_| ())?;
        }
        Ok(())
    }
}

async fn sleep(duration: Duration) {
    if duration.is_zero() {
        return;
    }
    tokio::time::sleep(duration).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::universal_types::UniversalTimestamp;
    use crate::sink::test_support::RecordingMonitoringSink;

    #[tokio::test]
    async fn emits_task_no_earlier_than_exec_time() {
        let (preloaded_tx, preloaded_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let (stage, mut ready_rx) = WaitingStage::new(
            preloaded_rx,
            8,
            Arc::new(RecordingMonitoringSink::default()),
            cancel.clone(),
        );

        let due_in = UniversalTimestamp::from_secs(UniversalTimestamp::now().as_secs() + 1);
        let task = Task::new(due_in);
        preloaded_tx.send(task.clone()).await.unwrap();

        let handle = tokio::spawn(async move { stage.run().await });

        let before = std::time::Instant::now();
        let emitted = ready_rx.recv().await.expect("task emitted");
        assert_eq!(emitted.id, task.id);
        assert!(before.elapsed() >= Duration::from_millis(900));

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn later_task_does_not_preempt_earlier_head() {
        let (preloaded_tx, preloaded_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let (stage, mut ready_rx) = WaitingStage::new(
            preloaded_rx,
            8,
            Arc::new(RecordingMonitoringSink::default()),
            cancel.clone(),
        );

        let now = UniversalTimestamp::now();
        let earlier = Task::new(UniversalTimestamp::from_secs(now.as_secs()));
        let later = Task::new(UniversalTimestamp::from_secs(now.as_secs() + 10));
        preloaded_tx.send(earlier.clone()).await.unwrap();
        preloaded_tx.send(later).await.unwrap();

        let handle = tokio::spawn(async move { stage.run().await });

        let emitted = ready_rx.recv().await.expect("earlier task emitted first");
        assert_eq!(emitted.id, earlier.id);

        cancel.cancel();
        handle.await.unwrap();
    }
}
