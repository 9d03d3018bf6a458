// Copyright 2026 Kestrel Project Authors. Licensed under Apache-2.0.

//! `Worker` runs tasks asynchronously on a dedicated thread.
//!
//! A worker pairs a runner (implementing [`Runnable`]) with a scheduler:
//! producers hand tasks to the scheduler and return immediately, the
//! runner consumes them one by one. Briefly, an mpsc model with a named
//! thread and a drain-on-stop contract.

use std::fmt::{self, Debug, Display, Formatter};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{Builder as ThreadBuilder, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};

pub enum ScheduleError<T> {
    Stopped(T),
}

impl<T> ScheduleError<T> {
    pub fn into_inner(self) -> T {
        match self {
            ScheduleError::Stopped(t) => t,
        }
    }
}

impl<T> Display for ScheduleError<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "channel has been closed")
    }
}

impl<T> Debug for ScheduleError<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

pub trait Runnable<T: Display> {
    /// Runs one task.
    fn run(&mut self, task: T);

    fn shutdown(&mut self) {}
}

enum Msg<T> {
    Task(T),
    Stop,
}

/// Sends tasks to the worker's runner.
pub struct Scheduler<T> {
    name: Arc<String>,
    counter: Arc<AtomicUsize>,
    sender: Sender<Msg<T>>,
}

impl<T: Display + Send + 'static> Scheduler<T> {
    /// Schedules a task; fails only when the worker has stopped.
    pub fn schedule(&self, task: T) -> Result<(), ScheduleError<T>> {
        match self.sender.send(Msg::Task(task)) {
            Ok(()) => {
                self.counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Err(channel::SendError(Msg::Task(t))) => Err(ScheduleError::Stopped(t)),
            Err(_) => unreachable!(),
        }
    }

    /// True while the runner has unfinished tasks; used to avoid piling up
    /// redundant scans.
    pub fn is_busy(&self) -> bool {
        self.counter.load(Ordering::SeqCst) > 0
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<T> Clone for Scheduler<T> {
    fn clone(&self) -> Scheduler<T> {
        Scheduler {
            name: Arc::clone(&self.name),
            counter: Arc::clone(&self.counter),
            sender: self.sender.clone(),
        }
    }
}

/// A worker that holds the runner thread and hands out schedulers.
pub struct Worker<T: Display> {
    scheduler: Scheduler<T>,
    handle: Option<JoinHandle<()>>,
}

impl<T: Display + Send + 'static> Worker<T> {
    pub fn new<R>(name: &str, mut runner: R) -> Worker<T>
    where
        R: Runnable<T> + Send + 'static,
    {
        let (tx, rx): (Sender<Msg<T>>, Receiver<Msg<T>>) = channel::unbounded();
        let counter = Arc::new(AtomicUsize::new(0));
        let thread_counter = Arc::clone(&counter);
        let handle = ThreadBuilder::new()
            .name(name.to_owned())
            .spawn(move || {
                while let Ok(msg) = rx.recv() {
                    match msg {
                        Msg::Task(t) => {
                            runner.run(t);
                            thread_counter.fetch_sub(1, Ordering::SeqCst);
                        }
                        Msg::Stop => break,
                    }
                }
                runner.shutdown();
            })
            .unwrap();
        Worker {
            scheduler: Scheduler {
                name: Arc::new(name.to_owned()),
                counter,
                sender: tx,
            },
            handle: Some(handle),
        }
    }

    pub fn scheduler(&self) -> Scheduler<T> {
        self.scheduler.clone()
    }

    /// Stops the worker after it drains the tasks already queued.
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.scheduler.sender.send(Msg::Stop);
            let _ = handle.join();
        }
    }
}

impl<T: Display> Drop for Worker<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.scheduler.sender.send(Msg::Stop);
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;

    struct StepRunner {
        ch: mpsc::Sender<u64>,
    }

    impl Runnable<u64> for StepRunner {
        fn run(&mut self, step: u64) {
            self.ch.send(step).unwrap();
        }

        fn shutdown(&mut self) {
            self.ch.send(0).unwrap();
        }
    }

    #[test]
    fn test_worker() {
        let (tx, rx) = mpsc::channel();
        let mut worker = Worker::new("test-worker", StepRunner { ch: tx });
        let scheduler = worker.scheduler();
        scheduler.schedule(60).unwrap();
        scheduler.schedule(40).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(3)).unwrap(), 60);
        assert_eq!(rx.recv_timeout(Duration::from_secs(3)).unwrap(), 40);
        worker.stop();
        // shutdown sends back a 0.
        assert_eq!(rx.recv_timeout(Duration::from_secs(3)).unwrap(), 0);
        assert!(scheduler.schedule(1).is_err());
    }

    #[test]
    fn test_busy_flag() {
        let (tx, rx) = mpsc::channel();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();

        struct GatedRunner {
            ch: mpsc::Sender<u64>,
            gate: mpsc::Receiver<()>,
        }
        impl Runnable<u64> for GatedRunner {
            fn run(&mut self, step: u64) {
                self.gate.recv().unwrap();
                self.ch.send(step).unwrap();
            }
        }

        let mut worker = Worker::new(
            "test-worker-busy",
            GatedRunner {
                ch: tx,
                gate: gate_rx,
            },
        );
        let scheduler = worker.scheduler();
        assert!(!scheduler.is_busy());
        scheduler.schedule(1).unwrap();
        assert!(scheduler.is_busy());
        gate_tx.send(()).unwrap();
        rx.recv_timeout(Duration::from_secs(3)).unwrap();
        worker.stop();
        assert!(!scheduler.is_busy());
    }
}
