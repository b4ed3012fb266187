//! Shared circuit thread pool
//!
//! A [`ThreadPool`] replaces the per-(component, buffer) worker threads with
//! one fixed team of threads per buffer, shared by every component in the
//! circuit. Components dispatch their processing as jobs onto the team for
//! the buffer being ticked and synchronise on the returned [`JobToken`]
//! instead of on a private worker.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Completion handle for a job submitted to a [`ThreadPool`].
pub struct JobToken {
    done: Mutex<bool>,
    completed: Condvar,
}

impl JobToken {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            done: Mutex::new(false),
            completed: Condvar::new(),
        })
    }

    fn completed() -> Arc<Self> {
        Arc::new(Self {
            done: Mutex::new(true),
            completed: Condvar::new(),
        })
    }

    /// Block until the job has finished.
    pub fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.completed.wait(&mut done);
        }
    }

    fn complete(&self) {
        *self.done.lock() = true;
        self.completed.notify_all();
    }
}

struct TeamShared {
    queue: Mutex<TeamQueue>,
    work_available: Condvar,
}

#[derive(Default)]
struct TeamQueue {
    jobs: VecDeque<(Arc<JobToken>, Job)>,
    stop: bool,
}

struct Team {
    shared: Arc<TeamShared>,
    threads: Vec<JoinHandle<()>>,
}

/// Fixed-size thread pool with one worker team per buffer slot.
///
/// Shared across a circuit via [`crate::Component::set_thread_pool`]: a
/// component with a pool set dispatches its Parallel-mode processing here
/// instead of spawning its own worker threads, bounding the circuit's
/// thread count at `buffer_count * threads_per_buffer` regardless of
/// component count.
pub struct ThreadPool {
    teams: Vec<Team>,
    threads_per_buffer: usize,
}

impl ThreadPool {
    /// Create a pool with `threads_per_buffer` worker threads for each of
    /// `buffer_count` buffer slots.
    pub fn new(buffer_count: usize, threads_per_buffer: usize) -> Arc<Self> {
        let teams = (0..buffer_count)
            .map(|buffer_no| {
                let shared = Arc::new(TeamShared {
                    queue: Mutex::new(TeamQueue::default()),
                    work_available: Condvar::new(),
                });
                let threads = (0..threads_per_buffer)
                    .map(|_| {
                        let shared = Arc::clone(&shared);
                        std::thread::spawn(move || team_loop(&shared))
                    })
                    .collect();
                debug!(buffer = buffer_no, threads = threads_per_buffer, "pool team started");
                Team { shared, threads }
            })
            .collect();
        Arc::new(Self {
            teams,
            threads_per_buffer,
        })
    }

    /// Number of buffer slots this pool serves
    pub fn buffer_count(&self) -> usize {
        self.teams.len()
    }

    /// Worker threads per buffer slot
    pub fn threads_per_buffer(&self) -> usize {
        self.threads_per_buffer
    }

    /// Enqueue a job on the team for `buffer_no`.
    ///
    /// Returns a token that completes when the job has run. A `buffer_no`
    /// outside the pool's range runs the job on the calling thread and
    /// returns an already-completed token.
    pub fn add_job(
        &self,
        buffer_no: usize,
        job: impl FnOnce() + Send + 'static,
    ) -> Arc<JobToken> {
        let Some(team) = self.teams.get(buffer_no) else {
            job();
            return JobToken::completed();
        };
        let token = JobToken::new();
        {
            let mut queue = team.shared.queue.lock();
            queue.jobs.push_back((Arc::clone(&token), Box::new(job)));
        }
        team.shared.work_available.notify_one();
        token
    }
}

fn team_loop(shared: &TeamShared) {
    let mut queue = shared.queue.lock();
    loop {
        if let Some((token, job)) = queue.jobs.pop_front() {
            drop(queue);
            job();
            token.complete();
            queue = shared.queue.lock();
            continue;
        }
        if queue.stop {
            break;
        }
        shared.work_available.wait(&mut queue);
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        for team in &mut self.teams {
            {
                let mut queue = team.shared.queue.lock();
                queue.stop = true;
            }
            team.shared.work_available.notify_all();
            for handle in team.threads.drain(..) {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn jobs_run_on_the_requested_buffer_team() {
        let pool = ThreadPool::new(2, 1);
        let counter = Arc::new(AtomicUsize::new(0));

        let tokens: Vec<_> = (0..2)
            .flat_map(|buffer_no| {
                (0..5)
                    .map(|_| {
                        let counter = Arc::clone(&counter);
                        pool.add_job(buffer_no, move || {
                            counter.fetch_add(1, Ordering::SeqCst);
                        })
                    })
                    .collect::<Vec<_>>()
            })
            .collect();
        for token in tokens {
            token.wait();
        }

        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn out_of_range_buffer_runs_inline() {
        let pool = ThreadPool::new(1, 1);
        let counter = Arc::new(AtomicUsize::new(0));
        let job_counter = Arc::clone(&counter);

        let token = pool.add_job(9, move || {
            job_counter.fetch_add(1, Ordering::SeqCst);
        });
        token.wait();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn token_wait_is_idempotent() {
        let pool = ThreadPool::new(1, 2);
        let token = pool.add_job(0, || {});
        token.wait();
        token.wait();
    }

    #[test]
    fn drop_finishes_queued_jobs() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let pool = ThreadPool::new(1, 1);
            for _ in 0..20 {
                let counter = Arc::clone(&counter);
                pool.add_job(0, move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
            }
        }
        assert_eq!(counter.load(Ordering::SeqCst), 20);
    }
}
