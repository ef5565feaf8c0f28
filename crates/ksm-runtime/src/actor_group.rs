// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Actor group: runs a fixed set of actors concurrently and tears all of them
//! down as soon as the first one stops.
//!
//! Every actor is a pair of capabilities:
//! - `run`: a future that completes when the actor stops on its own, fails or
//!   honours an interrupt.
//! - `interrupt`: a one-shot callback asking the actor to stop promptly.
//!
//! ```text
//! start()
//!   ├─► spawn run() of every actor
//!   ├─► wait for the first run() to settle  ──► group result
//!   ├─► interrupt(&result) every other actor (once each, unordered)
//!   └─► wait for the remaining run() futures, log and discard their results
//! ```
//!
//! The group has no timeout of its own: each actor is responsible for obeying
//! its interrupt in bounded time.

use std::future::Future;
use std::pin::Pin;

use tokio::task::{AbortHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::{BoxError, GroupError};

/// Future driving one actor until it stops.
pub type RunFuture = Pin<Box<dyn Future<Output = Result<(), BoxError>> + Send + 'static>>;

/// Callback asking an actor to stop. Receives the result that settled the group.
pub type InterruptFn = Box<dyn FnOnce(&Result<(), GroupError>) + Send + 'static>;

struct Actor {
    name: String,
    run: Option<RunFuture>,
    interrupt: Option<InterruptFn>,
}

enum Exit {
    Returned(Result<(), BoxError>),
    Panicked,
}

/// Aborts actor tasks that are still alive if `start` is dropped mid-flight.
#[derive(Default)]
struct AbortOnDrop(Vec<AbortHandle>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

/// Concurrent supervisor for a fixed set of actors.
#[derive(Default)]
pub struct ActorGroup {
    actors: Vec<Actor>,
    started: bool,
}

impl ActorGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an actor. Actors added after `start` are never run.
    pub fn add<F, I>(&mut self, name: impl Into<String>, run: F, interrupt: I) -> &mut Self
    where
        F: Future<Output = Result<(), BoxError>> + Send + 'static,
        I: FnOnce(&Result<(), GroupError>) + Send + 'static,
    {
        self.actors.push(Actor {
            name: name.into(),
            run: Some(Box::pin(run)),
            interrupt: Some(Box::new(interrupt)),
        });
        self
    }

    /// Register an actor whose interrupt cancels `token`.
    pub fn add_cancellable<F>(
        &mut self,
        name: impl Into<String>,
        token: CancellationToken,
        run: F,
    ) -> &mut Self
    where
        F: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.add(name, run, move |_| token.cancel())
    }

    /// Run every actor until the group settles.
    ///
    /// Returns the result of the first actor to stop. By the time this returns
    /// every actor has stopped.
    pub async fn start(&mut self) -> Result<(), GroupError> {
        if self.started {
            return Err(GroupError::AlreadyStarted);
        }
        if self.actors.is_empty() {
            return Err(GroupError::NoActors);
        }
        self.started = true;

        let mut tasks = JoinSet::new();
        let mut abort_guard = AbortOnDrop::default();
        for (index, actor) in self.actors.iter_mut().enumerate() {
            let Some(run) = actor.run.take() else {
                continue;
            };
            debug!("Starting actor {}", actor.name);
            let handle = tokio::spawn(run);
            abort_guard.0.push(handle.abort_handle());
            tasks.spawn(async move {
                let exit = match handle.await {
                    Ok(result) => Exit::Returned(result),
                    Err(_) => Exit::Panicked,
                };
                (index, exit)
            });
        }

        let Some((winner, exit)) = next_exit(&mut tasks).await else {
            return Err(GroupError::NoActors);
        };

        let name = self.actors[winner].name.clone();
        let result = match exit {
            Exit::Returned(Ok(())) => {
                info!("Actor {} stopped, interrupting the group", name);
                Ok(())
            }
            Exit::Returned(Err(source)) => {
                error!("Actor {} failed: {}, interrupting the group", name, source);
                Err(GroupError::Actor { actor: name, source })
            }
            Exit::Panicked => {
                error!("Actor {} panicked, interrupting the group", name);
                Err(GroupError::Panicked { actor: name })
            }
        };

        for (index, actor) in self.actors.iter_mut().enumerate() {
            if index == winner {
                continue;
            }
            if let Some(interrupt) = actor.interrupt.take() {
                debug!("Interrupting actor {}", actor.name);
                interrupt(&result);
            }
        }

        while let Some((index, exit)) = next_exit(&mut tasks).await {
            let name = &self.actors[index].name;
            match exit {
                Exit::Returned(Ok(())) => debug!("Actor {} stopped", name),
                Exit::Returned(Err(e)) => debug!("Actor {} stopped with error: {}", name, e),
                Exit::Panicked => error!("Actor {} panicked while stopping", name),
            }
        }

        result
    }
}

async fn next_exit(tasks: &mut JoinSet<(usize, Exit)>) -> Option<(usize, Exit)> {
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(exit) => return Some(exit),
            Err(e) => error!("Actor supervision task failed: {:?}", e),
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Instant;
    use tokio::sync::Barrier;
    use tokio::time::{sleep, Duration};

    #[derive(Debug, thiserror::Error)]
    #[error("injected failure")]
    struct Injected;

    #[derive(Default)]
    struct Tracker {
        interrupts: AtomicUsize,
        terminated: AtomicBool,
    }

    fn add_sleeper(group: &mut ActorGroup, name: &str, tracker: Arc<Tracker>) {
        let token = CancellationToken::new();
        let run_token = token.clone();
        let run_tracker = Arc::clone(&tracker);
        group.add(
            name,
            async move {
                tokio::select! {
                    _ = sleep(Duration::from_secs(10)) => {}
                    _ = run_token.cancelled() => {}
                }
                run_tracker.terminated.store(true, Ordering::SeqCst);
                Ok(())
            },
            move |_| {
                tracker.interrupts.fetch_add(1, Ordering::SeqCst);
                token.cancel();
            },
        );
    }

    async fn panicking_actor() -> Result<(), BoxError> {
        sleep(Duration::from_millis(5)).await;
        panic!("actor defect");
    }

    #[tokio::test]
    async fn test_start_without_actors_fails() {
        let mut group = ActorGroup::new();
        assert!(matches!(group.start().await, Err(GroupError::NoActors)));
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let mut group = ActorGroup::new();
        group.add("noop", async { Ok(()) }, |_| {});

        assert!(group.start().await.is_ok());
        assert!(matches!(
            group.start().await,
            Err(GroupError::AlreadyStarted)
        ));
    }

    #[tokio::test]
    async fn test_single_actor_result_is_group_result() {
        let mut group = ActorGroup::new();
        let interrupts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&interrupts);
        group.add(
            "only",
            async { Err(Box::new(Injected) as BoxError) },
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );

        let err = group.start().await.unwrap_err();
        assert_eq!(err.actor(), Some("only"));
        assert_eq!(interrupts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_first_failure_interrupts_the_rest() {
        let mut group = ActorGroup::new();
        let first = Arc::new(Tracker::default());
        let third = Arc::new(Tracker::default());
        let failing_interrupts = Arc::new(AtomicUsize::new(0));

        add_sleeper(&mut group, "actor-1", Arc::clone(&first));
        let counter = Arc::clone(&failing_interrupts);
        group.add(
            "actor-2",
            async {
                sleep(Duration::from_millis(10)).await;
                Err(Box::new(Injected) as BoxError)
            },
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );
        add_sleeper(&mut group, "actor-3", Arc::clone(&third));

        let started = Instant::now();
        let result = group.start().await;

        assert!(started.elapsed() < Duration::from_secs(2));
        match result {
            Err(GroupError::Actor { actor, source }) => {
                assert_eq!(actor, "actor-2");
                assert!(source.downcast_ref::<Injected>().is_some());
            }
            other => panic!("unexpected group result: {other:?}"),
        }
        for tracker in [&first, &third] {
            assert_eq!(tracker.interrupts.load(Ordering::SeqCst), 1);
            assert!(tracker.terminated.load(Ordering::SeqCst));
        }
        assert_eq!(failing_interrupts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_every_group_size_settles_once() {
        for size in 1..=6 {
            let mut group = ActorGroup::new();
            let trackers: Vec<_> = (0..size).map(|_| Arc::new(Tracker::default())).collect();
            for (i, tracker) in trackers.iter().enumerate() {
                add_sleeper(&mut group, &format!("sleeper-{i}"), Arc::clone(tracker));
            }
            group.add("stopper", async { Ok(()) }, |_| {});

            assert!(group.start().await.is_ok());
            for tracker in &trackers {
                assert_eq!(tracker.interrupts.load(Ordering::SeqCst), 1);
                assert!(tracker.terminated.load(Ordering::SeqCst));
            }
        }
    }

    #[tokio::test]
    async fn test_interrupting_finished_actor_is_harmless() {
        let mut group = ActorGroup::new();
        let barrier = Arc::new(Barrier::new(2));
        let interrupts = Arc::new([AtomicUsize::new(0), AtomicUsize::new(0)]);

        for (i, name) in ["fails", "succeeds"].into_iter().enumerate() {
            let barrier = Arc::clone(&barrier);
            let counter = Arc::clone(&interrupts);
            group.add(
                name,
                async move {
                    barrier.wait().await;
                    if i == 0 {
                        Err(Box::new(Injected) as BoxError)
                    } else {
                        Ok(())
                    }
                },
                move |_| {
                    counter[i].fetch_add(1, Ordering::SeqCst);
                },
            );
        }

        let result = group.start().await;
        let calls: Vec<_> = interrupts
            .iter()
            .map(|c| c.load(Ordering::SeqCst))
            .collect();
        match result {
            Err(GroupError::Actor { actor, .. }) => {
                assert_eq!(actor, "fails");
                assert_eq!(calls, vec![0, 1]);
            }
            Ok(()) => assert_eq!(calls, vec![1, 0]),
            Err(other) => panic!("unexpected group result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_panicking_actor_does_not_hang_group() {
        let mut group = ActorGroup::new();
        let tracker = Arc::new(Tracker::default());
        add_sleeper(&mut group, "sleeper", Arc::clone(&tracker));
        group.add("panics", panicking_actor(), |_| {});

        let result = group.start().await;
        assert!(matches!(result, Err(GroupError::Panicked { ref actor }) if actor == "panics"));
        assert_eq!(tracker.interrupts.load(Ordering::SeqCst), 1);
        assert!(tracker.terminated.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_interrupt_receives_group_result() {
        let mut group = ActorGroup::new();
        let seen = Arc::new(parking_lot::Mutex::new(None));
        let token = CancellationToken::new();
        let run_token = token.clone();
        let observed = Arc::clone(&seen);
        group.add(
            "observer",
            async move {
                run_token.cancelled().await;
                Ok(())
            },
            move |result: &Result<(), GroupError>| {
                *observed.lock() = result.as_ref().err().and_then(|e| e.actor().map(String::from));
                token.cancel();
            },
        );
        group.add(
            "fails",
            async { Err(Box::new(Injected) as BoxError) },
            |_| {},
        );

        assert!(group.start().await.is_err());
        assert_eq!(seen.lock().as_deref(), Some("fails"));
    }
}
