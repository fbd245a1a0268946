// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Event Source Supervision
//
// Every registered event source runs in its own tokio task under a
// supervisor. A run that fails or panics is logged and restarted with
// exponential backoff; a run that returns Ok ends supervision. Stopping
// cancels the source's token and joins it, aborting runs that ignore it.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::domain::event::EventTypeSpec;
use crate::domain::node_config::EventSourcesConfig;
use crate::infrastructure::event_bus::EventBus;

const STOP_GRACE: Duration = Duration::from_secs(5);

/// Background producer of one or more event types
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Event types registered on the bus before the source starts
    fn event_types(&self) -> Vec<EventTypeSpec>;

    /// Owns the source's loop. Should return promptly once
    /// `ctx.stopped()` resolves.
    async fn run(&self, ctx: EventSourceContext) -> anyhow::Result<()>;
}

/// Handle given to a running event source
#[derive(Clone)]
pub struct EventSourceContext {
    name: String,
    bus: EventBus,
    stop: CancellationToken,
}

impl EventSourceContext {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn emit_event(&self, event_type: &str, args: Value) {
        self.bus.emit(event_type, args);
    }

    /// False when no session currently listens to `event_type`
    pub fn is_active(&self, event_type: &str) -> bool {
        self.bus.is_active(event_type)
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub async fn stopped(&self) {
        self.stop.cancelled().await
    }
}

pub struct EventSourceHandle {
    name: String,
    stop: CancellationToken,
    join: JoinHandle<()>,
}

impl EventSourceHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Signal the source and wait for its supervisor to exit
    pub async fn stop(self) {
        self.stop.cancel();
        if let Err(e) = self.join.await {
            warn!(source = %self.name, error = %e, "Event source supervisor did not exit cleanly");
        }
    }
}

/// Start `source` under a restarting supervisor
pub fn spawn_supervised(
    name: impl Into<String>,
    source: Arc<dyn EventSource>,
    bus: EventBus,
    backoff: &EventSourcesConfig,
    parent: &CancellationToken,
) -> EventSourceHandle {
    let name = name.into();
    let stop = parent.child_token();
    let initial = Duration::from_millis(backoff.initial_backoff_ms.max(1));
    let max = Duration::from_millis(backoff.max_backoff_ms.max(backoff.initial_backoff_ms).max(1));

    let ctx = EventSourceContext {
        name: name.clone(),
        bus,
        stop: stop.clone(),
    };

    let join = tokio::spawn(supervise(ctx, source, initial, max));
    EventSourceHandle { name, stop, join }
}

async fn supervise(
    ctx: EventSourceContext,
    source: Arc<dyn EventSource>,
    initial: Duration,
    max: Duration,
) {
    let mut delay = initial;
    let mut restarts: u64 = 0;

    loop {
        if ctx.is_stopped() {
            break;
        }

        info!(source = %ctx.name, restarts, "Starting event source");
        let started = Instant::now();
        let run_source = source.clone();
        let run_ctx = ctx.clone();
        let mut run = tokio::spawn(async move { run_source.run(run_ctx).await });

        let outcome = tokio::select! {
            outcome = &mut run => outcome,
            _ = ctx.stopped() => {
                match tokio::time::timeout(STOP_GRACE, &mut run).await {
                    Ok(_) => {}
                    Err(_) => {
                        warn!(source = %ctx.name, "Event source ignored stop request, aborting");
                        run.abort();
                    }
                }
                break;
            }
        };

        match outcome {
            Ok(Ok(())) => {
                info!(source = %ctx.name, "Event source finished");
                break;
            }
            Ok(Err(e)) => {
                error!(source = %ctx.name, error = %e, "Event source failed");
            }
            Err(e) => {
                error!(source = %ctx.name, error = %e, "Event source panicked");
            }
        }

        // A run that stayed up for a while starts the backoff over
        if started.elapsed() > max {
            delay = initial;
        }

        warn!(source = %ctx.name, delay_ms = delay.as_millis() as u64, "Restarting event source after backoff");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = ctx.stopped() => break,
        }
        delay = (delay * 2).min(max);
        restarts += 1;
    }

    info!(source = %ctx.name, "Event source stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Flaky {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl EventSource for Flaky {
        fn event_types(&self) -> Vec<EventTypeSpec> {
            vec![EventTypeSpec::new("flaky.tick")]
        }

        async fn run(&self, ctx: EventSourceContext) -> anyhow::Result<()> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            match attempt {
                0 => anyhow::bail!("device vanished"),
                1 => panic!("driver bug"),
                _ => {
                    ctx.emit_event("flaky.tick", json!({"attempt": attempt}));
                    ctx.stopped().await;
                    Ok(())
                }
            }
        }
    }

    fn fast_backoff() -> EventSourcesConfig {
        EventSourcesConfig {
            initial_backoff_ms: 5,
            max_backoff_ms: 20,
        }
    }

    #[tokio::test]
    async fn test_failing_source_is_restarted() {
        let bus = EventBus::new(16);
        bus.register_event_type(EventTypeSpec::new("flaky.tick")).unwrap();
        let mut observer = bus.subscribe_all();

        let source = Arc::new(Flaky {
            attempts: AtomicUsize::new(0),
        });
        let root = CancellationToken::new();
        let handle = spawn_supervised("flaky", source.clone(), bus, &fast_backoff(), &root);

        let event = tokio::time::timeout(Duration::from_secs(5), observer.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.name, "flaky.tick");
        assert_eq!(source.attempts.load(Ordering::SeqCst), 3);

        handle.stop().await;
    }

    struct Once;

    #[async_trait]
    impl EventSource for Once {
        fn event_types(&self) -> Vec<EventTypeSpec> {
            Vec::new()
        }

        async fn run(&self, _ctx: EventSourceContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_clean_exit_ends_supervision() {
        let root = CancellationToken::new();
        let handle = spawn_supervised("once", Arc::new(Once), EventBus::new(4), &fast_backoff(), &root);
        tokio::time::timeout(Duration::from_secs(5), async {
            while !handle.is_finished() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_parent_cancellation_stops_source() {
        let root = CancellationToken::new();
        let source = Arc::new(Flaky {
            attempts: AtomicUsize::new(2),
        });
        let handle = spawn_supervised("steady", source, EventBus::new(4), &fast_backoff(), &root);
        root.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle.stop())
            .await
            .unwrap();
    }
}
