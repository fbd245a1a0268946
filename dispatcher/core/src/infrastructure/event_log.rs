// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Event Persistence
//
// Observes the bus and appends every event not flagged `nolog` to the
// `events` collection, deleting the oldest rows beyond the retention
// limit. Failures are logged, never surfaced.

use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::repository::{collections, Datastore, QueryOptions, SortDirection};
use crate::infrastructure::event_bus::{EventBus, EventBusError};

/// Delete the oldest rows until at most `retention` remain
async fn trim(datastore: &Arc<dyn Datastore>, kept: &mut VecDeque<Value>, retention: usize) {
    if retention == 0 {
        return;
    }
    while kept.len() > retention {
        let Some(id) = kept.pop_front() else {
            break;
        };
        if let Err(e) = datastore.delete(collections::EVENTS, &id).await {
            debug!(event_id = %id, error = %e, "Failed to expire event row");
        }
    }
}

pub fn spawn_event_logger(
    bus: &EventBus,
    datastore: Arc<dyn Datastore>,
    retention: usize,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let mut receiver = bus.subscribe_all();

    tokio::spawn(async move {
        let existing = datastore
            .query(
                collections::EVENTS,
                &[],
                &QueryOptions::sorted("id", SortDirection::Asc),
            )
            .await;
        let mut kept: VecDeque<Value> = match existing {
            Ok(rows) => rows.iter().filter_map(|row| row.get("id").cloned()).collect(),
            Err(e) => {
                warn!(error = %e, "Cannot read persisted events");
                VecDeque::new()
            }
        };
        trim(&datastore, &mut kept, retention).await;

        loop {
            let event = tokio::select! {
                received = receiver.recv() => received,
                _ = shutdown.cancelled() => break,
            };

            match event {
                Ok(event) if event.is_nolog() => {}
                Ok(event) => {
                    let timestamp = event
                        .emitted_at
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_default();
                    let row = json!({
                        "name": event.name,
                        "args": event.args,
                        "timestamp": timestamp,
                    });
                    match datastore.insert(collections::EVENTS, row).await {
                        Ok(id) => {
                            kept.push_back(id);
                            trim(&datastore, &mut kept, retention).await;
                        }
                        Err(e) => warn!(error = %e, "Failed to persist event"),
                    }
                }
                Err(EventBusError::Lagged(n)) => {
                    warn!(dropped = n, "Event log fell behind; events were not persisted");
                }
                Err(_) => break,
            }
        }
        debug!("Event logger stopped");
    })
}
