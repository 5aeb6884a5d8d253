//! Hash-chained append protocol and snapshot reduction.
//!
//! Appends are optimistic: the batch head must link to the current stream
//! head, so parallel appenders race and the loser fails with
//! `PREV_CHAIN_HASH_MISMATCH` and rebuilds its chain before retrying.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use proxy_types::{scoped_key3, AggregateKind, CoreError, EventRecord, EventsAppendOp};

use crate::state::WorldState;

/// Input handed to a snapshot reducer.
#[derive(Debug)]
pub struct ReduceInput<'a> {
    /// Tenant the stream belongs to.
    pub tenant_id: &'a str,
    /// Stream family.
    pub aggregate_kind: AggregateKind,
    /// Aggregate identifier.
    pub aggregate_id: &'a str,
    /// The full stream including the batch just appended.
    pub events: &'a [EventRecord],
}

/// A snapshot reducer: folds a full stream into the aggregate's current
/// record. Must be deterministic — snapshots are regenerated on every append
/// and must be recomputable from the stream alone.
pub type ReducerFn = Arc<dyn Fn(&ReduceInput<'_>) -> Value + Send + Sync>;

/// Per-aggregate-kind reducer table with a deterministic default fold.
#[derive(Clone, Default)]
pub struct ReducerRegistry {
    custom: HashMap<AggregateKind, ReducerFn>,
}

impl std::fmt::Debug for ReducerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReducerRegistry")
            .field("custom", &self.custom.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ReducerRegistry {
    /// Registry with only the default fold.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a domain reducer for one aggregate kind, replacing any
    /// previous registration.
    pub fn register(&mut self, kind: AggregateKind, reducer: ReducerFn) {
        self.custom.insert(kind, reducer);
    }

    /// Reduce a stream to its snapshot.
    pub fn reduce(&self, input: &ReduceInput<'_>) -> Value {
        match self.custom.get(&input.aggregate_kind) {
            Some(reducer) => reducer(input),
            None => default_reduce(input),
        }
    }
}

/// Default fold: shallow-merge of event `data` objects in stream order, plus
/// stream bookkeeping (version, head hash, last event).
pub fn default_reduce(input: &ReduceInput<'_>) -> Value {
    let mut merged = Map::new();
    for event in input.events {
        if let Value::Object(data) = &event.data {
            for (field, value) in data {
                merged.insert(field.clone(), value.clone());
            }
        }
    }
    // Non-empty by protocol: reduction runs right after an append.
    let last = &input.events[input.events.len() - 1];
    serde_json::json!({
        "tenantId": input.tenant_id,
        "aggregateId": input.aggregate_id,
        "aggregateKind": input.aggregate_kind.as_str(),
        "version": input.events.len(),
        "head": last.chain_hash,
        "lastEventAt": last.at,
        "lastEventType": last.event_type,
        "state": merged,
    })
}

/// Append a chained batch to a stream and regenerate its snapshot.
pub fn append_events(
    state: &mut WorldState,
    reducers: &ReducerRegistry,
    kind: AggregateKind,
    op: &EventsAppendOp,
) -> Result<(), CoreError> {
    let key = scoped_key3(&op.tenant_id, kind.as_str(), &op.aggregate_id);

    let head = state
        .streams
        .get(&key)
        .and_then(|events| events.last())
        .map(|event| event.chain_hash.clone());

    let mismatch = |expected: Option<String>, got: Option<String>| CoreError::PrevChainHashMismatch {
        stream: key.clone(),
        expected,
        got,
    };

    if op.events[0].prev_chain_hash != head {
        return Err(mismatch(head, op.events[0].prev_chain_hash.clone()));
    }
    for window in op.events.windows(2) {
        let expected = Some(window[0].chain_hash.clone());
        if window[1].prev_chain_hash != expected {
            return Err(mismatch(expected, window[1].prev_chain_hash.clone()));
        }
    }

    let stream = state.streams.entry(key.clone()).or_default();
    stream.extend(op.events.iter().cloned());

    let snapshot = reducers.reduce(&ReduceInput {
        tenant_id: &op.tenant_id,
        aggregate_kind: kind,
        aggregate_id: &op.aggregate_id,
        events: state.streams[&key].as_slice(),
    });
    state.snapshots.insert(key, snapshot);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(id: &str, prev: Option<&str>, hash: &str, data: Value) -> EventRecord {
        EventRecord {
            event_id: id.into(),
            event_type: "job.updated".into(),
            at: "2026-08-01T00:00:00.000Z".into(),
            data,
            prev_chain_hash: prev.map(str::to_owned),
            chain_hash: hash.into(),
            extra: Default::default(),
        }
    }

    fn append(
        state: &mut WorldState,
        events: Vec<EventRecord>,
    ) -> Result<(), CoreError> {
        append_events(
            state,
            &ReducerRegistry::new(),
            AggregateKind::Job,
            &EventsAppendOp {
                tenant_id: "default".into(),
                aggregate_id: "j1".into(),
                events,
            },
        )
    }

    #[test]
    fn replayed_open_fails_with_head_mismatch() {
        let mut state = WorldState::new();
        append(&mut state, vec![event("e1", None, "a", json!({}))]).unwrap();

        let err = append(&mut state, vec![event("e1", None, "a", json!({}))]).unwrap_err();
        match &err {
            CoreError::PrevChainHashMismatch { expected, got, .. } => {
                assert_eq!(expected.as_deref(), Some("a"));
                assert_eq!(got, &None);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(err.status_code(), 409);
    }

    #[test]
    fn intra_batch_linkage_is_checked() {
        let mut state = WorldState::new();
        let err = append(
            &mut state,
            vec![
                event("e1", None, "a", json!({})),
                event("e2", Some("wrong"), "b", json!({})),
            ],
        )
        .unwrap_err();
        match err {
            CoreError::PrevChainHashMismatch { expected, got, .. } => {
                assert_eq!(expected.as_deref(), Some("a"));
                assert_eq!(got.as_deref(), Some("wrong"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        // A failed append leaves the stream untouched.
        assert!(state.streams.is_empty());
    }

    #[test]
    fn default_reducer_merges_data_in_order() {
        let mut state = WorldState::new();
        append(
            &mut state,
            vec![
                event("e1", None, "a", json!({"status": "created", "robot": "r1"})),
                event("e2", Some("a"), "b", json!({"status": "assigned"})),
            ],
        )
        .unwrap();

        let key = scoped_key3("default", "job", "j1");
        let snapshot = &state.snapshots[&key];
        assert_eq!(snapshot["version"], 2);
        assert_eq!(snapshot["head"], "b");
        assert_eq!(snapshot["state"]["status"], "assigned");
        assert_eq!(snapshot["state"]["robot"], "r1");
    }

    #[test]
    fn custom_reducer_overrides_default() {
        let mut registry = ReducerRegistry::new();
        registry.register(
            AggregateKind::Job,
            Arc::new(|input| json!({"eventCount": input.events.len()})),
        );

        let mut state = WorldState::new();
        append_events(
            &mut state,
            &registry,
            AggregateKind::Job,
            &EventsAppendOp {
                tenant_id: "default".into(),
                aggregate_id: "j1".into(),
                events: vec![event("e1", None, "a", json!({}))],
            },
        )
        .unwrap();

        let key = scoped_key3("default", "job", "j1");
        assert_eq!(state.snapshots[&key], json!({"eventCount": 1}));
    }
}
