//! Emergency-control event application and state derivation.
//!
//! Control events are immutable and conflict-checked by canonical form.
//! Each accepted event derives or resets one or more last-write-wins control
//! states whose `revision` increases strictly per
//! `(tenantId, scopeType, scopeId, controlType)`.

use proxy_canonical::{to_canonical_string, CanonicalError};
use proxy_types::{scoped_key, ControlEventOp, ControlState, CoreError};

use crate::state::WorldState;
use crate::KernelError;

pub(crate) fn state_key(
    tenant_id: &str,
    scope_type: &str,
    scope_id: &str,
    control_type: &str,
) -> String {
    // Four-part identity flattened through the same separator discipline as
    // every other scoped key.
    scoped_key(
        tenant_id,
        &format!(
            "{scope_type}{sep}{scope_id}{sep}{control_type}",
            sep = proxy_types::KEY_SEPARATOR
        ),
    )
}

/// Apply one control event.
pub fn apply_control_event(state: &mut WorldState, op: &ControlEventOp) -> Result<(), KernelError> {
    let event = &op.event;
    let canonical =
        to_canonical_string(&serde_json::to_value(event).map_err(CanonicalError::from)?)?;

    let event_key = scoped_key(&op.tenant_id, &event.event_id);
    if let Some(existing) = state.control_events.get(&event_key) {
        if *existing == canonical {
            // Byte-identical replay; derived state is already in place.
            return Ok(());
        }
        return Err(CoreError::EmergencyControlEventConflict {
            event_id: event.event_id.clone(),
        }
        .into());
    }
    state.control_events.insert(event_key, canonical);

    if event.is_resume() {
        let targets: Vec<String> = match &event.resume_of {
            Some(controls) => controls.clone(),
            // Unscoped RESUME deactivates everything currently engaged on
            // the scope.
            None => state
                .control_states
                .values()
                .filter(|cs| {
                    cs.tenant_id == op.tenant_id
                        && cs.scope_type == event.scope_type
                        && cs.scope_id == event.scope_id
                        && cs.active
                })
                .map(|cs| cs.control_type.clone())
                .collect(),
        };
        for control_type in targets {
            transition(state, op, &control_type, false);
        }
    } else {
        transition(state, op, &op.event.control_type, true);
    }
    Ok(())
}

fn transition(state: &mut WorldState, op: &ControlEventOp, control_type: &str, active: bool) {
    let event = &op.event;
    let key = state_key(&op.tenant_id, &event.scope_type, &event.scope_id, control_type);
    let revision = state
        .control_states
        .get(&key)
        .map(|cs| cs.revision + 1)
        .unwrap_or(1);
    state.control_states.insert(
        key,
        ControlState {
            tenant_id: op.tenant_id.clone(),
            scope_type: event.scope_type.clone(),
            scope_id: event.scope_id.clone(),
            control_type: control_type.to_string(),
            active,
            revision,
            updated_at: event.at.clone(),
            last_event_id: event.event_id.clone(),
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use proxy_types::EmergencyControlEvent;

    fn control_op(event_id: &str, control_type: &str, resume_of: Option<Vec<&str>>) -> ControlEventOp {
        ControlEventOp {
            tenant_id: "default".into(),
            event: EmergencyControlEvent {
                event_id: event_id.into(),
                scope_type: "robot".into(),
                scope_id: "r1".into(),
                control_type: control_type.into(),
                at: "2026-08-01T00:00:00.000Z".into(),
                reason: None,
                resume_of: resume_of.map(|v| v.into_iter().map(str::to_owned).collect()),
            },
        }
    }

    fn get<'a>(state: &'a WorldState, control_type: &str) -> &'a ControlState {
        &state.control_states[&state_key("default", "robot", "r1", control_type)]
    }

    #[test]
    fn activation_then_resume_walks_revisions() {
        let mut state = WorldState::new();
        apply_control_event(&mut state, &control_op("c1", "PAUSE", None)).unwrap();
        assert!(get(&state, "PAUSE").active);
        assert_eq!(get(&state, "PAUSE").revision, 1);

        apply_control_event(&mut state, &control_op("c2", "FREEZE", None)).unwrap();
        apply_control_event(&mut state, &control_op("c3", "RESUME", None)).unwrap();

        // Unscoped RESUME reset both active controls, bumping each revision.
        assert!(!get(&state, "PAUSE").active);
        assert_eq!(get(&state, "PAUSE").revision, 2);
        assert!(!get(&state, "FREEZE").active);
        assert_eq!(get(&state, "FREEZE").revision, 2);
    }

    #[test]
    fn resume_can_target_a_subset() {
        let mut state = WorldState::new();
        apply_control_event(&mut state, &control_op("c1", "PAUSE", None)).unwrap();
        apply_control_event(&mut state, &control_op("c2", "FREEZE", None)).unwrap();
        apply_control_event(&mut state, &control_op("c3", "RESUME", Some(vec!["PAUSE"]))).unwrap();

        assert!(!get(&state, "PAUSE").active);
        assert!(get(&state, "FREEZE").active);
        assert_eq!(get(&state, "FREEZE").revision, 1);
    }

    #[test]
    fn identical_replay_is_idempotent_and_divergence_conflicts() {
        let mut state = WorldState::new();
        apply_control_event(&mut state, &control_op("c1", "PAUSE", None)).unwrap();
        apply_control_event(&mut state, &control_op("c1", "PAUSE", None)).unwrap();
        assert_eq!(get(&state, "PAUSE").revision, 1);

        let err = apply_control_event(&mut state, &control_op("c1", "FREEZE", None)).unwrap_err();
        assert_eq!(err.code(), "EMERGENCY_CONTROL_EVENT_CONFLICT");
        assert_eq!(err.status_code(), Some(409));
    }
}
