use crate::core::orchestrator::{can_transition, types::TaskState};

#[test]
fn lifecycle_happy_path_transitions_are_allowed() {
    let path = [
        (TaskState::Queued, TaskState::Running),
        (TaskState::Running, TaskState::AwaitingChild),
        (TaskState::AwaitingChild, TaskState::Running),
        (TaskState::Running, TaskState::Completed),
    ];
    for (from, to) in path {
        assert!(
            can_transition(from, to),
            "expected transition {from:?} -> {to:?} to be allowed"
        );
    }
}

#[test]
fn retry_requeue_is_allowed_from_running() {
    assert!(can_transition(TaskState::Running, TaskState::Queued));
    assert!(can_transition(TaskState::Queued, TaskState::Running));
}

#[test]
fn cancel_is_allowed_from_every_active_state() {
    for from in [
        TaskState::Queued,
        TaskState::Running,
        TaskState::AwaitingChild,
    ] {
        assert!(
            can_transition(from, TaskState::Cancelled),
            "expected cancel from {from:?}"
        );
    }
}

#[test]
fn terminal_states_are_frozen() {
    for terminal in [
        TaskState::Completed,
        TaskState::Failed,
        TaskState::Cancelled,
    ] {
        for to in [
            TaskState::Queued,
            TaskState::Running,
            TaskState::AwaitingChild,
            TaskState::Completed,
            TaskState::Failed,
            TaskState::Cancelled,
        ] {
            if terminal == to {
                continue;
            }
            assert!(
                !can_transition(terminal, to),
                "terminal {terminal:?} must not move to {to:?}"
            );
        }
    }
}

#[test]
fn queued_cannot_skip_to_terminal_success() {
    assert!(!can_transition(TaskState::Queued, TaskState::Completed));
    assert!(!can_transition(TaskState::Queued, TaskState::AwaitingChild));
}

#[test]
fn state_labels_round_trip() {
    for state in [
        TaskState::Queued,
        TaskState::Running,
        TaskState::AwaitingChild,
        TaskState::Completed,
        TaskState::Failed,
        TaskState::Cancelled,
    ] {
        assert_eq!(TaskState::from_status(state.as_str()), Some(state));
    }
    assert_eq!(TaskState::from_status("weird"), None);
}
