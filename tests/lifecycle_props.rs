use proptest::prelude::*;

use taskforge::errors::ServiceError;
use taskforge::registry::{RegistryOptions, TaskRegistry, TransitionFields};
use taskforge::task::{ShellCommandParams, TaskParameters};
use taskforge::types::TaskStatus;

fn status_strategy() -> impl Strategy<Value = TaskStatus> {
    prop::sample::select(TaskStatus::ALL.to_vec())
}

proptest! {
    // Random (expected, new) attempts against one task: the recorded history
    // only ever follows lifecycle edges, and a terminal status sticks.
    #[test]
    fn random_transitions_follow_the_lifecycle(
        attempts in proptest::collection::vec((status_strategy(), status_strategy()), 1..24)
    ) {
        let registry = TaskRegistry::in_memory(RegistryOptions::default());
        let id = registry
            .create(TaskParameters::ShellCommand(ShellCommandParams {
                command: "true".into(),
                working_dir: None,
            }))
            .unwrap()
            .id;

        let mut current = TaskStatus::Pending;
        let mut history = vec![current];

        for (expected, new) in attempts {
            match registry.transition(&id, expected, new, TransitionFields::none()) {
                Ok(task) => {
                    prop_assert_eq!(expected, current);
                    prop_assert!(current.can_transition_to(new));
                    prop_assert_eq!(task.status, new);
                    current = new;
                    history.push(new);
                }
                Err(ServiceError::StaleTransition { actual, .. }) => {
                    prop_assert_ne!(expected, current);
                    prop_assert_eq!(actual, current);
                }
                Err(ServiceError::InvalidState { status, .. }) => {
                    prop_assert_eq!(expected, current);
                    prop_assert_eq!(status, current);
                    prop_assert!(!current.can_transition_to(new));
                }
                Err(other) => prop_assert!(false, "unexpected error: {other}"),
            }
        }

        // Never back to pending, and nothing after a terminal status.
        prop_assert!(history[1..].iter().all(|s| *s != TaskStatus::Pending));
        if let Some(pos) = history.iter().position(|s| s.is_terminal()) {
            prop_assert_eq!(pos, history.len() - 1);
        }

        let task = registry.get(&id).unwrap();
        prop_assert_eq!(task.status, current);
        prop_assert_eq!(task.finished_at.is_some(), current.is_terminal());
        prop_assert_eq!(task.error.is_some(), current == TaskStatus::Failed);
        prop_assert_eq!(task.started_at.is_some(), history.contains(&TaskStatus::Running));
    }
}
