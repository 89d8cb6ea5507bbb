//! Property: per-entity apply order equals enqueue order, whatever the
//! pattern of transient failures and however entities interleave, and a
//! manual retry after exhaustion never replays an action behind its
//! successor.

mod common;

use chrono::Utc;
use common::{ctx, eager_settings, Harness};
use habitude_core::sync::command::{CompleteTask, CreateTask, SyncCommand, TaskFields, UpdateTask};
use habitude_core::RemoteError;
use proptest::prelude::*;
use std::collections::HashMap;

fn command(entity: u8, step: u8) -> SyncCommand {
    let task_id = format!("t{entity}");
    let now = Utc::now();
    match step % 3 {
        0 => SyncCommand::CreateTask(CreateTask {
            task_id,
            fields: TaskFields {
                title: format!("step {step}"),
                ..TaskFields::default()
            },
            client_updated_at: now,
        }),
        1 => SyncCommand::UpdateTask(UpdateTask {
            task_id,
            fields: TaskFields {
                title: format!("step {step}"),
                ..TaskFields::default()
            },
            client_updated_at: now,
        }),
        _ => SyncCommand::CompleteTask(CompleteTask {
            task_id,
            completed_at: now,
            client_updated_at: now,
        }),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn test_per_entity_order_is_enqueue_order(
        steps in prop::collection::vec((0u8..3, any::<u8>()), 1..20),
        failures in 0usize..8,
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let h = Harness::new(eager_settings(50), true);
            let mut expected: HashMap<String, Vec<String>> = HashMap::new();
            for (entity, step) in &steps {
                let action = h.engine.queue().enqueue(&ctx(), command(*entity, *step)).unwrap();
                expected.entry(action.entity_id.clone()).or_default().push(action.id);
            }
            h.server.fail_next(failures, RemoteError::Transient("HTTP 503".into()));

            let result = h.engine.sync_pending_actions(&ctx()).await;
            prop_assert!(result.success);
            prop_assert_eq!(result.succeeded, steps.len());

            let mut applied: HashMap<String, Vec<String>> = HashMap::new();
            for request in h.server.applied() {
                applied.entry(request.entity_id).or_default().push(request.action_id);
            }
            prop_assert_eq!(applied, expected);
            Ok::<(), TestCaseError>(())
        })?;
    }

    #[test]
    fn test_manual_retry_keeps_per_entity_order(
        steps in prop::collection::vec((0u8..3, any::<u8>()), 1..20),
        failures in 0usize..12,
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let h = Harness::new(eager_settings(2), true);
            let mut position: HashMap<String, usize> = HashMap::new();
            for (index, (entity, step)) in steps.iter().enumerate() {
                let action = h.engine.queue().enqueue(&ctx(), command(*entity, *step)).unwrap();
                position.insert(action.id, index);
            }
            h.server.fail_next(failures, RemoteError::Transient("HTTP 503".into()));

            h.engine.sync_pending_actions(&ctx()).await;
            h.engine.retry_failed(&ctx()).await.unwrap();

            let mut last: HashMap<String, usize> = HashMap::new();
            for request in h.server.applied() {
                let index = position[&request.action_id];
                if let Some(previous) = last.insert(request.entity_id.clone(), index) {
                    prop_assert!(
                        previous < index,
                        "{} applied out of order: {} after {}",
                        request.entity_id,
                        index,
                        previous
                    );
                }
            }
            Ok::<(), TestCaseError>(())
        })?;
    }
}
