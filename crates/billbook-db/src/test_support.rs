//! Fixtures shared by the repository tests.

use billbook_core::clock::from_millis;
use billbook_core::{MutationRecord, NewMutation, Provenance, StepPosition};
use serde_json::json;

use crate::{Database, DbConfig};

pub async fn test_db() -> Database {
    Database::new(DbConfig::in_memory()).await.unwrap()
}

pub fn provenance() -> Provenance {
    Provenance {
        owner_id: "biz-1".to_string(),
        user_id: "user-1".to_string(),
        device_id: "dev-1".to_string(),
    }
}

/// A PENDING product create.
pub fn pending(operation_id: &str, priority: i32, created_at: i64) -> MutationRecord {
    MutationRecord::new(
        operation_id,
        NewMutation::create(
            "products",
            format!("doc-{operation_id}"),
            json!({"name": "Tea", "price_cents": 150}),
        )
        .with_priority(priority),
        &provenance(),
        None,
        from_millis(created_at),
    )
}

/// One PENDING step of a dependency group.
pub fn grouped(
    operation_id: &str,
    group: &str,
    step: u32,
    total: u32,
    created_at: i64,
) -> MutationRecord {
    MutationRecord::new(
        operation_id,
        NewMutation::create("bill_items", format!("doc-{operation_id}"), json!({})),
        &provenance(),
        Some(StepPosition {
            dependency_group: group.to_string(),
            parent_operation_id: (step > 1).then(|| format!("{group}-root")),
            step_number: step,
            total_steps: total,
        }),
        from_millis(created_at),
    )
}
