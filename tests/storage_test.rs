//! Conformance tests for the storage layer
//!
//! Every test runs against each backend: the in-memory store, a private
//! in-memory SQLite database and a file-backed SQLite database.

use std::sync::Arc;

use chrono::Duration;
use serde_json::json;
use tempfile::{tempdir, TempDir};
use tokio_test::{assert_err, assert_ok};

use progressive_reasoning::config::{DatabaseConfig, StorageBackend};
use progressive_reasoning::error::StorageError;
use progressive_reasoning::storage::{
    MemoryStorage, NewStep, Session, SessionFilter, SessionPatch, SqliteStorage, StepQuery,
    StepType, Storage,
};

/// All backends under test. The returned directory must outlive the stores.
async fn backends() -> (Vec<(&'static str, Arc<dyn Storage>)>, TempDir) {
    let dir = tempdir().expect("Failed to create temp dir");
    let file_config = DatabaseConfig {
        backend: StorageBackend::Sqlite,
        path: dir.path().join("test.db"),
        max_connections: 5,
    };

    let memory: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let sqlite_memory: Arc<dyn Storage> = Arc::new(
        SqliteStorage::new_in_memory()
            .await
            .expect("Failed to create in-memory SQLite storage"),
    );
    let sqlite_file: Arc<dyn Storage> = Arc::new(
        SqliteStorage::new(&file_config)
            .await
            .expect("Failed to create file-backed SQLite storage"),
    );

    (
        vec![
            ("memory", memory),
            ("sqlite-memory", sqlite_memory),
            ("sqlite-file", sqlite_file),
        ],
        dir,
    )
}

async fn seed_session(storage: &Arc<dyn Storage>, id: &str, tool: &str) -> Session {
    storage
        .create_session(&Session::with_id(id, tool))
        .await
        .expect("Failed to create session")
}

fn main_step(session_id: &str, n: u32, content: &str, step_type: StepType) -> NewStep {
    NewStep::new(session_id, n, 5, content, step_type)
}

#[cfg(test)]
mod session_tests {
    use super::*;

    #[tokio::test]
    async fn test_create_and_get_session() {
        let (stores, _dir) = backends().await;
        for (name, storage) in stores {
            let session = Session::with_id("s1", "sequential_thinking")
                .with_metadata(json!({"topic": "caching"}));
            assert_ok!(storage.create_session(&session).await, "{}", name);

            let fetched = storage.get_session("s1").await.unwrap().unwrap();
            assert_eq!(fetched.id, "s1", "{}", name);
            assert_eq!(fetched.tool_name, "sequential_thinking", "{}", name);
            assert_eq!(fetched.metadata, Some(json!({"topic": "caching"})), "{}", name);
            assert!(fetched.active, "{}", name);
        }
    }

    #[tokio::test]
    async fn test_get_missing_session() {
        let (stores, _dir) = backends().await;
        for (name, storage) in stores {
            let missing = storage.get_session("nonexistent").await.unwrap();
            assert!(missing.is_none(), "{}", name);
        }
    }

    #[tokio::test]
    async fn test_duplicate_session_rejected() {
        let (stores, _dir) = backends().await;
        for (name, storage) in stores {
            seed_session(&storage, "dup", "mental_model").await;
            let err = assert_err!(
                storage
                    .create_session(&Session::with_id("dup", "mental_model"))
                    .await
            );
            assert!(
                matches!(err, StorageError::DuplicateSession { ref session_id } if session_id == "dup"),
                "{}: unexpected error {:?}",
                name,
                err
            );
        }
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let (stores, _dir) = backends().await;
        for (name, storage) in stores {
            let first = storage
                .get_or_create_session("g1", "debugging_approach")
                .await
                .unwrap();
            let second = storage
                .get_or_create_session("g1", "debugging_approach")
                .await
                .unwrap();

            assert_eq!(first.id, second.id, "{}", name);
            assert_eq!(first.created_at, second.created_at, "{}", name);

            let all = storage
                .list_sessions(&SessionFilter::default(), 10, 0)
                .await
                .unwrap();
            assert_eq!(all.len(), 1, "{}", name);
        }
    }

    #[tokio::test]
    async fn test_update_session_applies_patch() {
        let (stores, _dir) = backends().await;
        for (name, storage) in stores {
            let created = seed_session(&storage, "u1", "decision_framework").await;
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;

            let patch = SessionPatch {
                metadata: Some(json!({"stage": "review"})),
                active: Some(false),
            };
            let updated = storage.update_session("u1", &patch).await.unwrap().unwrap();

            assert_eq!(updated.metadata, Some(json!({"stage": "review"})), "{}", name);
            assert!(!updated.active, "{}", name);
            assert_eq!(updated.tool_name, "decision_framework", "{}", name);
            assert!(updated.updated_at > created.updated_at, "{}", name);
        }
    }

    #[tokio::test]
    async fn test_update_missing_session_returns_none() {
        let (stores, _dir) = backends().await;
        for (name, storage) in stores {
            let result = storage
                .update_session("ghost", &SessionPatch::default())
                .await
                .unwrap();
            assert!(result.is_none(), "{}", name);
        }
    }

    #[tokio::test]
    async fn test_list_sessions_filter_order_and_paging() {
        let (stores, _dir) = backends().await;
        for (name, storage) in stores {
            for (id, tool) in [
                ("a", "sequential_thinking"),
                ("b", "mental_model"),
                ("c", "sequential_thinking"),
            ] {
                seed_session(&storage, id, tool).await;
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }

            let all = storage
                .list_sessions(&SessionFilter::default(), 10, 0)
                .await
                .unwrap();
            let ids: Vec<&str> = all.iter().map(|s| s.id.as_str()).collect();
            assert_eq!(ids, vec!["c", "b", "a"], "{}", name);

            let filter = SessionFilter {
                tool_name: Some("sequential_thinking".to_string()),
                active: None,
            };
            let sequential = storage.list_sessions(&filter, 10, 0).await.unwrap();
            let ids: Vec<&str> = sequential.iter().map(|s| s.id.as_str()).collect();
            assert_eq!(ids, vec!["c", "a"], "{}", name);

            let page = storage
                .list_sessions(&SessionFilter::default(), 1, 1)
                .await
                .unwrap();
            assert_eq!(page.len(), 1, "{}", name);
            assert_eq!(page[0].id, "b", "{}", name);
        }
    }

    #[tokio::test]
    async fn test_list_sessions_by_active_flag() {
        let (stores, _dir) = backends().await;
        for (name, storage) in stores {
            seed_session(&storage, "on", "mental_model").await;
            seed_session(&storage, "off", "mental_model").await;
            storage
                .update_session(
                    "off",
                    &SessionPatch {
                        metadata: None,
                        active: Some(false),
                    },
                )
                .await
                .unwrap();

            let filter = SessionFilter {
                tool_name: None,
                active: Some(false),
            };
            let inactive = storage.list_sessions(&filter, 10, 0).await.unwrap();
            assert_eq!(inactive.len(), 1, "{}", name);
            assert_eq!(inactive[0].id, "off", "{}", name);
        }
    }

    #[tokio::test]
    async fn test_delete_session_cascades_to_steps() {
        let (stores, _dir) = backends().await;
        for (name, storage) in stores {
            seed_session(&storage, "d1", "sequential_thinking").await;
            storage
                .save_step(&main_step("d1", 1, "First", StepType::Decomposition))
                .await
                .unwrap();

            assert!(storage.delete_session("d1").await.unwrap(), "{}", name);
            assert!(!storage.delete_session("d1").await.unwrap(), "{}", name);
            assert!(storage.get_session("d1").await.unwrap().is_none(), "{}", name);
            assert_eq!(storage.count_steps("d1").await.unwrap(), 0, "{}", name);
        }
    }

    #[tokio::test]
    async fn test_cleanup_removes_stale_sessions() {
        let (stores, _dir) = backends().await;
        for (name, storage) in stores {
            seed_session(&storage, "old", "mental_model").await;
            storage
                .save_step(&main_step("old", 1, "Stale", StepType::Decomposition))
                .await
                .unwrap();

            // Nothing is older than a day
            assert_eq!(
                storage.cleanup_older_than(Duration::hours(24)).await.unwrap(),
                0,
                "{}",
                name
            );

            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            let removed = storage
                .cleanup_older_than(Duration::milliseconds(5))
                .await
                .unwrap();
            assert_eq!(removed, 1, "{}", name);
            assert!(storage.get_session("old").await.unwrap().is_none(), "{}", name);
            assert_eq!(storage.count_steps("old").await.unwrap(), 0, "{}", name);
        }
    }
}

#[cfg(test)]
mod step_tests {
    use super::*;

    #[tokio::test]
    async fn test_save_step_assigns_increasing_ids() {
        let (stores, _dir) = backends().await;
        for (name, storage) in stores {
            seed_session(&storage, "s", "sequential_thinking").await;
            let first = storage
                .save_step(&main_step("s", 1, "One", StepType::Decomposition))
                .await
                .unwrap();
            let second = storage
                .save_step(&main_step("s", 2, "Two", StepType::Hypothesis))
                .await
                .unwrap();

            assert!(second.id > first.id, "{}", name);
            assert_eq!(second.step_type, StepType::Hypothesis, "{}", name);
            assert_eq!(second.session_id, "s", "{}", name);
        }
    }

    #[tokio::test]
    async fn test_save_step_bumps_session_updated_at() {
        let (stores, _dir) = backends().await;
        for (name, storage) in stores {
            let created = seed_session(&storage, "s", "sequential_thinking").await;
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            storage
                .save_step(&main_step("s", 1, "One", StepType::Decomposition))
                .await
                .unwrap();

            let session = storage.get_session("s").await.unwrap().unwrap();
            assert!(session.updated_at > created.updated_at, "{}", name);
        }
    }

    #[tokio::test]
    async fn test_save_step_rejects_duplicates_and_lower_numbers() {
        let (stores, _dir) = backends().await;
        for (name, storage) in stores {
            seed_session(&storage, "s", "sequential_thinking").await;
            for n in 1..=3 {
                storage
                    .save_step(&main_step("s", n, "Step", StepType::Synthesis))
                    .await
                    .unwrap();
            }

            for n in [3, 2] {
                let err = assert_err!(
                    storage
                        .save_step(&main_step("s", n, "Again", StepType::Synthesis))
                        .await
                );
                assert!(
                    matches!(err, StorageError::StepConflict { step_number, .. } if step_number == n),
                    "{}: unexpected error {:?}",
                    name,
                    err
                );
            }
            assert_eq!(storage.count_steps("s").await.unwrap(), 3, "{}", name);
        }
    }

    #[tokio::test]
    async fn test_save_step_allows_forward_gaps() {
        let (stores, _dir) = backends().await;
        for (name, storage) in stores {
            seed_session(&storage, "s", "sequential_thinking").await;
            storage
                .save_step(&main_step("s", 1, "One", StepType::Decomposition))
                .await
                .unwrap();
            assert_ok!(
                storage
                    .save_step(&main_step("s", 4, "Four", StepType::Validation))
                    .await,
                "{}",
                name
            );

            let latest = storage.latest_step("s", None).await.unwrap().unwrap();
            assert_eq!(latest.step_number, 4, "{}", name);
        }
    }

    #[tokio::test]
    async fn test_save_step_requires_session() {
        let (stores, _dir) = backends().await;
        for (name, storage) in stores {
            let err = assert_err!(
                storage
                    .save_step(&main_step("ghost", 1, "Orphan", StepType::Decomposition))
                    .await
            );
            assert!(
                matches!(err, StorageError::SessionNotFound { .. }),
                "{}: unexpected error {:?}",
                name,
                err
            );
        }
    }

    #[tokio::test]
    async fn test_save_step_validates_record() {
        let (stores, _dir) = backends().await;
        for (name, storage) in stores {
            seed_session(&storage, "s", "sequential_thinking").await;
            let mut draft = main_step("s", 2, "Bad revision", StepType::Synthesis);
            draft.revises_step = Some(2);
            draft.is_revision = true;

            let err = assert_err!(storage.save_step(&draft).await);
            assert!(
                matches!(err, StorageError::InvalidStep { .. }),
                "{}: unexpected error {:?}",
                name,
                err
            );
        }
    }

    #[tokio::test]
    async fn test_branches_are_independent_namespaces() {
        let (stores, _dir) = backends().await;
        for (name, storage) in stores {
            seed_session(&storage, "s", "sequential_thinking").await;
            for n in 1..=3 {
                storage
                    .save_step(&main_step("s", n, "Main", StepType::Decomposition))
                    .await
                    .unwrap();
            }
            let fork = main_step("s", 3, "Alt", StepType::Hypothesis)
                .on_branch("alt")
                .forked_from(None, 2);
            let saved = storage.save_step(&fork).await.unwrap();
            assert_eq!(saved.branch_id.as_deref(), Some("alt"), "{}", name);
            assert_eq!(saved.branch_from_step, Some(2), "{}", name);

            let main = storage.list_steps("s", None).await.unwrap();
            let alt = storage.list_steps("s", Some("alt")).await.unwrap();
            assert_eq!(main.len(), 3, "{}", name);
            assert_eq!(alt.len(), 1, "{}", name);

            let by_number = storage
                .get_step_by_number("s", Some("alt"), 3)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(by_number.content, "Alt", "{}", name);
            assert!(storage
                .get_step_by_number("s", Some("alt"), 1)
                .await
                .unwrap()
                .is_none());
        }
    }

    #[tokio::test]
    async fn test_list_all_steps_main_line_first() {
        let (stores, _dir) = backends().await;
        for (name, storage) in stores {
            seed_session(&storage, "s", "sequential_thinking").await;
            storage
                .save_step(&main_step("s", 1, "Main 1", StepType::Decomposition))
                .await
                .unwrap();
            storage
                .save_step(
                    &main_step("s", 2, "B 2", StepType::Hypothesis)
                        .on_branch("b")
                        .forked_from(None, 1),
                )
                .await
                .unwrap();
            storage
                .save_step(&main_step("s", 2, "Main 2", StepType::Hypothesis))
                .await
                .unwrap();
            storage
                .save_step(
                    &main_step("s", 2, "A 2", StepType::Hypothesis)
                        .on_branch("a")
                        .forked_from(None, 1),
                )
                .await
                .unwrap();

            let all = storage.list_all_steps("s").await.unwrap();
            let contents: Vec<&str> = all.iter().map(|s| s.content.as_str()).collect();
            assert_eq!(contents, vec!["Main 1", "Main 2", "A 2", "B 2"], "{}", name);

            let branches = storage.list_branches("s").await.unwrap();
            let ids: Vec<Option<&str>> = branches.iter().map(|b| b.branch_id.as_deref()).collect();
            assert_eq!(ids, vec![None, Some("a"), Some("b")], "{}", name);
            assert_eq!(branches[0].step_count, 2, "{}", name);
            assert_eq!(branches[0].latest_step_number, 2, "{}", name);
        }
    }

    #[tokio::test]
    async fn test_latest_and_count_on_empty_session() {
        let (stores, _dir) = backends().await;
        for (name, storage) in stores {
            seed_session(&storage, "empty", "mental_model").await;
            assert!(storage.latest_step("empty", None).await.unwrap().is_none(), "{}", name);
            assert_eq!(storage.count_steps("empty").await.unwrap(), 0, "{}", name);
            assert!(storage.list_branches("empty").await.unwrap().is_empty(), "{}", name);
        }
    }

    #[tokio::test]
    async fn test_delete_session_steps_keeps_session() {
        let (stores, _dir) = backends().await;
        for (name, storage) in stores {
            seed_session(&storage, "s", "sequential_thinking").await;
            for n in 1..=2 {
                storage
                    .save_step(&main_step("s", n, "Step", StepType::Synthesis))
                    .await
                    .unwrap();
            }

            assert_eq!(storage.delete_session_steps("s").await.unwrap(), 2, "{}", name);
            assert!(storage.get_session("s").await.unwrap().is_some(), "{}", name);

            // Numbering restarts once the log is empty
            assert_ok!(
                storage
                    .save_step(&main_step("s", 1, "Fresh", StepType::Decomposition))
                    .await,
                "{}",
                name
            );
        }
    }

    #[tokio::test]
    async fn test_metadata_round_trips() {
        let (stores, _dir) = backends().await;
        for (name, storage) in stores {
            seed_session(&storage, "s", "collaborative_reasoning").await;
            let draft = main_step("s", 1, "Gather views", StepType::Decomposition)
                .with_metadata(json!({"participants": ["ops", "dev"]}))
                .with_confidence(0.65)
                .with_next_step_needed(false);
            storage.save_step(&draft).await.unwrap();

            let stored = storage.get_step_by_number("s", None, 1).await.unwrap().unwrap();
            assert_eq!(
                stored.metadata,
                Some(json!({"participants": ["ops", "dev"]})),
                "{}",
                name
            );
            assert!((stored.confidence - 0.65).abs() < 1e-9, "{}", name);
            assert!(!stored.next_step_needed, "{}", name);
        }
    }
}

#[cfg(test)]
mod search_tests {
    use super::*;

    async fn seed_search_data(storage: &Arc<dyn Storage>) {
        seed_session(storage, "x", "debugging_approach").await;
        seed_session(storage, "y", "sequential_thinking").await;

        storage
            .save_step(
                &main_step("x", 1, "Reproduce the CRASH", StepType::Decomposition)
                    .with_confidence(0.6),
            )
            .await
            .unwrap();
        storage
            .save_step(
                &main_step("x", 2, "The crash may come from the cache", StepType::Hypothesis)
                    .with_confidence(0.75),
            )
            .await
            .unwrap();
        storage
            .save_step(
                &main_step("y", 1, "List the constraints", StepType::Decomposition)
                    .with_confidence(0.9),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_search_text_is_case_insensitive() {
        let (stores, _dir) = backends().await;
        for (name, storage) in stores {
            seed_search_data(&storage).await;
            let query = StepQuery {
                text: Some("crash".to_string()),
                ..Default::default()
            };
            let found = storage.search_steps(&query).await.unwrap();
            let numbers: Vec<u32> = found.iter().map(|s| s.step_number).collect();
            assert_eq!(numbers, vec![1, 2], "{}", name);
        }
    }

    #[tokio::test]
    async fn test_search_by_type_and_confidence() {
        let (stores, _dir) = backends().await;
        for (name, storage) in stores {
            seed_search_data(&storage).await;

            let decomposition = StepQuery {
                step_type: Some(StepType::Decomposition),
                ..Default::default()
            };
            assert_eq!(storage.search_steps(&decomposition).await.unwrap().len(), 2, "{}", name);

            let confident = StepQuery {
                min_confidence: Some(0.75),
                ..Default::default()
            };
            let found = storage.search_steps(&confident).await.unwrap();
            assert_eq!(found.len(), 2, "{}", name);
            assert!(found.iter().all(|s| s.confidence >= 0.75), "{}", name);
        }
    }

    #[tokio::test]
    async fn test_search_scoped_and_limited() {
        let (stores, _dir) = backends().await;
        for (name, storage) in stores {
            seed_search_data(&storage).await;

            let scoped = StepQuery {
                session_id: Some("y".to_string()),
                ..Default::default()
            };
            let found = storage.search_steps(&scoped).await.unwrap();
            assert_eq!(found.len(), 1, "{}", name);
            assert_eq!(found[0].content, "List the constraints", "{}", name);

            let limited = StepQuery {
                limit: Some(1),
                ..Default::default()
            };
            let found = storage.search_steps(&limited).await.unwrap();
            assert_eq!(found.len(), 1, "{}", name);
            assert_eq!(found[0].content, "Reproduce the CRASH", "{}", name);
        }
    }
}

#[cfg(test)]
mod concurrency_tests {
    use super::*;

    #[tokio::test]
    async fn test_concurrent_saves_of_same_number() {
        let (stores, _dir) = backends().await;
        for (name, storage) in stores {
            seed_session(&storage, "race", "sequential_thinking").await;
            for n in 1..=2 {
                storage
                    .save_step(&main_step("race", n, "Setup", StepType::Decomposition))
                    .await
                    .unwrap();
            }

            let left = main_step("race", 3, "Left", StepType::Hypothesis);
            let right = main_step("race", 3, "Right", StepType::Hypothesis);
            let (a, b) = tokio::join!(storage.save_step(&left), storage.save_step(&right));

            let successes = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
            assert_eq!(successes, 1, "{}", name);
            let failure = if a.is_err() { a } else { b };
            assert!(
                matches!(failure, Err(StorageError::StepConflict { step_number: 3, .. })),
                "{}",
                name
            );
            assert_eq!(storage.count_steps("race").await.unwrap(), 3, "{}", name);
        }
    }

    #[tokio::test]
    async fn test_concurrent_saves_across_tasks() {
        let (stores, _dir) = backends().await;
        for (name, storage) in stores {
            seed_session(&storage, "tasks", "sequential_thinking").await;

            let handles: Vec<_> = (0..4)
                .map(|i| {
                    let storage = storage.clone();
                    tokio::spawn(async move {
                        let draft = NewStep::new(
                            "tasks",
                            1,
                            3,
                            format!("Writer {}", i),
                            StepType::Decomposition,
                        );
                        storage.save_step(&draft).await
                    })
                })
                .collect();

            let mut ok = 0;
            for handle in handles {
                if handle.await.unwrap().is_ok() {
                    ok += 1;
                }
            }
            assert_eq!(ok, 1, "{}", name);
            assert_eq!(storage.count_steps("tasks").await.unwrap(), 1, "{}", name);
        }
    }
}
