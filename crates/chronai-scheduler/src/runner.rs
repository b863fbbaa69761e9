//! Execution runner: one attempt, one outcome record, or none when the
//! execution is correctly skipped.

use chrono::Utc;
use tracing::{debug, error, info};

use chronai_types::NewExecutionLog;

use crate::ExecutionEnv;

/// Run one execution for a task id. Used identically by trigger firings
/// and immediate executions. Never returns an error and never panics the
/// caller's loop; everything unexpected ends up in the outcome record or
/// the log.
pub(crate) async fn execute(env: &ExecutionEnv, task_id: i64) {
    info!("Executing task {task_id}");

    // Always a fresh read: the task may have been edited or deleted
    // between scheduling and this firing.
    let task = match env.store.get_task(task_id).await {
        Ok(Some(task)) => task,
        Ok(None) => {
            error!("Task {task_id} not found, skipping execution");
            return;
        }
        Err(e) => {
            error!("Failed to load task {task_id}: {e}");
            return;
        }
    };

    // The runner is the final enablement gate; the task may have been
    // disabled after its job was registered.
    if !task.enabled {
        info!("Task {task_id} is disabled, skipping execution");
        return;
    }

    let executed_at = Utc::now();

    let log = match env.cipher.decrypt(&task.api_key) {
        Ok(api_key) => {
            info!(
                "Calling chat API for task {task_id} (key: {})",
                chronai_security::mask(&api_key)
            );
            match env
                .client
                .send_message(
                    &task.api_endpoint,
                    &api_key,
                    &task.message_content,
                    Some(&task.model),
                )
                .await
            {
                Ok(reply) => {
                    info!("Task {task_id} executed successfully in {}ms", reply.elapsed_ms);
                    NewExecutionLog::success(
                        task_id,
                        executed_at,
                        format!("{} (耗时: {}ms)", reply.summary, reply.elapsed_ms),
                    )
                }
                Err(e) => {
                    error!("Task {task_id} failed: {}", e.message);
                    NewExecutionLog::failed(task_id, executed_at, e.message)
                }
            }
        }
        // Outside the classified taxonomy (a credential that does not
        // decrypt); recorded like any other unexpected error.
        Err(e) => {
            error!("Task {task_id} failed with unexpected error: {e}");
            NewExecutionLog::failed(task_id, executed_at, format!("Unexpected error: {e}"))
        }
    };

    if let Err(e) = env.store.insert_log(log).await {
        error!("Failed to save execution log for task {task_id}: {e}");
    } else {
        debug!("Saved execution log for task {task_id}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use chronai_openai::ChatClient;
    use chronai_security::CredentialCipher;
    use chronai_store::TaskStore;
    use chronai_types::{ExecutionStatus, NewTask, ScheduleType};

    fn test_env(store: TaskStore) -> Arc<ExecutionEnv> {
        Arc::new(ExecutionEnv {
            store,
            client: ChatClient::with_timeout(Duration::from_millis(300))
                .with_retry(1, Duration::from_millis(1)),
            cipher: CredentialCipher::new([9u8; 32]),
        })
    }

    async fn seed_task(env: &ExecutionEnv, endpoint: &str, enabled: bool) -> i64 {
        let api_key = env.cipher.encrypt("sk-test1234567890").unwrap();
        env.store
            .create_task(NewTask {
                name: "runner test".into(),
                api_endpoint: endpoint.into(),
                api_key,
                schedule_type: ScheduleType::Interval,
                interval_minutes: Some(5),
                interval_seconds: None,
                fixed_time: None,
                message_content: "ping".into(),
                model: "gpt-3.5-turbo".into(),
                enabled,
            })
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_success_writes_one_success_row() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "all clear"}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let env = test_env(TaskStore::open_in_memory().unwrap());
        let task_id = seed_task(&env, &server.uri(), true).await;

        execute(&env, task_id).await;

        let logs = env.store.list_logs(task_id, 10).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, ExecutionStatus::Success);
        assert!(logs[0].error_message.is_none());

        let summary = logs[0].response_summary.as_deref().unwrap();
        assert!(summary.starts_with("all clear (耗时: "), "got: {summary}");
        assert!(summary.ends_with("ms)"));
    }

    #[tokio::test]
    async fn test_classified_failure_writes_one_failed_row() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid key"))
            .expect(1)
            .mount(&server)
            .await;

        let env = test_env(TaskStore::open_in_memory().unwrap());
        let task_id = seed_task(&env, &server.uri(), true).await;

        execute(&env, task_id).await;

        let logs = env.store.list_logs(task_id, 10).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, ExecutionStatus::Failed);
        assert!(logs[0].response_summary.is_none());
        let error = logs[0].error_message.as_deref().unwrap();
        assert!(error.contains("401"));
        assert!(error.contains("invalid key"));
        // 4xx is never retried
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_disabled_task_writes_no_row() {
        let env = test_env(TaskStore::open_in_memory().unwrap());
        let task_id = seed_task(&env, "http://127.0.0.1:1", false).await;

        execute(&env, task_id).await;

        assert_eq!(env.store.count_logs(task_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_missing_task_writes_no_row_and_does_not_panic() {
        let env = test_env(TaskStore::open_in_memory().unwrap());
        let task_id = seed_task(&env, "http://127.0.0.1:1", true).await;
        assert!(env.store.delete_task(task_id).await.unwrap());

        execute(&env, task_id).await;

        assert_eq!(env.store.count_logs(task_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_undecryptable_credential_is_unexpected_error() {
        let env = test_env(TaskStore::open_in_memory().unwrap());
        let task_id = seed_task(&env, "http://127.0.0.1:1", true).await;

        // Corrupt the stored credential by re-saving garbage.
        let mut task = env.store.get_task(task_id).await.unwrap().unwrap();
        task.api_key = "bm90LWEtcmVhbC1jaXBoZXJ0ZXh0LWF0LWFsbC0xMjM0NTY3ODkw".into();
        env.store.update_task(task).await.unwrap();

        execute(&env, task_id).await;

        let logs = env.store.list_logs(task_id, 10).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, ExecutionStatus::Failed);
        assert!(
            logs[0]
                .error_message
                .as_deref()
                .unwrap()
                .starts_with("Unexpected error: ")
        );
    }

    #[tokio::test]
    async fn test_network_failure_is_classified_without_status() {
        let env = test_env(TaskStore::open_in_memory().unwrap());
        let task_id = seed_task(&env, "http://127.0.0.1:1/v1/chat/completions", true).await;

        execute(&env, task_id).await;

        let logs = env.store.list_logs(task_id, 10).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, ExecutionStatus::Failed);
        assert!(
            logs[0]
                .error_message
                .as_deref()
                .unwrap()
                .starts_with("Network error")
        );
    }
}
