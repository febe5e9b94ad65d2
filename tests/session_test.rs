//! Session manager integration tests against the mock chat service.

use aiwhisperer::config::ContinuationConfig;
use aiwhisperer::loop_manager::AiLoopManager;
use aiwhisperer::mailbox::{Mail, MailPriority, Mailbox};
use aiwhisperer::path_guard::PathGuard;
use aiwhisperer::persistence::StatePersistence;
use aiwhisperer::service::{AiServiceConfig, MockAiService, MockResponse};
use aiwhisperer::session::{
    AgentDefinition, AgentState, AsyncSessionManager, SessionError, SessionManagerOptions,
};
use aiwhisperer::tools::{ToolDeps, ToolRegistry};
use aiwhisperer::types::Notification;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

struct Harness {
    manager: AsyncSessionManager,
    mailbox: Arc<Mailbox>,
    notifications: mpsc::UnboundedReceiver<Notification>,
    _workspace: tempfile::TempDir,
}

/// Manager wired to a mock service that replays `script` per created agent.
fn harness(script: Vec<MockResponse>, persistence: Option<StatePersistence>) -> Harness {
    let workspace = tempfile::tempdir().unwrap();
    let mailbox = Arc::new(Mailbox::new());
    let registry = Arc::new(ToolRegistry::with_builtin_tools(ToolDeps {
        path_guard: Arc::new(PathGuard::new(workspace.path()).unwrap()),
        mailbox: mailbox.clone(),
    }));
    let (tx, rx) = mpsc::unbounded_channel();

    let loop_manager = AiLoopManager::new(
        AiServiceConfig::new("test-key", "mock/model"),
        registry.clone(),
        tx.clone(),
        1000,
    )
    .with_service_factory(Box::new(move |model, _params| {
        Arc::new(MockAiService::new(script.clone()).with_model(model))
    }));

    let manager = AsyncSessionManager::new(SessionManagerOptions {
        loop_manager,
        registry,
        mailbox: mailbox.clone(),
        notifications: tx,
        persistence,
        continuation: ContinuationConfig::default(),
    });
    manager.start();
    Harness {
        manager,
        mailbox,
        notifications: rx,
        _workspace: workspace,
    }
}

/// Wait for a notification with the given method, ignoring others.
async fn wait_for(
    rx: &mut mpsc::UnboundedReceiver<Notification>,
    method: &str,
    timeout: Duration,
) -> Notification {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Some(event)) if event.method == method => return event,
            Ok(Some(_)) => continue,
            Ok(None) => panic!("notification channel closed while waiting for {method}"),
            Err(_) => panic!("timed out waiting for {method}"),
        }
    }
}

#[tokio::test]
async fn direct_task_runs_to_completion() {
    let mut h = harness(vec![MockResponse::Text("done".into())], None);
    h.manager
        .create_agent(AgentDefinition::new("debbie", "You debug things."), true)
        .await
        .unwrap();

    let task_id = h.manager.send_task("debbie", "look at the logs", None).unwrap();

    let started = wait_for(
        &mut h.notifications,
        "async.task.started",
        Duration::from_secs(5),
    )
    .await;
    assert_eq!(started.params["agent_id"], "debbie");
    assert_eq!(started.params["task_id"], task_id.as_str());
    assert_eq!(started.params["task_type"], "direct");

    let completed = wait_for(
        &mut h.notifications,
        "async.task.completed",
        Duration::from_secs(5),
    )
    .await;
    assert_eq!(completed.params["result"]["final"], "done");

    h.manager.stop().await;
}

#[tokio::test]
async fn duplicate_agent_is_rejected() {
    let h = harness(vec![], None);
    h.manager
        .create_agent(AgentDefinition::new("a", "p"), false)
        .await
        .unwrap();
    let err = h
        .manager
        .create_agent(AgentDefinition::new("a", "p"), false)
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::AlreadyExists(_)));
    h.manager.stop().await;
}

#[tokio::test]
async fn mail_becomes_a_task_with_formatted_prompt() {
    let mut h = harness(vec![MockResponse::Text("acknowledged".into())], None);

    // Mail waits in the inbox before the agent even exists; the first
    // processor iteration picks it up.
    h.mailbox.send(Mail::new("claude", "debbie", "ping", "ack?"));
    h.manager
        .create_agent(AgentDefinition::new("debbie", "p"), true)
        .await
        .unwrap();

    let started = wait_for(
        &mut h.notifications,
        "async.task.started",
        Duration::from_secs(5),
    )
    .await;
    assert_eq!(started.params["task_type"], "mail");
    let prompt = started.params["prompt"].as_str().unwrap();
    assert!(prompt.contains("From: claude"));
    assert!(prompt.contains("Subject: ping"));

    wait_for(
        &mut h.notifications,
        "async.task.completed",
        Duration::from_secs(5),
    )
    .await;
    h.manager.stop().await;
}

#[tokio::test]
async fn queue_overflow_is_synchronous_back_pressure() {
    let h = harness(vec![], None);
    h.manager
        .create_agent(AgentDefinition::new("debbie", "p"), false)
        .await
        .unwrap();

    for i in 0..100 {
        h.manager.send_task("debbie", format!("task {i}"), None).unwrap();
    }
    let err = h.manager.send_task("debbie", "one too many", None).unwrap_err();
    assert!(matches!(err, SessionError::QueueFull(_)));

    let states = h.manager.agent_states();
    assert_eq!(states["debbie"].queue_depth, 100);
    h.manager.stop().await;
}

#[tokio::test]
async fn sleep_and_broadcast_wake() {
    let mut h = harness(vec![], None);
    h.manager
        .create_agent(AgentDefinition::new("debbie", "p"), false)
        .await
        .unwrap();

    h.manager
        .sleep_agent(
            "debbie",
            None,
            Some(HashSet::from(["deploy_done".to_string()])),
        )
        .await
        .unwrap();
    let states = h.manager.agent_states();
    assert_eq!(states["debbie"].state, AgentState::Sleeping);
    assert!(states["debbie"].wake_events.contains(&"deploy_done".to_string()));

    // Unrelated events do not wake it.
    h.manager
        .broadcast_event("unrelated", serde_json::json!({}))
        .await;
    assert_eq!(h.manager.agent_states()["debbie"].state, AgentState::Sleeping);

    h.manager
        .broadcast_event("deploy_done", serde_json::json!({}))
        .await;
    let woke = wait_for(&mut h.notifications, "agent.woke", Duration::from_secs(2)).await;
    assert_eq!(woke.params["agent_id"], "debbie");
    let states = h.manager.agent_states();
    assert_eq!(states["debbie"].state, AgentState::Idle);
    assert!(states["debbie"].sleep_until.is_none());
    h.manager.stop().await;
}

#[tokio::test]
async fn timer_expiry_wakes_sleeping_agent() {
    let mut h = harness(vec![], None);
    h.manager
        .create_agent(AgentDefinition::new("debbie", "p"), true)
        .await
        .unwrap();

    h.manager
        .sleep_agent("debbie", Some(Duration::from_secs(1)), None)
        .await
        .unwrap();
    assert_eq!(h.manager.agent_states()["debbie"].state, AgentState::Sleeping);

    let woke = wait_for(&mut h.notifications, "agent.woke", Duration::from_secs(10)).await;
    assert_eq!(woke.params["reason"], "scheduled");
    h.manager.stop().await;
}

#[tokio::test]
async fn high_priority_mail_wakes_subscribed_sleeper() {
    let mut h = harness(vec![MockResponse::Text("on it".into())], None);
    h.manager
        .create_agent(AgentDefinition::new("debbie", "p"), true)
        .await
        .unwrap();
    h.manager
        .sleep_agent(
            "debbie",
            None,
            Some(HashSet::from(["high_priority_mail".to_string()])),
        )
        .await
        .unwrap();

    h.mailbox.send(
        Mail::new("claude", "debbie", "urgent", "wake up").with_priority(MailPriority::High),
    );

    let woke = wait_for(&mut h.notifications, "agent.woke", Duration::from_secs(10)).await;
    assert!(woke.params["reason"]
        .as_str()
        .unwrap()
        .contains("High priority mail"));

    // The mail still becomes a task after waking.
    let started = wait_for(
        &mut h.notifications,
        "async.task.started",
        Duration::from_secs(10),
    )
    .await;
    assert_eq!(started.params["task_type"], "mail");
    h.manager.stop().await;
}

#[tokio::test]
async fn explicit_continue_schedules_one_more_turn() {
    let script = vec![
        MockResponse::Text(
            r#"{"final": "step one", "continuation": {"status": "CONTINUE", "reason": "more to do"}}"#
                .into(),
        ),
        MockResponse::Text(
            r#"{"final": "all done", "continuation": {"status": "TERMINATE"}}"#.into(),
        ),
    ];
    let mut h = harness(script, None);
    h.manager
        .create_agent(AgentDefinition::new("planner", "You plan."), true)
        .await
        .unwrap();

    h.manager.send_task("planner", "plan the work", None).unwrap();

    wait_for(
        &mut h.notifications,
        "async.task.completed",
        Duration::from_secs(5),
    )
    .await;
    let continuation = wait_for(
        &mut h.notifications,
        "async.task.continuation",
        Duration::from_secs(5),
    )
    .await;
    assert_eq!(continuation.params["agent_id"], "planner");

    // The continuation turn completes and terminates; no further
    // continuation notification may arrive.
    let completed = wait_for(
        &mut h.notifications,
        "async.task.completed",
        Duration::from_secs(10),
    )
    .await;
    assert_eq!(completed.params["result"]["final"], "all done");

    tokio::time::sleep(Duration::from_millis(300)).await;
    let mut extra_continuations = 0;
    while let Ok(event) = h.notifications.try_recv() {
        if event.method == "async.task.continuation" {
            extra_continuations += 1;
        }
    }
    assert_eq!(extra_continuations, 0);
    h.manager.stop().await;
}

#[tokio::test]
async fn stop_agent_is_terminal_and_releases_session() {
    let mut h = harness(vec![MockResponse::Text("ok".into())], None);
    h.manager
        .create_agent(AgentDefinition::new("debbie", "p"), true)
        .await
        .unwrap();
    h.manager.stop_agent("debbie").await.unwrap();

    wait_for(&mut h.notifications, "agent.stopped", Duration::from_secs(5)).await;
    assert!(h.manager.agent_states().is_empty());
    assert!(matches!(
        h.manager.send_task("debbie", "anything", None),
        Err(SessionError::NotFound(_))
    ));
    h.manager.stop().await;
}

#[tokio::test]
async fn session_state_round_trips_through_persistence() {
    let state_dir = tempfile::tempdir().unwrap();

    // First manager: build state and snapshot it.
    {
        let store = StatePersistence::new(state_dir.path(), "session-1").unwrap();
        let h = harness(vec![], Some(store));
        h.manager
            .create_agent(AgentDefinition::new("debbie", "You debug."), false)
            .await
            .unwrap();
        h.manager.send_task("debbie", "first", None).unwrap();
        h.manager.send_task("debbie", "second", None).unwrap();
        h.manager
            .sleep_agent(
                "debbie",
                Some(Duration::from_secs(3600)),
                Some(HashSet::from(["mail_received".to_string()])),
            )
            .await
            .unwrap();
        h.manager.save_session_state("debbie").await.unwrap();
        h.manager.stop().await;
    }

    // Second manager: restore from the same directory.
    let store = StatePersistence::new(state_dir.path(), "session-2").unwrap();
    let h = harness(vec![], Some(store));
    let restored = h.manager.restore_all_session_states().await;
    assert_eq!(restored, 1);

    let states = h.manager.agent_states();
    let debbie = &states["debbie"];
    assert_eq!(debbie.state, AgentState::Sleeping);
    assert!(debbie.sleep_until.is_some());
    assert!(debbie.wake_events.contains(&"mail_received".to_string()));
    assert_eq!(debbie.queue_depth, 2);
    h.manager.stop().await;
}
