//! External tests for session behaviour: one-shot logout under concurrent
//! auth failures, dummy-session safety, error bookkeeping and polling.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use jolokia_session::transport::HttpReply;
use jolokia_session::{
    AgentRequest, ConnectError, DetachedHost, EndpointResult, LogoutHooks, MemoryStore,
    NavigationContext, RequestParams, ScriptedTransport, Session, SessionFactory,
};

const AGENT: &str = "http://agent:8778/jolokia";

fn nav() -> NavigationContext {
    NavigationContext::parse("http://console:8080/hawtio/", "/hawtio/").unwrap()
}

fn live_session(transport: &Arc<ScriptedTransport>, hooks: &Arc<LogoutHooks>) -> Session {
    SessionFactory::builder(nav())
        .store(Arc::new(MemoryStore::new()))
        .transport(transport.clone())
        .host(Arc::new(DetachedHost::new()))
        .hooks(hooks.clone())
        .build()
        .create_session(&EndpointResult::Found(AGENT.into()), None)
}

// -- Auth failure ---------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_401s_log_out_once() {
    let transport = Arc::new(ScriptedTransport::new().with_latency(Duration::from_millis(5)));
    transport.reply(AGENT, HttpReply::new(401, "unauthorized"));

    let runs = Arc::new(AtomicUsize::new(0));
    let hooks = Arc::new(LogoutHooks::new());
    let counter = runs.clone();
    hooks.add_pre_logout("count", move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    let session = live_session(&transport, &hooks);
    let mut tasks = Vec::new();
    for _ in 0..12 {
        let s = session.clone();
        tasks.push(tokio::spawn(async move { s.request_batch(vec![AgentRequest::version()]).await }));
    }
    for task in tasks {
        let result = task.await.unwrap();
        assert!(matches!(result, Err(ConnectError::AuthRejected { status: 401, .. })));
    }

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(session.auth_failed());
    // Auth failures are handled, not recorded as errors.
    assert!(session.status().last_error_response.is_none());
}

#[tokio::test]
async fn test_403_is_treated_like_401() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.reply(AGENT, HttpReply::new(403, "forbidden"));
    let hooks = Arc::new(LogoutHooks::new());
    let session = live_session(&transport, &hooks);

    let err = session.version().await.unwrap_err();
    assert!(matches!(err, ConnectError::AuthRejected { status: 403, .. }));
    assert!(session.auth_failed());
}

#[tokio::test]
async fn test_sessions_do_not_share_auth_latch() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.reply(AGENT, HttpReply::new(401, ""));
    let runs = Arc::new(AtomicUsize::new(0));
    let hooks = Arc::new(LogoutHooks::new());
    let counter = runs.clone();
    hooks.add_post_logout("count", move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    let first = live_session(&transport, &hooks);
    let second = live_session(&transport, &hooks);
    let _ = first.version().await;
    let _ = first.version().await;
    let _ = second.version().await;
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

// -- Error bookkeeping ----------------------------------------------------

#[tokio::test]
async fn test_http_error_is_recorded_without_logout() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.reply(AGENT, HttpReply::new(500, "boom"));
    let hooks = Arc::new(LogoutHooks::new());
    let session = live_session(&transport, &hooks);

    let err = session.version().await.unwrap_err();
    assert_eq!(err.status(), Some(500));
    let record = session.status().last_error_response.unwrap();
    assert_eq!(record.status, Some(500));
    assert_eq!(record.detail, "boom");
    assert!(!session.auth_failed());
}

#[tokio::test]
async fn test_in_body_error_surfaces_as_remote() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.reply(
        AGENT,
        HttpReply::json(&json!([{"status": 404, "error": "javax.management.InstanceNotFoundException"}])),
    );
    let hooks = Arc::new(LogoutHooks::new());
    let session = live_session(&transport, &hooks);

    let err = session.get_attribute("x:type=Missing", "A").await.unwrap_err();
    assert!(matches!(err, ConnectError::Remote { status: 404, .. }));
    assert!(session.status().last_error_response.is_none());
}

#[tokio::test]
async fn test_request_params_travel_as_query() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.reply(AGENT, HttpReply::json(&json!([{"value": "12345@box", "status": 200}])));
    let hooks = Arc::new(LogoutHooks::new());
    let session = live_session(&transport, &hooks);

    assert_eq!(session.process_id().await.unwrap().as_deref(), Some("pid:12345"));
    let sent = &transport.sent()[0];
    let query: Vec<(String, String)> = sent.url.query_pairs().into_owned().collect();
    assert!(query.contains(&("maxDepth".to_string(), "7".to_string())));
    assert!(query.contains(&("ignoreErrors".to_string(), "true".to_string())));
    assert!(sent.json_body().unwrap().is_array());
}

// -- Dummy session --------------------------------------------------------

#[test]
fn test_dummy_session_operations_are_inert() {
    let session = Session::dummy(RequestParams::default());
    tokio_test::block_on(async {
        assert_eq!(session.version().await.unwrap(), None);
        assert_eq!(session.list(None).await.unwrap(), None);
        assert!(session.search("*:*").await.unwrap().is_empty());
        assert!(session.request_batch(vec![AgentRequest::version()]).await.unwrap().is_empty());
        assert_eq!(session.process_id().await.unwrap(), None);
    });
    assert!(session.is_dummy());
    assert!(session.url().is_none());
}

#[test]
fn test_dummy_session_start_stop_toggles_running() {
    let session = Session::dummy(RequestParams::default());
    assert!(!session.is_running());
    session.start(Duration::from_secs(1));
    assert!(session.is_running());
    session.stop();
    assert!(!session.is_running());
    assert!(session.jobs().is_empty());
}

#[test]
fn test_not_found_builds_dummy() {
    let session = SessionFactory::builder(nav())
        .transport(Arc::new(ScriptedTransport::new()))
        .build()
        .create_session(&EndpointResult::NotFound, None);
    assert!(session.is_dummy());
}

// -- Polling through a session --------------------------------------------

#[tokio::test]
async fn test_poll_once_delivers_only_changes() {
    let transport = Arc::new(ScriptedTransport::new());
    transport
        .reply(AGENT, HttpReply::json(&json!([{"value": 1, "status": 200}])))
        .reply(AGENT, HttpReply::json(&json!([{"value": 1, "status": 200}])))
        .reply(AGENT, HttpReply::json(&json!([{"value": 2, "status": 200}])));
    let hooks = Arc::new(LogoutHooks::new());
    let session = live_session(&transport, &hooks);

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    let handle = session.register(AgentRequest::read("java.lang:type=Threading", "ThreadCount"), move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    for _ in 0..3 {
        session.poll_once().await.unwrap();
    }
    assert_eq!(seen.load(Ordering::SeqCst), 2);
    assert!(session.unregister(handle));
    assert!(session.jobs().is_empty());
}
