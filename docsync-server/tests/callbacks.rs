//! Scheduled callbacks on session documents and on the server context.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use docsync_core::{CallbackError, CallbackHandle, Document, DocumentCallback, Model, Value};
use docsync_server::{ApplicationContext, ClientSession, ServerSession};
use parking_lot::Mutex;

use common::{empty_handler, start_default};

async fn session(id: &str) -> (Arc<ApplicationContext>, Arc<ServerSession>) {
    let app = ApplicationContext::new("/", empty_handler());
    let session = app.create_session_if_needed(id, None, None).await.unwrap();
    (app, session)
}

#[tokio::test]
async fn test_periodic_callback_removes_itself() {
    let (_app, session) = session("P1").await;
    let runs = Arc::new(AtomicUsize::new(0));
    let slot: Arc<Mutex<Option<CallbackHandle>>> = Arc::new(Mutex::new(None));

    let counter = Arc::clone(&runs);
    let own = Arc::clone(&slot);
    let handle = session
        .with_document_locked(move |doc| {
            doc.add_periodic_callback(
                DocumentCallback::plain(move |doc: &mut Document| {
                    if counter.fetch_add(1, Ordering::SeqCst) + 1 == 3 {
                        if let Some(handle) = *own.lock() {
                            doc.remove_periodic_callback(handle).unwrap();
                        }
                    }
                }),
                Duration::from_millis(10),
            )
        })
        .await
        .unwrap()
        .unwrap();
    *slot.lock() = Some(handle);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 3);
    assert_eq!(session.scheduled_callbacks(), 0);

    let again = session
        .with_document_locked(move |doc| doc.remove_periodic_callback(handle))
        .await
        .unwrap();
    assert_eq!(again, Err(CallbackError::AlreadyRemoved));
}

#[tokio::test]
async fn test_timeout_callback_fires_once() {
    let (_app, session) = session("T1").await;
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);
    let handle = session
        .with_document_locked(move |doc| {
            doc.add_timeout_callback(
                DocumentCallback::plain(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
                Duration::from_millis(20),
            )
        })
        .await
        .unwrap()
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    let removed = session
        .with_document_locked(move |doc| doc.remove_timeout_callback(handle))
        .await
        .unwrap();
    assert_eq!(removed, Err(CallbackError::AlreadyRemoved));
}

#[tokio::test]
async fn test_removed_timeout_never_fires() {
    let (_app, session) = session("T2").await;
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);
    session
        .with_document_locked(move |doc| {
            let handle = doc
                .add_timeout_callback(
                    DocumentCallback::plain(move |_| {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }),
                    Duration::from_millis(50),
                )
                .unwrap();
            doc.remove_timeout_callback(handle).unwrap();
        })
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert_eq!(session.scheduled_callbacks(), 0);
}

#[tokio::test]
async fn test_removal_with_wrong_kind_is_refused() {
    let (_app, session) = session("K1").await;
    let result = session
        .with_document_locked(|doc| {
            let handle = doc
                .add_periodic_callback(DocumentCallback::plain(|_| {}), Duration::from_secs(60))
                .unwrap();
            doc.remove_timeout_callback(handle)
        })
        .await
        .unwrap();
    assert!(matches!(result, Err(CallbackError::WrongKind { .. })));
    assert_eq!(session.scheduled_callbacks(), 1);
}

#[tokio::test]
async fn test_suspending_callback_keeps_lock() {
    let (_app, session) = session("A1").await;
    session
        .with_document_locked(|doc| {
            doc.add_root(Model::with_id("r", "Label").with("n", 0i64), None).unwrap();
            doc.add_next_tick_callback(DocumentCallback::suspending(|doc| {
                Box::pin(async move {
                    doc.set_property(&"r".into(), "n", 1i64, None).unwrap();
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    doc.set_property(&"r".into(), "n", 2i64, None).unwrap();
                })
            }))
            .unwrap();
        })
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(10)).await;
    let n = session
        .with_document_locked(|doc| doc.get_property(&"r".into(), "n").cloned())
        .await
        .unwrap();
    assert_eq!(n, Some(Value::Int(2)));
}

#[tokio::test]
async fn test_callback_change_reaches_client() {
    let server = start_default().await;
    let client = ClientSession::connect(&server.ws_url(), &server.token("S1"))
        .await
        .unwrap();
    let mut doc = Document::new();
    doc.add_root(Model::with_id("r", "Label").with("text", "before"), None)
        .unwrap();
    client.push(&doc).await.unwrap();

    let session = server.app.get_session("S1").unwrap();
    session
        .with_document_locked(|doc| {
            doc.add_timeout_callback(
                DocumentCallback::plain(|doc| {
                    doc.set_property(&"r".into(), "text", "after", None).unwrap();
                }),
                Duration::from_millis(20),
            )
            .unwrap();
        })
        .await
        .unwrap();

    let mut text = None;
    for _ in 0..100 {
        client.force_roundtrip().await.unwrap();
        text = client
            .with_document(|doc| doc.get_property(&"r".into(), "text").cloned())
            .await
            .unwrap();
        if text == Some(Value::from("after")) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(text, Some(Value::from("after")));
    assert_eq!(client.received_patch_count(), 1);
}

#[tokio::test]
async fn test_server_context_callbacks() {
    let app = ApplicationContext::new("/", empty_handler());
    let server = app.server_context();
    let ticks = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&ticks);
    let periodic = server.add_periodic_callback(
        move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        },
        Duration::from_millis(10),
    );
    let fired = Arc::new(AtomicUsize::new(0));
    let once = Arc::clone(&fired);
    server.add_next_tick_callback(move || {
        let once = Arc::clone(&once);
        async move {
            once.fetch_add(1, Ordering::SeqCst);
        }
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(ticks.load(Ordering::SeqCst) >= 3);
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    assert_eq!(server.remove_periodic_callback(periodic), Ok(()));
    assert_eq!(server.remove_periodic_callback(periodic), Err(CallbackError::AlreadyRemoved));
    assert_eq!(server.callback_count(), 0);
}

#[tokio::test]
async fn test_unload_stops_server_callbacks() {
    let app = ApplicationContext::new("/", empty_handler());
    let ticks = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&ticks);
    app.server_context().add_periodic_callback(
        move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        },
        Duration::from_millis(10),
    );
    app.run_unload_hook().await;
    let seen = ticks.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(ticks.load(Ordering::SeqCst), seen);
    assert_eq!(app.server_context().callback_count(), 0);
}
