//! Out-of-process test plugin exercising the plugin protocol's
//! stranger corners, grounded in `gsignond-ssotest-plugin.c`: a
//! deliberately slow `request_initial` that can be interrupted
//! mid-flight, a mechanism that never answers at all, and a
//! mechanism requiring a ui round trip.
//!
//! Not part of any production method list; used by `sso-daemon`'s
//! integration tests to drive the daemon/session/proxy plumbing
//! against real process boundaries instead of in-process fakes.

use sso_dictionary::{Dictionary, SsoError};
use sso_plugin_protocol::{decode_request, encode_event, Event, Request};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

const MECHANISMS: &[&str] = &["mech1", "mech2", "mech3", "BLOB"];

type CancelFlags = Arc<Mutex<HashMap<u64, Arc<AtomicBool>>>>;

fn print_mechanisms() {
    for mechanism in MECHANISMS {
        println!("{mechanism}");
    }
}

#[tokio::main]
async fn main() {
    if std::env::args().any(|arg| arg == "--mechanisms") {
        print_mechanisms();
        return;
    }

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_env("SSO_LOG"))
        .init();

    let flags: CancelFlags = Arc::new(Mutex::new(HashMap::new()));

    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(event) = rx.recv().await {
            match encode_event(&event) {
                Ok(line) => {
                    if stdout.write_all(line.as_bytes()).await.is_err() {
                        break;
                    }
                    let _ = stdout.flush().await;
                }
                Err(err) => tracing::warn!(%err, "failed to encode event"),
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        match decode_request(&line) {
            Ok(request) => handle(request, &flags, &tx),
            Err(err) => tracing::warn!(%err, "malformed request, ignoring line"),
        }
    }

    drop(tx);
    let _ = writer.await;
}

fn handle(request: Request, flags: &CancelFlags, tx: &mpsc::UnboundedSender<Event>) {
    match request {
        Request::RequestInitial { tag, mechanism, params } | Request::Request { tag, mechanism, params } => {
            let flag = Arc::new(AtomicBool::new(false));
            flags.lock().unwrap().insert(tag, flag.clone());
            let tx = tx.clone();
            let flags = flags.clone();
            tokio::spawn(async move {
                run_request(tag, mechanism, params, flag, &tx).await;
                flags.lock().unwrap().remove(&tag);
            });
        }
        Request::UserActionFinished { tag, data } => user_action_finished(tag, data, tx),
        Request::Cancel { tag } => {
            if let Some(flag) = flags.lock().unwrap().get(&tag) {
                flag.store(true, Ordering::SeqCst);
            }
        }
        Request::Refresh { dialog_id, data } => {
            let _ = tx.send(Event::Refreshed { dialog_id, data });
        }
    }
}

/// Runs the ten-iteration "hello from the test plugin" status loop,
/// then dispatches on `mechanism` exactly as
/// `gsignond_ssotest_plugin_request_initial` does.
async fn run_request(
    tag: u64,
    mechanism: String,
    params: Dictionary,
    is_canceled: Arc<AtomicBool>,
    tx: &mpsc::UnboundedSender<Event>,
) {
    let mut response = params.clone();
    response.set_string("realm", "testRealm_after_test");

    for _ in 0..10 {
        if !is_canceled.load(Ordering::SeqCst) {
            let _ = tx.send(Event::StatusChanged {
                tag,
                status: "hello from the test plugin".into(),
            });
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    if is_canceled.load(Ordering::SeqCst) {
        let _ = tx.send(Event::error(tag, &SsoError::SessionCanceled));
        return;
    }

    dispatch_mechanism(tag, &mechanism, &params, response, tx);
}

/// The post-loop, non-canceled mechanism dispatch, split out so it
/// can be exercised without the sleep loop.
fn dispatch_mechanism(
    tag: u64,
    mechanism: &str,
    params: &Dictionary,
    response: Dictionary,
    tx: &mpsc::UnboundedSender<Event>,
) {
    match mechanism {
        "BLOB" | "mech1" => {
            let _ = tx.send(Event::ResponseFinal { tag, data: response });
        }
        "mech2" => {
            let mut ui_data = Dictionary::new();
            match params.get_string("username") {
                Some(username) => ui_data.set_string("username", username),
                None => ui_data.set_bool("query_username", true),
            }
            ui_data.set_bool("query_password", true);
            let dialog_id = format!("ssotest-{tag}");
            let _ = tx.send(Event::UserActionRequired {
                tag,
                dialog_id,
                data: ui_data,
            });
        }
        // mech3 and anything else: the reference plugin never
        // answers at all; the caller is expected to cancel it.
        _ => {}
    }
}

fn user_action_finished(tag: u64, data: Dictionary, tx: &mpsc::UnboundedSender<Event>) {
    let Some(error) = data.get_string("query_error") else {
        let _ = tx.send(Event::error(
            tag,
            &SsoError::UserInteraction("userActionFinished did not return an error value".into()),
        ));
        return;
    };

    let err = match error {
        "none" => {
            match (
                data.get_string("username").map(str::to_string),
                data.get_string("secret").map(str::to_string),
            ) {
                (Some(username), Some(secret)) => {
                    let mut response = Dictionary::new();
                    response.set_string("username", username);
                    response.set_string("secret", secret);
                    let _ = tx.send(Event::ResponseFinal { tag, data: response });
                    return;
                }
                _ => SsoError::UserInteraction("user_action_finished: missing credentials".into()),
            }
        }
        "canceled" => SsoError::SessionCanceled,
        "forbidden" => SsoError::NotAuthorized,
        other => SsoError::UserInteraction(format!("user_action_finished error: {other}")),
    };
    let _ = tx.send(Event::error(tag, &err));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_and_mech1_respond_final() {
        for mechanism in ["BLOB", "mech1"] {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let params = Dictionary::new();
            dispatch_mechanism(1, mechanism, &params, params.clone(), &tx);
            match rx.try_recv().unwrap() {
                Event::ResponseFinal { tag, .. } => assert_eq!(tag, 1),
                other => panic!("unexpected event for {mechanism}: {other:?}"),
            }
        }
    }

    #[test]
    fn mech2_without_username_requests_both_fields() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let params = Dictionary::new();
        dispatch_mechanism(2, "mech2", &params, params.clone(), &tx);
        match rx.try_recv().unwrap() {
            Event::UserActionRequired { data, .. } => {
                assert_eq!(data.get_bool("query_username"), Some(true));
                assert_eq!(data.get_bool("query_password"), Some(true));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn mech2_with_username_only_queries_password() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut params = Dictionary::new();
        params.set_string("username", "alice");
        dispatch_mechanism(2, "mech2", &params, params.clone(), &tx);
        match rx.try_recv().unwrap() {
            Event::UserActionRequired { data, .. } => {
                assert_eq!(data.get_string("username"), Some("alice"));
                assert_eq!(data.get_bool("query_password"), Some(true));
                assert_eq!(data.get_bool("query_username"), None);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn mech3_never_responds() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let params = Dictionary::new();
        dispatch_mechanism(3, "mech3", &params, params.clone(), &tx);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn user_action_finished_without_query_error_is_generic_error() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        user_action_finished(1, Dictionary::new(), &tx);
        match rx.try_recv().unwrap() {
            Event::Error { kind, .. } => assert_eq!(kind, "UserInteraction"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn user_action_finished_forbidden_maps_to_not_authorized() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut data = Dictionary::new();
        data.set_string("query_error", "forbidden");
        user_action_finished(1, data, &tx);
        match rx.try_recv().unwrap() {
            Event::Error { kind, .. } => assert_eq!(kind, "NotAuthorized"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn canceled_mid_loop_emits_session_canceled() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let flag = Arc::new(AtomicBool::new(false));
        let flag_clone = flag.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(15)).await;
            flag_clone.store(true, Ordering::SeqCst);
        });
        run_request(1, "mech1".into(), Dictionary::new(), flag, &tx).await;

        let mut saw_cancel = false;
        while let Ok(event) = rx.try_recv() {
            if let Event::Error { kind, .. } = event {
                assert_eq!(kind, "SessionCanceled");
                saw_cancel = true;
            }
        }
        assert!(saw_cancel);
    }
}
