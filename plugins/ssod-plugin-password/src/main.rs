//! Out-of-process `password` method plugin, grounded in
//! `gsignond-password-plugin.c`: if the caller already supplied a
//! non-empty secret it is echoed back immediately, otherwise a ui
//! round trip collects username/password.
//!
//! Speaks the daemon's newline-delimited JSON protocol
//! (`sso-plugin-protocol`) over stdin/stdout. `--mechanisms` prints
//! the supported mechanism names, one per line, and exits.

use sso_dictionary::{Dictionary, SsoError};
use sso_plugin_protocol::{decode_request, encode_event, Event, Request};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

const MECHANISMS: &[&str] = &["password"];

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
            Ok(request) => handle(request, &tx),
            Err(err) => tracing::warn!(%err, "malformed request, ignoring line"),
        }
    }

    drop(tx);
    let _ = writer.await;
}

fn handle(request: Request, tx: &mpsc::UnboundedSender<Event>) {
    match request {
        Request::RequestInitial { tag, params, .. } | Request::Request { tag, params, .. } => {
            request_initial(tag, params, tx)
        }
        Request::UserActionFinished { tag, data } => user_action_finished(tag, data, tx),
        Request::Cancel { tag } => {
            let _ = tx.send(Event::error(tag, &SsoError::SessionCanceled));
        }
        Request::Refresh { dialog_id, data } => {
            let _ = tx.send(Event::Refreshed { dialog_id, data });
        }
    }
}

fn request_initial(tag: u64, params: Dictionary, tx: &mpsc::UnboundedSender<Event>) {
    let username = params.get_string("username").map(str::to_string);
    let secret = params.get_string("secret").map(str::to_string);

    if let Some(secret) = secret.filter(|s| !s.is_empty()) {
        let mut response = Dictionary::new();
        if let Some(username) = username.filter(|u| !u.is_empty()) {
            response.set_string("username", username);
        }
        response.set_string("secret", secret);
        let _ = tx.send(Event::ResponseFinal { tag, data: response });
        return;
    }

    let mut ui_data = Dictionary::new();
    match username.filter(|u| !u.is_empty()) {
        Some(username) => {
            ui_data.set_bool("query_username", false);
            ui_data.set_string("username", username);
        }
        None => ui_data.set_bool("query_username", true),
    }
    ui_data.set_bool("query_password", true);
    let dialog_id = format!("password-{tag}");
    let _ = tx.send(Event::UserActionRequired {
        tag,
        dialog_id,
        data: ui_data,
    });
}

fn user_action_finished(tag: u64, data: Dictionary, tx: &mpsc::UnboundedSender<Event>) {
    if let Some(error) = data.get_string("query_error") {
        let err = match error {
            "canceled" => SsoError::SessionCanceled,
            other => SsoError::UserInteraction(format!("userActionFinished error: {other}")),
        };
        let _ = tx.send(Event::error(tag, &err));
        return;
    }

    match (
        data.get_string("username").map(str::to_string),
        data.get_string("password").map(str::to_string),
    ) {
        (Some(username), Some(password)) => {
            let mut response = Dictionary::new();
            response.set_string("username", username);
            response.set_string("secret", password);
            let _ = tx.send(Event::ResponseFinal { tag, data: response });
        }
        _ => {
            let _ = tx.send(Event::error(
                tag,
                &SsoError::UserInteraction(
                    "userActionFinished did not return an error value".into(),
                ),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recv(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
        rx.try_recv().expect("expected an emitted event")
    }

    #[test]
    fn non_empty_secret_short_circuits_to_final() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut params = Dictionary::new();
        params.set_string("username", "alice");
        params.set_string("secret", "hunter2");

        request_initial(1, params, &tx);

        match recv(&mut rx) {
            Event::ResponseFinal { tag, data } => {
                assert_eq!(tag, 1);
                assert_eq!(data.get_string("username"), Some("alice"));
                assert_eq!(data.get_string("secret"), Some("hunter2"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn missing_secret_requests_ui_action() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        request_initial(2, Dictionary::new(), &tx);

        match recv(&mut rx) {
            Event::UserActionRequired { tag, data, .. } => {
                assert_eq!(tag, 2);
                assert_eq!(data.get_bool("query_username"), Some(true));
                assert_eq!(data.get_bool("query_password"), Some(true));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn user_action_finished_with_credentials_responds_final() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut ui_data = Dictionary::new();
        ui_data.set_string("username", "bob");
        ui_data.set_string("password", "s3cr3t");

        user_action_finished(3, ui_data, &tx);

        match recv(&mut rx) {
            Event::ResponseFinal { tag, data } => {
                assert_eq!(tag, 3);
                assert_eq!(data.get_string("secret"), Some("s3cr3t"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn user_action_finished_canceled_maps_to_session_canceled() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut ui_data = Dictionary::new();
        ui_data.set_string("query_error", "canceled");

        user_action_finished(4, ui_data, &tx);

        match recv(&mut rx) {
            Event::Error { tag, kind, .. } => {
                assert_eq!(tag, 4);
                assert_eq!(kind, "SessionCanceled");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
