//! Out-of-process `digest` method plugin performing HTTP Digest
//! authentication (RFC 2617) without exposing the password to the
//! caller, grounded in `gsignond-digest-plugin.c`'s
//! `_gsignond_digest_plugin_compute_md5_digest`.
//!
//! Session parameters (merged `realms`/`username`/`secret` base
//! context plus caller-supplied `realm`, `algo`, `nonce`,
//! `nonce_count`, `qop`, `method`, `digest_uri`, `hentity`): if
//! `username`/`secret` are both present the digest is computed and
//! returned immediately, otherwise a ui round trip collects them.

use md5::{Digest, Md5};
use rand::RngCore;
use sso_dictionary::{Dictionary, SsoError};
use sso_plugin_protocol::{decode_request, encode_event, Event, Request};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

const MECHANISMS: &[&str] = &["digest"];

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

    let pending: Mutex<HashMap<u64, Dictionary>> = Mutex::new(HashMap::new());

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
            Ok(request) => handle(request, &pending, &tx),
            Err(err) => tracing::warn!(%err, "malformed request, ignoring line"),
        }
    }

    drop(tx);
    let _ = writer.await;
}

fn handle(request: Request, pending: &Mutex<HashMap<u64, Dictionary>>, tx: &mpsc::UnboundedSender<Event>) {
    match request {
        Request::RequestInitial { tag, params, .. } | Request::Request { tag, params, .. } => {
            request_initial(tag, params, pending, tx)
        }
        Request::UserActionFinished { tag, data } => user_action_finished(tag, data, pending, tx),
        Request::Cancel { tag } => {
            pending.lock().unwrap().remove(&tag);
            let _ = tx.send(Event::error(tag, &SsoError::SessionCanceled));
        }
        Request::Refresh { dialog_id, data } => {
            let _ = tx.send(Event::Refreshed { dialog_id, data });
        }
    }
}

fn request_initial(
    tag: u64,
    params: Dictionary,
    pending: &Mutex<HashMap<u64, Dictionary>>,
    tx: &mpsc::UnboundedSender<Event>,
) {
    let username = params.get_string("username").map(str::to_string);
    let secret = params.get_string("secret").map(str::to_string);

    if let (Some(username), Some(secret)) = (&username, &secret) {
        respond_with_digest(tag, username, secret, &params, tx);
        return;
    }

    pending.lock().unwrap().insert(tag, params.clone());

    let mut ui_data = Dictionary::new();
    if let Some(realm) = params.get_string("realm") {
        ui_data.set_string("realm", realm);
    }
    if let Some(digest_uri) = params.get_string("digest_uri") {
        ui_data.set_string("digest_uri", digest_uri);
    }
    ui_data.set_bool("query_username", true);
    ui_data.set_bool("query_password", true);
    let dialog_id = format!("digest-{tag}");
    let _ = tx.send(Event::UserActionRequired {
        tag,
        dialog_id,
        data: ui_data,
    });
}

fn user_action_finished(
    tag: u64,
    data: Dictionary,
    pending: &Mutex<HashMap<u64, Dictionary>>,
    tx: &mpsc::UnboundedSender<Event>,
) {
    if let Some(error) = data.get_string("query_error") {
        pending.lock().unwrap().remove(&tag);
        let err = match error {
            "canceled" => SsoError::SessionCanceled,
            other => SsoError::UserInteraction(format!("userActionFinished error: {other}")),
        };
        let _ = tx.send(Event::error(tag, &err));
        return;
    }

    let Some(session) = pending.lock().unwrap().remove(&tag) else {
        let _ = tx.send(Event::error(
            tag,
            &SsoError::Unknown("no outstanding digest request for tag".into()),
        ));
        return;
    };

    match (
        data.get_string("username").map(str::to_string),
        data.get_string("password").map(str::to_string),
    ) {
        (Some(username), Some(password)) => respond_with_digest(tag, &username, &password, &session, tx),
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

/// Validates the session parameters, computes the response digest per
/// spec.md §4.3's algorithm, and emits `response_final` or the
/// matching error.
fn respond_with_digest(
    tag: u64,
    username: &str,
    secret: &str,
    params: &Dictionary,
    tx: &mpsc::UnboundedSender<Event>,
) {
    let Some(allowed_realms) = params.get_string_array("realms") else {
        let _ = tx.send(Event::error(tag, &SsoError::MissingData("realms".into())));
        return;
    };
    let realm = params.get_string("realm");
    let algo = params.get_string("algo");
    let nonce = params.get_string("nonce");
    let method = params.get_string("method");
    let digest_uri = params.get_string("digest_uri");
    let qop = params.get_string("qop");
    let nonce_count = params.get_string("nonce_count");
    let hentity = params.get_string("hentity");

    // The realm-authorization check runs ahead of the rest of the
    // field-presence checks (`gsignond-digest-plugin.c`'s own check
    // order): an unauthorized realm is reported as such even when
    // other required fields are also missing.
    let Some(realm) = realm else {
        let _ = tx.send(Event::error(tag, &SsoError::MissingData("digest session data".into())));
        return;
    };
    if !allowed_realms.iter().any(|r| r == realm) {
        let _ = tx.send(Event::error(tag, &SsoError::NotAuthorized));
        return;
    }

    if algo.is_none() || nonce.is_none() || method.is_none() || digest_uri.is_none() {
        let _ = tx.send(Event::error(tag, &SsoError::MissingData("digest session data".into())));
        return;
    }
    if qop == Some("auth-int") && hentity.is_none() {
        let _ = tx.send(Event::error(tag, &SsoError::MissingData("hentity".into())));
        return;
    }
    if qop.is_some() && nonce_count.is_none() {
        let _ = tx.send(Event::error(tag, &SsoError::MissingData("nonce_count".into())));
        return;
    }

    let cnonce = generate_cnonce();
    let response = compute_md5_digest(
        algo.unwrap(),
        username,
        realm,
        secret,
        nonce.unwrap(),
        nonce_count,
        &cnonce,
        qop,
        method.unwrap(),
        digest_uri.unwrap(),
        hentity,
    );

    let mut out = Dictionary::new();
    out.set_string("username", username);
    out.set_string("cnonce", cnonce);
    out.set_string("response", response);
    let _ = tx.send(Event::ResponseFinal { tag, data: out });
}

fn generate_cnonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn md5_hex(parts: &[&str]) -> String {
    let mut hasher = Md5::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update(b":");
        }
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[allow(clippy::too_many_arguments)]
fn compute_md5_digest(
    algo: &str,
    username: &str,
    realm: &str,
    secret: &str,
    nonce: &str,
    nonce_count: Option<&str>,
    cnonce: &str,
    qop: Option<&str>,
    method: &str,
    digest_uri: &str,
    hentity: Option<&str>,
) -> String {
    let mut ha1 = md5_hex(&[username, realm, secret]);
    if algo == "md5-sess" {
        ha1 = md5_hex(&[&ha1, nonce, cnonce]);
    }

    let ha2 = if qop == Some("auth-int") {
        match hentity {
            Some(hentity) => md5_hex(&[method, digest_uri, hentity]),
            None => md5_hex(&[method, digest_uri]),
        }
    } else {
        md5_hex(&[method, digest_uri])
    };

    match qop {
        Some(qop) => {
            let nonce_count = nonce_count.unwrap_or_default();
            md5_hex(&[&ha1, nonce, nonce_count, cnonce, qop, &ha2])
        }
        None => md5_hex(&[&ha1, nonce, &ha2]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_matches_rfc2617_worked_example() {
        // RFC 2617 §3.5's worked example (qop=auth).
        let ha1 = md5_hex(&["Mufasa", "testrealm@host.com", "Circle Of Life"]);
        assert_eq!(ha1, "939e7578ed9e3c518a452acee763bce9");

        let ha2 = md5_hex(&["GET", "/dir/index.html"]);
        assert_eq!(ha2, "39aff3a2bab6126f332b942af96d3366");

        let response = compute_md5_digest(
            "md5",
            "Mufasa",
            "testrealm@host.com",
            "Circle Of Life",
            "dcd98b7102dd2f0e8b11d0f600bfb0c093",
            Some("00000001"),
            "0a4f113b",
            Some("auth"),
            "GET",
            "/dir/index.html",
            None,
        );
        assert_eq!(response, "6629fae49393a05397450978507c4ef1");
    }

    #[test]
    fn missing_realm_list_is_missing_data() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let params = Dictionary::new();
        respond_with_digest(1, "u", "s", &params, &tx);
        match rx.try_recv().unwrap() {
            Event::Error { kind, .. } => assert_eq!(kind, "MissingData"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn realm_outside_allowed_list_is_not_authorized() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut params = Dictionary::new();
        params.set_string_array("realms", vec!["allowed".into()]);
        params.set_string("realm", "other");
        params.set_string("algo", "md5");
        params.set_string("nonce", "n");
        params.set_string("method", "GET");
        params.set_string("digest_uri", "/x");
        respond_with_digest(1, "u", "s", &params, &tx);
        match rx.try_recv().unwrap() {
            Event::Error { kind, .. } => assert_eq!(kind, "NotAuthorized"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn unauthorized_realm_wins_over_other_missing_fields() {
        // `gsignond-digest-plugin.c` reports NotAuthorized for an
        // unauthorized realm even when other required fields (here,
        // `algo`/`nonce`/`method`/`digest_uri`) are also absent.
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut params = Dictionary::new();
        params.set_string_array("realms", vec!["allowed".into()]);
        params.set_string("realm", "other");
        respond_with_digest(1, "u", "s", &params, &tx);
        match rx.try_recv().unwrap() {
            Event::Error { kind, .. } => assert_eq!(kind, "NotAuthorized"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn valid_session_yields_response_final() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut params = Dictionary::new();
        params.set_string_array("realms", vec!["realm".into()]);
        params.set_string("realm", "realm");
        params.set_string("algo", "md5");
        params.set_string("nonce", "n");
        params.set_string("method", "GET");
        params.set_string("digest_uri", "/x");
        respond_with_digest(1, "u", "s", &params, &tx);
        match rx.try_recv().unwrap() {
            Event::ResponseFinal { data, .. } => {
                assert!(data.get_string("response").is_some());
                assert!(data.get_string("cnonce").is_some());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
