//! `/v1/watch`: WebSocket feed of policy store changes.
//!
//! On connect the client gets the current revision, then one `change` message
//! per install. The server pings every `ping_interval` and closes sessions
//! that stay silent past `idle_timeout`.

use axum::{
    extract::{ws::Message, ws::WebSocket, ws::WebSocketUpgrade, State},
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{Duration, Instant, MissedTickBehavior};

use crate::app_state::AppState;
use crate::store::ChangeNotification;

fn snapshot_json(revision: u64, version: &str) -> String {
    json!({
        "type": "snapshot",
        "revision": revision,
        "version": version,
    })
    .to_string()
}

fn change_json(n: &ChangeNotification) -> String {
    json!({
        "type": "change",
        "revision": n.revision,
        "version": n.version_info,
        "added": n.added,
        "removed": n.removed,
    })
    .to_string()
}

fn error_json(code: &str, msg: &str) -> String {
    json!({
        "type": "error",
        "code": code,
        "msg": msg,
    })
    .to_string()
}

pub async fn watch_upgrade(State(app): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| run_session(app, socket))
}

async fn run_session(app: AppState, socket: WebSocket) {
    // subscribe before reading the snapshot so no install falls in between
    let mut changes = app.store().subscribe_changes();
    let snapshot = app.store().snapshot();

    let (mut ws_tx, mut ws_rx) = socket.split();
    app.metrics().watch_sessions.add(&[], 1);
    tracing::debug!(revision = snapshot.revision(), "watch session opened");

    if ws_tx
        .send(Message::Text(snapshot_json(snapshot.revision(), snapshot.version_info())))
        .await
        .is_err()
    {
        app.metrics().watch_sessions.add(&[], -1);
        return;
    }
    let seen = snapshot.revision();
    drop(snapshot);

    let idle_timeout = app.idle_timeout();
    let mut ping_tick = tokio::time::interval(app.ping_interval());
    ping_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ping_tick.reset();
    let mut last_activity = Instant::now();

    loop {
        tokio::select! {
            change = changes.recv() => {
                let out = match change {
                    Ok(n) if n.revision <= seen => continue,
                    Ok(n) => change_json(&n),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "watch session lagged");
                        error_json("LAGGED", &format!("{skipped} changes skipped; re-read /v1/policies"))
                    }
                    Err(RecvError::Closed) => break,
                };
                if ws_tx.send(Message::Text(out)).await.is_err() {
                    break;
                }
            }

            incoming = ws_rx.next() => {
                let Some(Ok(msg)) = incoming else { break; };
                last_activity = Instant::now();
                match msg {
                    Message::Ping(payload) => {
                        if ws_tx.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    // the feed is one-way; anything else only counts as activity
                    _ => {}
                }
            }

            _ = ping_tick.tick() => {
                if ws_tx.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }

            _ = tokio::time::sleep(Duration::from_millis(250)) => {
                if last_activity.elapsed() >= idle_timeout {
                    let _ = ws_tx.send(Message::Text(error_json("TIMEOUT", "idle timeout"))).await;
                    break;
                }
            }
        }
    }

    app.metrics().watch_sessions.add(&[], -1);
    tracing::debug!("watch session closed");
}
