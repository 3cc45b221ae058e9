//! Embedded HTTP admin surface.
//!
//! Three loopback endpoints for poking the caches from outside the mount:
//!
//! - `POST /fs/reload?path=…` — drop the attribute entry, the cached
//!   listing and the cached payloads for a path and its direct children,
//! - `DELETE /fs/clear` — flush every cache,
//! - `GET /fs/directories?path=…` — dump the cached listing.
//!
//! Served by axum on a dedicated thread with its own current-thread
//! runtime; the filesystem never blocks on this.

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use axum::extract::{Query, State};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use log::{error, info};
use serde::{Deserialize, Serialize};

use crate::fs::{Shared, join_remote};

#[derive(Deserialize)]
struct PathQuery {
    path: String,
}

#[derive(Serialize)]
struct Status {
    status: bool,
    data: String,
}

pub fn spawn(shared: Arc<Shared>, port: u16) -> Option<JoinHandle<()>> {
    thread::Builder::new()
        .name("sftpfs-admin".to_string())
        .spawn(move || serve(shared, port))
        .ok()
}

fn serve(shared: Arc<Shared>, port: u16) {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("admin api runtime: {e}");
            return;
        }
    };
    let app = Router::new()
        .route("/fs/reload", post(reload))
        .route("/fs/clear", delete(clear))
        .route("/fs/directories", get(directories))
        .with_state(shared);
    runtime.block_on(async move {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("admin api bind {addr}: {e}");
                return;
            }
        };
        info!("admin api listening on {addr}");
        if let Err(e) = axum::serve(listener, app).await {
            error!("admin api: {e}");
        }
    });
}

/// Drop the attribute entry and cached payload for one remote path.
fn clean_file(shared: &Shared, remote: &str) {
    shared.attributes.remove(remote);
    shared.disk.pop(&shared.disk.cache_file(remote));
}

async fn reload(State(shared): State<Arc<Shared>>, Query(q): Query<PathQuery>) -> Json<Status> {
    let remote = shared.remote_path(&q.path);
    info!("admin: reload {remote}");
    clean_file(&shared, &remote);
    if let Some(entries) = shared.directories.get(&remote) {
        shared.directories.remove(&remote);
        for name in entries {
            clean_file(&shared, &join_remote(&remote, &name));
        }
    }
    Json(Status {
        status: true,
        data: remote,
    })
}

async fn clear(State(shared): State<Arc<Shared>>) -> Json<Status> {
    info!("admin: clear all caches");
    shared.attributes.clear();
    shared.directories.clear();
    shared.disk.clear();
    Json(Status {
        status: true,
        data: "success".to_string(),
    })
}

async fn directories(
    State(shared): State<Arc<Shared>>,
    Query(q): Query<PathQuery>,
) -> Json<Status> {
    let remote = shared.remote_path(&q.path);
    match shared.directories.get(&remote) {
        Some(entries) => Json(Status {
            status: true,
            data: serde_json::to_string(&entries).unwrap_or_default(),
        }),
        None => Json(Status {
            status: false,
            data: "not cached".to_string(),
        }),
    }
}
