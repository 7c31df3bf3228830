// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Wires every long-lived piece of the process together (spec.md §9:
//! "Global state: a single runtime value owning the database connection,
//! event bus, stream supervisor, and retention GC. No global statics;
//! everything is explicit and constructed once, torn down in reverse
//! order.").

use crate::config::Config;
use crate::event_bus::{Event, EventBus};
use crate::ingest::RetinaOpener;
use crate::retention::RetentionGc;
use crate::supervisor::StreamSupervisor;
use base::clock::SystemClocks;
use base::shutdown::{self, Sender as ShutdownSender};
use base::Error;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracing::info;

/// No spec.md text caps the number of configured streams; this is a
/// sanity ceiling against a malformed config registering thousands of
/// worker thread pairs by accident.
const MAX_STREAMS: usize = 256;

/// Opens (creating if absent) the index database at `db_path`, migrating
/// it to the current schema. Relies on SQLite's own file locking to
/// arbitrate concurrent opens of the same path rather than taking a
/// separate directory-level lock.
fn open_db(db_path: &Path) -> Result<rusqlite::Connection, Error> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| base::err!(Unavailable, "creating {}: {e}", parent.display()))?;
    }
    let mut conn = rusqlite::Connection::open(db_path)
        .map_err(|e| base::err!(Unavailable, "opening {}: {e}", db_path.display()))?;
    db::migrate::upgrade(&mut conn)?;
    Ok(conn)
}

/// The whole process's live state. Constructed once by [`Runtime::start`]
/// and torn down, in reverse construction order, by [`Runtime::shutdown`].
pub struct Runtime {
    pub db: Arc<Mutex<rusqlite::Connection>>,
    pub events: EventBus,
    pub supervisor: Arc<StreamSupervisor<SystemClocks>>,
    shutdown_tx: Option<ShutdownSender>,
    retention_join: Option<JoinHandle<()>>,
}

impl Runtime {
    /// Opens the database, runs startup reconciliation (spec.md §4.5),
    /// persists every stream named in `config`, registers and enables
    /// each one with the supervisor, and starts the retention GC thread.
    pub fn start(config: &Config, rt_handle: tokio::runtime::Handle) -> Result<Runtime, Error> {
        let conn = open_db(&config.db_path)?;
        std::fs::create_dir_all(&config.recordings_root).map_err(|e| {
            base::err!(Unavailable, "creating {}: {e}", config.recordings_root.display())
        })?;

        let reconcile_report = db::reconcile::reconcile(&conn, &config.recordings_root)?;
        let events = EventBus::new();
        events.publish(Event::IndexReconciled {
            orphan_files_handled: reconcile_report.files_orphaned,
            rows_marked_deleted: reconcile_report.rows_orphaned,
        });

        config.ensure_streams_persisted(&conn)?;
        let db = Arc::new(Mutex::new(conn));

        let opener = Arc::new(RetinaOpener { rt_handle });
        let supervisor = Arc::new(StreamSupervisor::new(
            SystemClocks::default(),
            db.clone(),
            events.clone(),
            config.recordings_root.clone(),
            opener,
            MAX_STREAMS,
            crate::motion_buffer::Pool::new(config.motion_pool_budget_bytes),
        ));
        let streams = {
            let conn = db.lock().unwrap();
            db::stream::list(&conn)?
        };
        for stream in streams {
            supervisor
                .add_stream(stream)
                .map_err(|e| base::err!(Internal, "registering stream: {e}"))?;
        }

        let (shutdown_tx, retention_shutdown_rx) = shutdown::channel();
        let gc = RetentionGc::new(
            db.clone(),
            config.recordings_root.clone(),
            events.clone(),
            retention_shutdown_rx,
            config.water_marks(),
        );
        let retention_join = std::thread::Builder::new()
            .name("retention-gc".to_string())
            .spawn(move || {
                if let Err(e) = gc.run() {
                    tracing::error!(error = %e, "retention GC thread exited with error");
                }
            })
            .map_err(|e| base::err!(Internal, "spawning retention GC thread: {e}"))?;

        info!("runtime started");
        Ok(Runtime {
            db,
            events,
            supervisor,
            shutdown_tx: Some(shutdown_tx),
            retention_join: Some(retention_join),
        })
    }

    /// Stops every stream worker, then the retention GC, in that order:
    /// workers still write through an open `db` connection the GC also
    /// reads, so draining them first avoids a GC pass racing a writer
    /// mid-shutdown for no benefit.
    pub fn shutdown(&mut self) {
        self.supervisor.shutdown();
        if let Some(tx) = self.shutdown_tx.take() {
            drop(tx);
        }
        if let Some(join) = self.retention_join.take() {
            let _ = join.join();
        }
        info!("runtime stopped");
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if self.shutdown_tx.is_some() || self.retention_join.is_some() {
            self.shutdown();
        }
    }
}
