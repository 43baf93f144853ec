//! Live route table with file reload
//!
//! The table is swapped wholesale; a file that fails to parse or validate
//! leaves the previous table in place.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::route::RouteTable;
use crate::types::{GatewayError, Result};

/// Default route file poll interval
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Modification time plus length; the length catches rewrites that land
/// within the filesystem's timestamp granularity
type Fingerprint = (Option<SystemTime>, u64);

async fn fingerprint(path: &Path) -> Result<Fingerprint> {
    let meta = tokio::fs::metadata(path).await?;
    Ok((meta.modified().ok(), meta.len()))
}

/// Shared handle to the current route table
pub struct RouteTableHandle {
    table: RwLock<Arc<RouteTable>>,
    path: Option<PathBuf>,
    last_seen: Mutex<Option<Fingerprint>>,
    running: Arc<RwLock<bool>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RouteTableHandle {
    /// Fixed table with no backing file
    pub fn new(table: RouteTable) -> Self {
        Self {
            table: RwLock::new(Arc::new(table)),
            path: None,
            last_seen: Mutex::new(None),
            running: Arc::new(RwLock::new(false)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Load the initial table from a file; fails if the file is invalid
    pub async fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let seen = fingerprint(&path).await.ok();
        let table = RouteTable::load(&path).await?;
        info!(path = %path.display(), routes = table.len(), "Loaded route table");

        Ok(Self {
            table: RwLock::new(Arc::new(table)),
            path: Some(path),
            last_seen: Mutex::new(seen),
            running: Arc::new(RwLock::new(false)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub async fn current(&self) -> Arc<RouteTable> {
        Arc::clone(&*self.table.read().await)
    }

    pub async fn replace(&self, table: RouteTable) {
        *self.table.write().await = Arc::new(table);
    }

    /// Re-read the backing file. Returns the new route count.
    pub async fn reload(&self) -> Result<usize> {
        let path = self
            .path
            .as_deref()
            .ok_or_else(|| GatewayError::Config("no route file configured".into()))?;

        let seen = fingerprint(path).await.ok();
        match RouteTable::load(path).await {
            Ok(table) => {
                let count = table.len();
                self.replace(table).await;
                *self.last_seen.lock().await = seen;
                info!(path = %path.display(), routes = count, "Route table reloaded");
                Ok(count)
            }
            Err(e) => {
                // Remember the bad file so the watcher doesn't retry it every tick
                *self.last_seen.lock().await = seen;
                error!(path = %path.display(), "Route reload failed, keeping previous table: {}", e);
                Err(e)
            }
        }
    }

    /// Reload if the file changed since the last load
    pub async fn reload_if_changed(&self) -> Result<Option<usize>> {
        let Some(path) = self.path.as_deref() else {
            return Ok(None);
        };

        let current = match fingerprint(path).await {
            Ok(fp) => fp,
            Err(e) => {
                warn!(path = %path.display(), "Cannot stat route file: {}", e);
                return Ok(None);
            }
        };

        if *self.last_seen.lock().await == Some(current) {
            return Ok(None);
        }
        debug!(path = %path.display(), "Route file changed");
        self.reload().await.map(Some)
    }

    /// Start polling the backing file
    pub async fn watch(self: Arc<Self>, interval: Duration) {
        if self.path.is_none() {
            debug!("No route file, not watching");
            return;
        }
        {
            let mut running = self.running.write().await;
            if *running {
                warn!("Route watcher already running");
                return;
            }
            *running = true;
        }

        info!(interval = ?interval, "Watching route file");
        let handle = Arc::clone(&self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if !*handle.running.read().await {
                    info!("Route watcher stopped");
                    break;
                }
                // Errors are logged by reload()
                let _ = handle.reload_if_changed().await;
            }
        });
        self.tasks.lock().await.push(task);
    }

    pub async fn stop(&self) {
        *self.running.write().await = false;
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const ONE_ROUTE: &str = r#"{"routes":[
        {"id":"accounts","match":{"pathPrefix":"/accounts"},"target":"accounts"}
    ]}"#;

    const TWO_ROUTES: &str = r#"{"routes":[
        {"id":"accounts","match":{"pathPrefix":"/accounts"},"target":"accounts"},
        {"id":"orders","match":{"pathPrefix":"/orders"},"target":"orders"}
    ]}"#;

    fn write(file: &mut tempfile::NamedTempFile, content: &str) {
        let f = file.as_file_mut();
        f.set_len(0).unwrap();
        std::io::Seek::rewind(f).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f.sync_all().unwrap();
    }

    #[tokio::test]
    async fn test_reload_replaces_table() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write(&mut file, ONE_ROUTE);

        let handle = RouteTableHandle::from_file(file.path()).await.unwrap();
        let before = handle.current().await;
        assert_eq!(before.len(), 1);

        write(&mut file, TWO_ROUTES);
        assert_eq!(handle.reload().await.unwrap(), 2);
        assert!(handle.current().await.find(None, "/orders/1").is_some());

        // A reader holding the old snapshot still sees it intact
        assert_eq!(before.len(), 1);
    }

    #[tokio::test]
    async fn test_bad_file_keeps_previous_table() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write(&mut file, TWO_ROUTES);
        let handle = RouteTableHandle::from_file(file.path()).await.unwrap();

        write(&mut file, r#"{"routes":[{"id":"x","match":{},"target":"s"}]}"#);
        assert!(matches!(handle.reload().await, Err(GatewayError::Config(_))));

        write(&mut file, "{ not json");
        assert!(handle.reload().await.is_err());

        assert_eq!(handle.current().await.len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_initial_file_fails() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write(&mut file, "[]");
        assert!(RouteTableHandle::from_file(file.path()).await.is_err());
        assert!(RouteTableHandle::from_file("/nonexistent/routes.json")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_reload_if_changed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write(&mut file, ONE_ROUTE);
        let handle = RouteTableHandle::from_file(file.path()).await.unwrap();

        assert_eq!(handle.reload_if_changed().await.unwrap(), None);

        write(&mut file, TWO_ROUTES);
        assert_eq!(handle.reload_if_changed().await.unwrap(), Some(2));
        assert_eq!(handle.reload_if_changed().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_watcher_picks_up_changes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write(&mut file, ONE_ROUTE);
        let handle = Arc::new(RouteTableHandle::from_file(file.path()).await.unwrap());
        Arc::clone(&handle).watch(Duration::from_millis(20)).await;

        write(&mut file, TWO_ROUTES);
        let mut reloaded = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if handle.current().await.len() == 2 {
                reloaded = true;
                break;
            }
        }
        handle.stop().await;
        assert!(reloaded);
    }

    #[tokio::test]
    async fn test_stop_aborts_watcher() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write(&mut file, ONE_ROUTE);
        let handle = Arc::new(RouteTableHandle::from_file(file.path()).await.unwrap());

        Arc::clone(&handle).watch(Duration::from_millis(20)).await;
        let first = {
            let mut tasks = handle.tasks.lock().await;
            assert_eq!(tasks.len(), 1);
            tasks[0].abort_handle()
        };

        handle.stop().await;
        Arc::clone(&handle).watch(Duration::from_millis(20)).await;
        assert_eq!(handle.tasks.lock().await.len(), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(first.is_finished());
        handle.stop().await;
        assert!(handle.tasks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_reload_without_file() {
        let handle = RouteTableHandle::new(RouteTable::default());
        assert!(matches!(handle.reload().await, Err(GatewayError::Config(_))));
        assert_eq!(handle.reload_if_changed().await.unwrap(), None);
    }
}
