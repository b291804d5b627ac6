//! Built-in pooled-connection vendor
//!
//! Serves SQL connections (SQLite through rusqlite) to operations. A request
//! vends a [`PooledConnection`]; when the request finishes the connection's
//! open transaction is committed or rolled back according to the outcome and
//! the connection goes back to the idle list.
//!
//! Configured through a bootstrap property block:
//!
//! ```json
//! { "db": { "type": "jdbc", "url": "sqlite:/var/lib/pets.db", "pool_size": 4 } }
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::Span;
use uuid::Uuid;

use func_runner_sdk::{AnyVendor, Context, FuncError, Params, ServiceVendor, ServiceVendorBuilder};

/// Service `type` handled by the built-in pool, kept for compatibility with
/// existing bundle configuration
pub const POOLED_CONNECTION_TYPE: &str = "jdbc";

/// Pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Connection URL: `sqlite::memory:`, `sqlite:<path>`, `file:<path>` or a path
    pub url: String,

    /// Maximum number of idle connections kept for reuse
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

fn default_pool_size() -> usize { 10 }

#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    Memory,
    File(PathBuf),
}

impl Target {
    fn parse(url: &str) -> Result<Self, FuncError> {
        let url = url.trim();
        let url = url.strip_prefix("jdbc:").unwrap_or(url);

        let rest = if let Some(rest) = url.strip_prefix("sqlite:") {
            rest.trim_start_matches("//")
        } else if let Some(rest) = url.strip_prefix("file:") {
            rest.trim_start_matches("//")
        } else {
            url
        };

        match rest {
            "" => Err(FuncError::InvalidConfig(format!("no database in url '{url}'"))),
            ":memory:" | "memory:" => Ok(Target::Memory),
            path => Ok(Target::File(PathBuf::from(path))),
        }
    }
}

/// Where a pool opens its connections
///
/// Every connection of a memory pool joins one shared-cache database, named
/// per pool so two pools never see each other's tables.
#[derive(Debug)]
enum Source {
    Memory { uri: String },
    File(PathBuf),
}

impl Source {
    fn new(target: Target) -> Self {
        match target {
            Target::Memory => Source::Memory {
                uri: format!("file:pool-{}?mode=memory&cache=shared", Uuid::new_v4().simple()),
            },
            Target::File(path) => Source::File(path),
        }
    }

    fn open(&self) -> rusqlite::Result<Connection> {
        match self {
            Source::Memory { uri } => Connection::open_with_flags(
                uri,
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_URI
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            ),
            Source::File(path) => Connection::open(path),
        }
    }
}

/// Builds a [`ConnectionPool`] for every `jdbc` service block
#[derive(Debug, Default, Clone, Copy)]
pub struct PooledConnectionBuilder;

impl ServiceVendorBuilder for PooledConnectionBuilder {
    fn for_type(&self) -> &str {
        POOLED_CONNECTION_TYPE
    }

    fn build_vendor(
        &self,
        name: &str,
        config: &Params,
        logger: &Span,
    ) -> Result<Option<AnyVendor>, FuncError> {
        let config: PoolConfig = serde_json::from_value(Value::Object(config.clone()))
            .map_err(|e| FuncError::InvalidConfig(format!("service '{name}': {e}")))?;
        let pool = ConnectionPool::new(name, &config)?;

        logger.in_scope(|| {
            tracing::info!(service = %name, url = %config.url, pool_size = config.pool_size, "Built connection pool");
        });
        Ok(Some(AnyVendor::new(pool)))
    }
}

/// A connection checked out of a [`ConnectionPool`]
///
/// Cheap to clone; every clone refers to the same connection. Once the pool
/// takes the connection back, further use fails with [`FuncError::Resource`].
#[derive(Clone)]
pub struct PooledConnection {
    service: Arc<str>,
    conn: Arc<Mutex<Option<Connection>>>,
}

impl PooledConnection {
    fn new(service: Arc<str>, conn: Connection) -> Self {
        Self {
            service,
            conn: Arc::new(Mutex::new(Some(conn))),
        }
    }

    /// Run `f` against the underlying connection
    ///
    /// ```ignore
    /// let conn: PooledConnection = ctx.vend_for_name("db")?;
    /// let count: i64 = conn.with(|c| c.query_row("SELECT count(*) FROM pets", [], |r| r.get(0)))?;
    /// ```
    pub fn with<R>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<R>) -> Result<R, FuncError> {
        let guard = self.lock();
        let conn = guard
            .as_ref()
            .ok_or_else(|| FuncError::resource(format!("connection to '{}' was already released", self.service)))?;
        f(conn).map_err(|e| FuncError::resource(e.to_string()))
    }

    /// Whether the connection is still checked out
    pub fn is_open(&self) -> bool {
        self.lock().is_some()
    }

    fn take(&self) -> Option<Connection> {
        self.lock().take()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Connection>> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("service", &self.service)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Pool of SQL connections for one configured service
pub struct ConnectionPool {
    service: Arc<str>,
    source: Source,
    /// Holds a memory database open while no connection is checked out or idle
    anchor: Mutex<Option<Connection>>,
    max_idle: usize,
    idle: Mutex<Vec<Connection>>,
    opened: AtomicUsize,
    closed: AtomicBool,
}

impl ConnectionPool {
    /// Create a pool. Connections are opened lazily on first vend; a memory
    /// pool opens its anchor connection up front.
    pub fn new(service: &str, config: &PoolConfig) -> Result<Self, FuncError> {
        let source = Source::new(Target::parse(&config.url)?);
        let anchor = match &source {
            Source::Memory { .. } => Some(
                source
                    .open()
                    .map_err(|e| FuncError::resource(format!("failed to open '{service}': {e}")))?,
            ),
            Source::File(_) => None,
        };

        Ok(Self {
            service: Arc::from(service),
            source,
            anchor: Mutex::new(anchor),
            max_idle: config.pool_size,
            idle: Mutex::new(Vec::new()),
            opened: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// Number of idle connections
    pub fn idle_count(&self) -> usize {
        self.idle().len()
    }

    /// Number of connections opened over the pool's lifetime
    pub fn opened_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn idle(&self) -> MutexGuard<'_, Vec<Connection>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn checkout(&self) -> Result<Connection, FuncError> {
        if let Some(conn) = self.idle().pop() {
            return Ok(conn);
        }
        let conn = self
            .source
            .open()
            .map_err(|e| FuncError::resource(format!("failed to open '{}': {e}", self.service)))?;
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(conn)
    }
}

impl ServiceVendor for ConnectionPool {
    type Item = PooledConnection;

    fn vend(&self, ctx: &dyn Context) -> Result<PooledConnection, FuncError> {
        if self.is_closed() {
            return Err(FuncError::resource(format!("pool '{}' has ended", self.service)));
        }
        let conn = self.checkout()?;
        ctx.logger().in_scope(|| tracing::trace!(service = %self.service, "Vended connection"));
        Ok(PooledConnection::new(Arc::clone(&self.service), conn))
    }

    fn release(&self, item: PooledConnection, success: bool) -> Result<(), FuncError> {
        let Some(conn) = item.take() else {
            return Ok(());
        };

        if !conn.is_autocommit() {
            let statement = if success { "COMMIT" } else { "ROLLBACK" };
            // A connection whose transaction cannot be closed is not reusable
            conn.execute_batch(statement)
                .map_err(|e| FuncError::resource(format!("{statement} on '{}' failed: {e}", self.service)))?;
        }

        if self.is_closed() {
            return Ok(());
        }
        let mut idle = self.idle();
        if idle.len() < self.max_idle {
            idle.push(conn);
        }
        Ok(())
    }

    fn end_life(&self) -> Result<(), FuncError> {
        self.closed.store(true, Ordering::SeqCst);
        let mut idle = std::mem::take(&mut *self.idle());
        let count = idle.len();
        idle.extend(self.anchor.lock().unwrap_or_else(PoisonError::into_inner).take());
        for conn in idle {
            if let Err((_, e)) = conn.close() {
                tracing::warn!(service = %self.service, error = %e, "Failed to close connection");
            }
        }
        tracing::info!(service = %self.service, closed = count, "Connection pool ended");
        Ok(())
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("service", &self.service)
            .field("source", &self.source)
            .field("idle", &self.idle_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::FuncRunner;
    use serde_json::json;

    fn pool_at(dir: &tempfile::TempDir, pool_size: usize) -> Arc<ConnectionPool> {
        let url = format!("sqlite:{}", dir.path().join("pets.db").display());
        let pool = ConnectionPool::new("db", &PoolConfig { url, pool_size }).unwrap();
        Arc::new(pool)
    }

    fn count_pets(pool: &ConnectionPool, ctx: &dyn Context) -> i64 {
        let conn = pool.vend(ctx).unwrap();
        let count = conn
            .with(|c| c.query_row("SELECT count(*) FROM pets", [], |row| row.get(0)))
            .unwrap();
        pool.release(conn, true).unwrap();
        count
    }

    #[test]
    fn test_parse_urls() {
        assert_eq!(Target::parse("sqlite::memory:").unwrap(), Target::Memory);
        assert_eq!(Target::parse(":memory:").unwrap(), Target::Memory);
        assert_eq!(
            Target::parse("jdbc:sqlite:/tmp/x.db").unwrap(),
            Target::File(PathBuf::from("/tmp/x.db"))
        );
        assert_eq!(
            Target::parse("file:///tmp/x.db").unwrap(),
            Target::File(PathBuf::from("/tmp/x.db"))
        );
        assert_eq!(Target::parse("data/x.db").unwrap(), Target::File(PathBuf::from("data/x.db")));
        assert!(Target::parse("sqlite:").is_err());
    }

    #[test]
    fn test_builder_rejects_missing_url() {
        let config = json!({"type": "jdbc"});
        let config = config.as_object().unwrap();

        let err = PooledConnectionBuilder
            .build_vendor("db", config, &Span::none())
            .unwrap_err();
        assert!(matches!(err, FuncError::InvalidConfig(_)));
    }

    #[test]
    fn test_builder_produces_pooled_connections() {
        let config = json!({"type": "jdbc", "url": "sqlite::memory:"});
        let vendor = PooledConnectionBuilder
            .build_vendor("db", config.as_object().unwrap(), &Span::none())
            .unwrap()
            .unwrap();

        assert!(vendor.produces::<PooledConnection>());
    }

    #[test]
    fn test_release_commits_or_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_at(&dir, 2);
        let runner = FuncRunner::new();
        let ctx = runner.new_context(Params::new());
        let ctx: &dyn Context = &ctx;

        let conn = pool.vend(ctx).unwrap();
        conn.with(|c| c.execute_batch("CREATE TABLE pets (name TEXT)")).unwrap();
        pool.release(conn, true).unwrap();

        let conn = pool.vend(ctx).unwrap();
        conn.with(|c| c.execute_batch("BEGIN; INSERT INTO pets VALUES ('rex');")).unwrap();
        pool.release(conn, false).unwrap();
        assert_eq!(count_pets(&pool, ctx), 0);

        let conn = pool.vend(ctx).unwrap();
        conn.with(|c| c.execute_batch("BEGIN; INSERT INTO pets VALUES ('rex');")).unwrap();
        pool.release(conn.clone(), true).unwrap();
        assert_eq!(count_pets(&pool, ctx), 1);

        // the handle is dead once released
        assert!(!conn.is_open());
        assert!(matches!(conn.with(|_| Ok(())), Err(FuncError::Resource(_))));
    }

    #[test]
    fn test_idle_connections_are_reused_and_capped() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_at(&dir, 1);
        let runner = FuncRunner::new();
        let ctx = runner.new_context(Params::new());
        let ctx: &dyn Context = &ctx;

        let first = pool.vend(ctx).unwrap();
        let second = pool.vend(ctx).unwrap();
        assert_eq!(pool.opened_count(), 2);

        pool.release(first, true).unwrap();
        pool.release(second, true).unwrap();
        assert_eq!(pool.idle_count(), 1);

        let third = pool.vend(ctx).unwrap();
        assert_eq!(pool.opened_count(), 2);
        pool.release(third, true).unwrap();
    }

    #[test]
    fn test_memory_connections_share_one_database() {
        let config = PoolConfig {
            url: "sqlite::memory:".to_string(),
            pool_size: 0,
        };
        let pool = ConnectionPool::new("db", &config).unwrap();
        let other = ConnectionPool::new("db", &config).unwrap();
        let runner = FuncRunner::new();
        let ctx = runner.new_context(Params::new());
        let ctx: &dyn Context = &ctx;

        let first = pool.vend(ctx).unwrap();
        first
            .with(|c| c.execute_batch("CREATE TABLE pets (name TEXT); INSERT INTO pets VALUES ('rex');"))
            .unwrap();
        let second = pool.vend(ctx).unwrap();
        let seen: i64 = second
            .with(|c| c.query_row("SELECT count(*) FROM pets", [], |row| row.get(0)))
            .unwrap();
        assert_eq!(seen, 1);

        // nothing is kept idle, the database lives on through the anchor
        pool.release(first, true).unwrap();
        pool.release(second, true).unwrap();
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(count_pets(&pool, ctx), 1);

        let stranger = other.vend(ctx).unwrap();
        assert!(stranger
            .with(|c| c.query_row("SELECT count(*) FROM pets", [], |row| row.get::<_, i64>(0)))
            .is_err());
    }

    #[test]
    fn test_end_life_closes_pool() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_at(&dir, 4);
        let runner = FuncRunner::new();
        let ctx = runner.new_context(Params::new());
        let ctx: &dyn Context = &ctx;

        let conn = pool.vend(ctx).unwrap();
        let late = pool.vend(ctx).unwrap();
        pool.release(conn, true).unwrap();
        assert_eq!(pool.idle_count(), 1);

        pool.end_life().unwrap();
        assert!(pool.is_closed());
        assert_eq!(pool.idle_count(), 0);
        assert!(pool.vend(ctx).is_err());

        // late releases are accepted but not pooled
        pool.release(late, true).unwrap();
        assert_eq!(pool.idle_count(), 0);
    }
}
