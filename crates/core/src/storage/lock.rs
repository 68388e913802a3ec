use anyhow::Context;
use sqlx::pool::PoolConnection;
use sqlx::Postgres;

// Advisory locks are scoped to the Postgres session. Used to keep two ingestion or
// enrichment runs from overlapping.
const LOCK_NAMESPACE: i64 = 0x5241_5449_4E47; // "RATING"

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    Ingestion,
    Enrichment,
}

impl RunKind {
    fn lock_key(self) -> i64 {
        match self {
            RunKind::Ingestion => LOCK_NAMESPACE ^ 1,
            RunKind::Enrichment => LOCK_NAMESPACE ^ 2,
        }
    }
}

/// A held run lock, pinned to the pooled connection whose session owns it.
///
/// Lock and unlock must run on the same session, so the connection stays checked out until
/// `release`. If the guard is dropped instead, the connection is detached from the pool and
/// closed, which ends the session and frees the lock server-side.
#[derive(Debug)]
pub struct RunLock {
    conn: Option<PoolConnection<Postgres>>,
    kind: RunKind,
}

impl RunLock {
    /// Returns `None` when another session holds the lock.
    pub async fn try_acquire(pool: &sqlx::PgPool, kind: RunKind) -> anyhow::Result<Option<Self>> {
        let key = kind.lock_key();
        let mut conn = pool
            .acquire()
            .await
            .context("acquire run lock connection failed")?;

        let (acquired,): (bool,) = sqlx::query_as("SELECT pg_try_advisory_lock($1)")
            .persistent(false)
            .bind(key)
            .fetch_one(&mut *conn)
            .await
            .with_context(|| format!("failed to acquire advisory lock (key={key})"))?;

        if !acquired {
            return Ok(None);
        }
        Ok(Some(Self {
            conn: Some(conn),
            kind,
        }))
    }

    pub fn kind(&self) -> RunKind {
        self.kind
    }

    pub async fn release(mut self) -> anyhow::Result<()> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };
        let key = self.kind.lock_key();

        let res: Result<(bool,), sqlx::Error> = sqlx::query_as("SELECT pg_advisory_unlock($1)")
            .persistent(false)
            .bind(key)
            .fetch_one(&mut *conn)
            .await;

        match res {
            Ok((true,)) => Ok(()),
            Ok((false,)) => {
                drop(conn.detach());
                anyhow::bail!("advisory lock was not held by its session (key={key})")
            }
            Err(err) => {
                drop(conn.detach());
                Err(err).with_context(|| format!("failed to release advisory lock (key={key})"))
            }
        }
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            tracing::warn!(kind = ?self.kind, "run lock dropped unreleased; closing its session");
            drop(conn.detach());
        }
    }
}
