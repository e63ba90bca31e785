use anyhow::{bail, Context, Result};
use clickhouse_rs::Pool;

/// Placeholder replaced with the configured routes table name.
const TABLE_PLACEHOLDER: &str = "{table}";

/// Embedded SQL migration with version, direction, and content.
struct Migration {
    version: u32,
    up_sql: &'static str,
    down_sql: &'static str,
}

/// All embedded migrations, ordered by version.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        up_sql: include_str!("sql/001_routes.up.sql"),
        down_sql: include_str!("sql/001_routes.down.sql"),
    },
    Migration {
        version: 2,
        up_sql: include_str!("sql/002_routes_latest.up.sql"),
        down_sql: include_str!("sql/002_routes_latest.down.sql"),
    },
];

/// Manages ClickHouse schema migrations.
///
/// Compatible with golang-migrate's `schema_migrations` table format.
pub trait Migrator: Send {
    /// Applies all pending forward migrations.
    fn up(&self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Rolls back the last applied migration.
    fn down(&self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Returns the current migration version and dirty flag.
    fn status(&self) -> impl std::future::Future<Output = Result<(u32, bool)>> + Send;
}

/// ClickHouse migration runner for the routes schema.
pub struct ClickHouseMigrator {
    pool: Pool,
    table: String,
}

impl ClickHouseMigrator {
    /// `table` must be a validated identifier; it is substituted into the
    /// embedded SQL.
    pub fn new(pool: Pool, table: &str) -> Self {
        Self {
            pool,
            table: table.to_string(),
        }
    }

    async fn ensure_migrations_table(&self) -> Result<()> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting ClickHouse handle for migrations table")?;

        handle
            .execute(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version Int64,
                    dirty UInt8,
                    sequence UInt64
                ) ENGINE = TinyLog",
            )
            .await
            .context("creating schema_migrations table")?;

        Ok(())
    }

    async fn current_version(&self) -> Result<(u32, bool)> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting ClickHouse handle for version check")?;

        let block = handle
            .query("SELECT version, dirty FROM schema_migrations ORDER BY sequence DESC LIMIT 1")
            .fetch_all()
            .await
            .context("querying migration version")?;

        match block.rows().next() {
            Some(row) => {
                let version: i64 = row.get("version").context("reading version")?;
                let dirty: u8 = row.get("dirty").context("reading dirty flag")?;
                let version = u32::try_from(version)
                    .with_context(|| format!("migration version {version} out of range"))?;
                Ok((version, dirty != 0))
            }
            None => Ok((0, false)),
        }
    }

    async fn set_version(&self, version: u32, dirty: bool) -> Result<()> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting ClickHouse handle for version update")?;

        // golang-migrate keeps a single row.
        handle
            .execute("TRUNCATE TABLE schema_migrations")
            .await
            .context("truncating schema_migrations")?;

        let sql = format!(
            "INSERT INTO schema_migrations (version, dirty, sequence) VALUES ({version}, {}, 1)",
            u8::from(dirty)
        );

        handle
            .execute(sql.as_str())
            .await
            .context("inserting migration version")?;

        Ok(())
    }

    async fn clear_version(&self) -> Result<()> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting ClickHouse handle for version reset")?;

        handle
            .execute("TRUNCATE TABLE schema_migrations")
            .await
            .context("truncating schema_migrations after rollback")?;

        Ok(())
    }

    async fn execute_sql(&self, sql: &str) -> Result<()> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting ClickHouse handle for SQL execution")?;

        let sql = render(sql, &self.table);
        for statement in split_statements(&sql) {
            handle.execute(statement).await.with_context(|| {
                let preview: String = statement.chars().take(80).collect();
                format!("executing migration statement: {preview}...")
            })?;
        }

        Ok(())
    }
}

impl Migrator for ClickHouseMigrator {
    async fn up(&self) -> Result<()> {
        self.ensure_migrations_table().await?;

        let (current_version, dirty) = self.current_version().await?;
        if dirty {
            bail!("migration version {current_version} is dirty, manual intervention required");
        }

        tracing::info!(current_version, table = %self.table, "running migrations");

        let mut applied = 0u32;
        for migration in pending(current_version) {
            tracing::info!(version = migration.version, "applying migration");

            self.set_version(migration.version, true).await?;

            self.execute_sql(migration.up_sql)
                .await
                .with_context(|| format!("applying migration version {}", migration.version))?;

            self.set_version(migration.version, false).await?;

            applied += 1;
        }

        if applied == 0 {
            tracing::info!("no pending migrations");
        } else {
            tracing::info!(version = latest_version(), applied, "migrations completed");
        }

        Ok(())
    }

    async fn down(&self) -> Result<()> {
        self.ensure_migrations_table().await?;

        let (current_version, _) = self.current_version().await?;
        if current_version == 0 {
            tracing::info!("no migrations to roll back");
            return Ok(());
        }

        let migration = MIGRATIONS
            .iter()
            .find(|m| m.version == current_version)
            .with_context(|| format!("migration version {current_version} not found"))?;

        tracing::info!(version = current_version, "rolling back migration");

        self.set_version(current_version, true).await?;

        self.execute_sql(migration.down_sql)
            .await
            .with_context(|| format!("rolling back migration version {current_version}"))?;

        let prev_version = previous_version(current_version);
        if prev_version == 0 {
            self.clear_version().await?;
        } else {
            self.set_version(prev_version, false).await?;
        }

        tracing::info!(version = prev_version, "rollback completed");

        Ok(())
    }

    async fn status(&self) -> Result<(u32, bool)> {
        self.ensure_migrations_table().await?;
        self.current_version().await
    }
}

fn pending(current_version: u32) -> impl Iterator<Item = &'static Migration> {
    MIGRATIONS
        .iter()
        .filter(move |m| m.version > current_version)
}

fn previous_version(current_version: u32) -> u32 {
    MIGRATIONS
        .iter()
        .map(|m| m.version)
        .filter(|v| *v < current_version)
        .max()
        .unwrap_or(0)
}

/// Highest embedded migration version.
pub fn latest_version() -> u32 {
    MIGRATIONS.iter().map(|m| m.version).max().unwrap_or(0)
}

fn render(sql: &str, table: &str) -> String {
    sql.replace(TABLE_PLACEHOLDER, table)
}

/// Splits SQL text into individual statements by semicolons.
fn split_statements(sql: &str) -> Vec<&str> {
    sql.split(';')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_statements_basic() {
        let sql = "CREATE TABLE foo (id Int32); CREATE TABLE bar (id Int32);";
        let stmts = split_statements(sql);
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].starts_with("CREATE TABLE foo"));
        assert!(stmts[1].starts_with("CREATE TABLE bar"));
    }

    #[test]
    fn test_split_statements_empty_and_trailing() {
        assert!(split_statements("").is_empty());
        assert_eq!(split_statements("SELECT 1;;;\n\n").len(), 1);
    }

    #[test]
    fn test_migrations_embedded_and_ordered() {
        for m in MIGRATIONS {
            assert!(m.version > 0);
            assert!(!m.up_sql.trim().is_empty(), "migration {} up SQL is empty", m.version);
            assert!(!m.down_sql.trim().is_empty(), "migration {} down SQL is empty", m.version);
            assert!(m.up_sql.contains(TABLE_PLACEHOLDER));
        }
        for window in MIGRATIONS.windows(2) {
            assert!(window[0].version < window[1].version);
        }
    }

    #[test]
    fn test_render_routes_schema() {
        let sql = render(MIGRATIONS[0].up_sql, "routes");
        let stmts = split_statements(&sql);
        assert_eq!(stmts.len(), 1);
        assert!(stmts[0].starts_with("CREATE TABLE IF NOT EXISTS routes ("));
        for column in ["updated_date_time", "peer_as UInt32", "route String", "count UInt64"] {
            assert!(stmts[0].contains(column), "missing {column}");
        }
        assert!(!sql.contains(TABLE_PLACEHOLDER));
    }

    #[test]
    fn test_pending_and_previous_versions() {
        let all: Vec<u32> = pending(0).map(|m| m.version).collect();
        assert_eq!(all, vec![1, 2]);
        assert_eq!(pending(latest_version()).count(), 0);
        assert_eq!(previous_version(2), 1);
        assert_eq!(previous_version(1), 0);
        assert_eq!(latest_version(), 2);
    }
}
