use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use rusqlite::backup::Backup;
use rusqlite::{Connection, OpenFlags, Transaction, TransactionBehavior, params};
use serde::Serialize;

use crate::history_extract::MetricKind;

pub const SCHEMA_VERSION: i64 = 3;
const BACKUP_PAGES_PER_STEP: i32 = 256;
const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Empty tables from the earlier layout that are taken over by a new kind.
const LEGACY_RENAMES: &[(&str, MetricKind)] = &[
    ("resource_history", MetricKind::Yield),
    ("opinion_history", MetricKind::FamilyOpinion),
];

struct Step {
    version: i64,
    name: &'static str,
    run: fn(&Transaction<'_>) -> Result<()>,
}

const STEPS: &[Step] = &[
    Step {
        version: 1,
        name: "core_tables",
        run: create_core_tables,
    },
    Step {
        version: 2,
        name: "repurpose_legacy_tables",
        run: repurpose_legacy_tables,
    },
    Step {
        version: 3,
        name: "history_tables",
        run: create_history_tables,
    },
];

pub fn open_db(path: &Path) -> Result<Connection> {
    open_db_with_timeout(path, DEFAULT_BUSY_TIMEOUT)
}

pub fn open_db_with_timeout(path: &Path, busy_timeout: Duration) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).ok();
    }
    let conn =
        Connection::open(path).with_context(|| format!("open sqlite db {}", path.display()))?;
    conn.busy_timeout(busy_timeout)
        .context("set sqlite busy timeout")?;
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA foreign_keys = ON;
        "#,
    )
    .context("configure sqlite connection")?;
    Ok(conn)
}

pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory().context("open in-memory sqlite db")?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")
        .context("enable foreign keys")?;
    Ok(conn)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MigrationOutcome {
    UpToDate { version: i64 },
    Applied { from: i64, to: i64, steps: Vec<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenameOutcome {
    Renamed,
    NotPresent,
    TargetExists,
    SkippedNonEmpty,
}

/// Applies and rolls back schema changes for one database.
///
/// Every `apply` that has work to do first copies the database to
/// `snapshot_path`; a failed apply and an explicit `rollback` both restore
/// that copy instead of running reverse DDL.
#[derive(Debug, Clone)]
pub struct Migrator {
    snapshot_path: PathBuf,
}

impl Migrator {
    pub fn new(snapshot_path: impl Into<PathBuf>) -> Self {
        Self {
            snapshot_path: snapshot_path.into(),
        }
    }

    pub fn for_database(db_path: &Path) -> Self {
        Self::new(default_snapshot_path(db_path))
    }

    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }

    pub fn apply(&self, conn: &mut Connection) -> Result<MigrationOutcome> {
        self.apply_steps(conn, STEPS)
    }

    fn apply_steps(&self, conn: &mut Connection, steps: &[Step]) -> Result<MigrationOutcome> {
        // Version read, snapshot and DDL all happen under one write lock.
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Exclusive)
            .context("begin exclusive migration transaction")?;
        let current = current_version(&tx)?;
        let pending = steps
            .iter()
            .filter(|s| s.version > current)
            .collect::<Vec<_>>();
        let Some(target) = pending.iter().map(|s| s.version).max() else {
            log::info!("schema up to date at v{current}");
            return Ok(MigrationOutcome::UpToDate { version: current });
        };

        self.snapshot(&tx)?;
        log::info!(
            "migrating schema v{current} -> v{target} (snapshot {})",
            self.snapshot_path.display()
        );

        let applied = run_steps(&tx, &pending).and_then(|()| tx.commit().context("commit migration"));
        match applied {
            Ok(()) => Ok(MigrationOutcome::Applied {
                from: current,
                to: target,
                steps: pending.iter().map(|s| s.name.to_string()).collect(),
            }),
            Err(err) => {
                log::error!("migration failed, restoring snapshot: {err:#}");
                if let Err(restore_err) = self.restore(conn) {
                    return Err(err.context(format!(
                        "snapshot restore also failed: {restore_err:#}"
                    )));
                }
                Err(err.context("migration aborted; pre-migration snapshot restored"))
            }
        }
    }

    pub fn rollback(&self, conn: &mut Connection) -> Result<()> {
        if !self.snapshot_path.exists() {
            return Err(anyhow!(
                "no pre-migration snapshot at {}",
                self.snapshot_path.display()
            ));
        }
        self.restore(conn)?;
        log::info!("restored snapshot {}", self.snapshot_path.display());
        Ok(())
    }

    fn snapshot(&self, conn: &Connection) -> Result<()> {
        if let Some(parent) = self.snapshot_path.parent() {
            fs::create_dir_all(parent).ok();
        }
        let mut dst = Connection::open(&self.snapshot_path).with_context(|| {
            format!("open snapshot file {}", self.snapshot_path.display())
        })?;
        let backup = Backup::new(conn, &mut dst).context("start snapshot backup")?;
        backup
            .run_to_completion(BACKUP_PAGES_PER_STEP, Duration::ZERO, None)
            .context("copy database to snapshot")?;
        Ok(())
    }

    fn restore(&self, conn: &mut Connection) -> Result<()> {
        let src = Connection::open_with_flags(&self.snapshot_path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .with_context(|| format!("open snapshot {}", self.snapshot_path.display()))?;
        let backup = Backup::new(&src, conn).context("start snapshot restore")?;
        backup
            .run_to_completion(BACKUP_PAGES_PER_STEP, Duration::ZERO, None)
            .context("copy snapshot into database")?;
        Ok(())
    }
}

pub fn default_snapshot_path(db_path: &Path) -> PathBuf {
    db_path.with_extension("pre-migration.sqlite")
}

fn run_steps(tx: &Transaction<'_>, pending: &[&Step]) -> Result<()> {
    tx.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL
        );
        "#,
    )
    .context("create schema_migrations")?;
    for step in pending {
        log::info!("applying migration v{}: {}", step.version, step.name);
        (step.run)(tx).with_context(|| format!("migration v{} {}", step.version, step.name))?;
        tx.execute(
            "INSERT INTO schema_migrations(version, name, applied_at) VALUES (?1, ?2, ?3)",
            params![step.version, step.name, Utc::now().to_rfc3339()],
        )
        .context("record migration")?;
    }
    Ok(())
}

pub fn current_version(conn: &Connection) -> Result<i64> {
    if !table_exists(conn, "schema_migrations")? {
        return Ok(0);
    }
    let version = conn
        .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
            row.get::<_, Option<i64>>(0)
        })
        .context("query schema version")?;
    Ok(version.unwrap_or(0))
}

fn create_core_tables(tx: &Transaction<'_>) -> Result<()> {
    tx.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS matches (
            match_id INTEGER PRIMARY KEY AUTOINCREMENT,
            external_id TEXT NOT NULL UNIQUE,
            game_name TEXT NULL,
            total_turns INTEGER NULL CHECK (total_turns IS NULL OR total_turns >= 0),
            winner_player_id INTEGER NULL,
            ingested_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS participants (
            participant_id INTEGER PRIMARY KEY,
            display_name TEXT NOT NULL,
            external_ref TEXT NULL UNIQUE
        );

        CREATE TABLE IF NOT EXISTS players (
            player_row_id INTEGER PRIMARY KEY AUTOINCREMENT,
            match_id INTEGER NOT NULL REFERENCES matches(match_id) ON DELETE CASCADE,
            player_id INTEGER NOT NULL CHECK (player_id > 0),
            player_name TEXT NOT NULL,
            player_name_normalized TEXT NULL,
            nation TEXT NULL,
            participant_id INTEGER NULL REFERENCES participants(participant_id) ON DELETE SET NULL,
            UNIQUE (match_id, player_id)
        );
        CREATE INDEX IF NOT EXISTS idx_players_participant ON players(participant_id);
        CREATE INDEX IF NOT EXISTS idx_players_normalized ON players(player_name_normalized);
        "#,
    )
    .context("create core tables")?;
    Ok(())
}

fn repurpose_legacy_tables(tx: &Transaction<'_>) -> Result<()> {
    for (legacy, kind) in LEGACY_RENAMES {
        let outcome = rename_if_empty(tx, legacy, kind.table())?;
        log::debug!("legacy table {legacy}: {outcome:?}");
    }
    Ok(())
}

pub fn rename_if_empty(conn: &Connection, from: &str, to: &str) -> Result<RenameOutcome> {
    if !table_exists(conn, from)? {
        return Ok(RenameOutcome::NotPresent);
    }
    if table_exists(conn, to)? {
        log::warn!("not renaming {from}: target table {to} already exists");
        return Ok(RenameOutcome::TargetExists);
    }
    let rows = row_count(conn, from)?;
    if rows > 0 {
        log::warn!("not renaming {from} to {to}: table holds {rows} rows");
        return Ok(RenameOutcome::SkippedNonEmpty);
    }
    conn.execute_batch(&format!("ALTER TABLE \"{from}\" RENAME TO \"{to}\";"))
        .with_context(|| format!("rename {from} to {to}"))?;
    log::info!("renamed empty table {from} to {to}");
    Ok(RenameOutcome::Renamed)
}

fn create_history_tables(tx: &Transaction<'_>) -> Result<()> {
    for kind in MetricKind::ALL {
        reshape_if_empty(tx, kind)?;
        tx.execute_batch(&history_table_sql(kind))
            .with_context(|| format!("create {}", kind.table()))?;
    }
    Ok(())
}

/// A taken-over table whose columns differ is rebuilt, but only while empty.
fn reshape_if_empty(conn: &Connection, kind: MetricKind) -> Result<()> {
    let table = kind.table();
    if !table_exists(conn, table)? {
        return Ok(());
    }
    let columns = table_columns(conn, table)?;
    let missing = history_columns(kind)
        .into_iter()
        .any(|c| !columns.iter().any(|have| *have == c));
    if !missing {
        return Ok(());
    }
    let rows = row_count(conn, table)?;
    if rows > 0 {
        log::warn!("{table} has an unexpected layout and {rows} rows; leaving it in place");
        return Ok(());
    }
    conn.execute_batch(&format!("DROP TABLE \"{table}\";"))
        .with_context(|| format!("drop empty {table} for rebuild"))?;
    Ok(())
}

fn history_table_sql(kind: MetricKind) -> String {
    let table = kind.table();
    let value_col = kind.value_column();
    let value_check = kind
        .value_range()
        .map(|r| format!(" CHECK ({value_col} BETWEEN {} AND {})", r.start(), r.end()))
        .unwrap_or_default();
    let (sub_key_def, sub_key_unique) = match kind.sub_key_column() {
        Some(col) => (
            format!("{col} TEXT NOT NULL CHECK (length({col}) > 0),"),
            format!(", {col}"),
        ),
        None => (String::new(), String::new()),
    };
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {table} (
            {table}_id INTEGER PRIMARY KEY AUTOINCREMENT,
            match_id INTEGER NOT NULL REFERENCES matches(match_id) ON DELETE CASCADE,
            player_id INTEGER NOT NULL,
            turn_number INTEGER NOT NULL CHECK (turn_number >= 0),
            {sub_key_def}
            {value_col} INTEGER NOT NULL{value_check},
            FOREIGN KEY (match_id, player_id) REFERENCES players(match_id, player_id) ON DELETE CASCADE,
            UNIQUE (match_id, player_id, turn_number{sub_key_unique})
        );
        CREATE INDEX IF NOT EXISTS idx_{table}_match_player ON {table}(match_id, player_id);
        CREATE INDEX IF NOT EXISTS idx_{table}_turn ON {table}(turn_number);
        "#
    )
}

fn history_columns(kind: MetricKind) -> Vec<String> {
    let table = kind.table();
    let mut cols = vec![
        format!("{table}_id"),
        "match_id".to_string(),
        "player_id".to_string(),
        "turn_number".to_string(),
    ];
    if let Some(sub) = kind.sub_key_column() {
        cols.push(sub.to_string());
    }
    cols.push(kind.value_column().to_string());
    cols
}

fn expected_schema() -> Vec<(String, Vec<String>)> {
    let owned = |cols: &[&str]| cols.iter().map(|c| c.to_string()).collect::<Vec<_>>();
    let mut out = vec![
        (
            "schema_migrations".to_string(),
            owned(&["version", "name", "applied_at"]),
        ),
        (
            "matches".to_string(),
            owned(&[
                "match_id",
                "external_id",
                "game_name",
                "total_turns",
                "winner_player_id",
                "ingested_at",
            ]),
        ),
        (
            "participants".to_string(),
            owned(&["participant_id", "display_name", "external_ref"]),
        ),
        (
            "players".to_string(),
            owned(&[
                "player_row_id",
                "match_id",
                "player_id",
                "player_name",
                "player_name_normalized",
                "nation",
                "participant_id",
            ]),
        ),
    ];
    for kind in MetricKind::ALL {
        out.push((kind.table().to_string(), history_columns(kind)));
    }
    out
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchemaReport {
    pub version: i64,
    pub missing_tables: Vec<String>,
    pub missing_columns: Vec<(String, String)>,
}

impl SchemaReport {
    pub fn is_complete(&self) -> bool {
        self.missing_tables.is_empty() && self.missing_columns.is_empty()
    }
}

pub fn verify(conn: &Connection) -> Result<SchemaReport> {
    let mut report = SchemaReport {
        version: current_version(conn)?,
        ..SchemaReport::default()
    };
    for (table, columns) in expected_schema() {
        if !table_exists(conn, &table)? {
            report.missing_tables.push(table);
            continue;
        }
        let have = table_columns(conn, &table)?;
        for col in columns {
            if !have.contains(&col) {
                report.missing_columns.push((table.clone(), col));
            }
        }
    }
    Ok(report)
}

pub fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    let count = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("look up table {name}"))?;
    Ok(count > 0)
}

fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare("SELECT name FROM pragma_table_info(?1)")
        .context("prepare table_info query")?;
    let rows = stmt
        .query_map(params![table], |row| row.get::<_, String>(0))
        .with_context(|| format!("read columns of {table}"))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("decode column name")?);
    }
    Ok(out)
}

fn row_count(conn: &Connection, table: &str) -> Result<i64> {
    conn.query_row(&format!("SELECT COUNT(*) FROM \"{table}\""), [], |row| {
        row.get::<_, i64>(0)
    })
    .with_context(|| format!("count rows in {table}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_snapshot(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "match_history_schema_{}_{name}.sqlite",
            std::process::id()
        ))
    }

    fn schema_sql(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT COALESCE(sql, '') FROM sqlite_master WHERE name NOT LIKE 'sqlite_%' ORDER BY name")
            .unwrap();
        stmt.query_map([], |row| row.get::<_, String>(0))
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
    }

    fn failing_step(_tx: &Transaction<'_>) -> Result<()> {
        Err(anyhow!("boom"))
    }

    fn create_scratch(tx: &Transaction<'_>) -> Result<()> {
        tx.execute_batch("CREATE TABLE scratch (id INTEGER PRIMARY KEY);")?;
        Ok(())
    }

    #[test]
    fn apply_twice_is_a_noop() {
        let mut conn = open_in_memory().unwrap();
        let migrator = Migrator::new(temp_snapshot("twice"));
        let first = migrator.apply(&mut conn).unwrap();
        assert!(matches!(first, MigrationOutcome::Applied { from: 0, to: SCHEMA_VERSION, .. }));
        let before = schema_sql(&conn);
        let second = migrator.apply(&mut conn).unwrap();
        assert_eq!(second, MigrationOutcome::UpToDate { version: SCHEMA_VERSION });
        assert_eq!(schema_sql(&conn), before);
        assert!(verify(&conn).unwrap().is_complete());
    }

    #[test]
    fn failed_step_restores_snapshot() {
        let mut conn = open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE keepme (v INTEGER); INSERT INTO keepme VALUES (7);")
            .unwrap();
        let migrator = Migrator::new(temp_snapshot("failing"));
        let steps = [
            Step {
                version: 1,
                name: "scratch",
                run: create_scratch,
            },
            Step {
                version: 2,
                name: "boom",
                run: failing_step,
            },
        ];
        let err = migrator.apply_steps(&mut conn, &steps).unwrap_err();
        assert!(format!("{err:#}").contains("boom"));
        assert!(!table_exists(&conn, "scratch").unwrap());
        assert!(!table_exists(&conn, "schema_migrations").unwrap());
        let kept: i64 = conn
            .query_row("SELECT v FROM keepme", [], |row| row.get(0))
            .unwrap();
        assert_eq!(kept, 7);
    }

    #[test]
    fn busy_database_is_not_snapshotted() {
        let db_path = temp_snapshot("busy_db");
        let migrator = Migrator::new(temp_snapshot("busy_snapshot"));
        for path in [db_path.clone(), migrator.snapshot_path().to_path_buf()] {
            let _ = fs::remove_file(&path);
        }
        let mut conn = open_db_with_timeout(&db_path, Duration::ZERO).unwrap();
        let writer = open_db(&db_path).unwrap();
        writer.execute_batch("BEGIN IMMEDIATE;").unwrap();

        assert!(migrator.apply(&mut conn).is_err());
        assert!(!migrator.snapshot_path().exists());

        writer.execute_batch("COMMIT;").unwrap();
        let outcome = migrator.apply(&mut conn).unwrap();
        assert!(matches!(outcome, MigrationOutcome::Applied { .. }));
        assert!(migrator.snapshot_path().exists());
    }

    #[test]
    fn rollback_restores_pre_migration_state() {
        let mut conn = open_in_memory().unwrap();
        let migrator = Migrator::new(temp_snapshot("rollback"));
        migrator.apply(&mut conn).unwrap();
        assert!(table_exists(&conn, "points_history").unwrap());
        migrator.rollback(&mut conn).unwrap();
        assert!(!table_exists(&conn, "points_history").unwrap());
        assert_eq!(current_version(&conn).unwrap(), 0);
    }

    #[test]
    fn rollback_without_snapshot_fails() {
        let mut conn = open_in_memory().unwrap();
        let migrator = Migrator::new(temp_snapshot("never_written_snapshot"));
        let _ = fs::remove_file(migrator.snapshot_path());
        assert!(migrator.rollback(&mut conn).is_err());
    }

    #[test]
    fn empty_legacy_table_is_repurposed() {
        let mut conn = open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE resource_history (id INTEGER, resource TEXT);")
            .unwrap();
        Migrator::new(temp_snapshot("legacy_empty"))
            .apply(&mut conn)
            .unwrap();
        assert!(!table_exists(&conn, "resource_history").unwrap());
        let report = verify(&conn).unwrap();
        assert!(report.is_complete(), "{report:?}");
    }

    #[test]
    fn non_empty_legacy_table_is_left_alone() {
        let mut conn = open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE opinion_history (id INTEGER); INSERT INTO opinion_history VALUES (1);",
        )
        .unwrap();
        Migrator::new(temp_snapshot("legacy_full"))
            .apply(&mut conn)
            .unwrap();
        assert_eq!(row_count(&conn, "opinion_history").unwrap(), 1);
        assert!(verify(&conn).unwrap().is_complete());
    }

    #[test]
    fn verify_lists_missing_tables_and_columns() {
        let conn = open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE matches (match_id INTEGER PRIMARY KEY);")
            .unwrap();
        let report = verify(&conn).unwrap();
        assert!(!report.is_complete());
        assert!(report.missing_tables.contains(&"points_history".to_string()));
        assert!(
            report
                .missing_columns
                .contains(&("matches".to_string(), "external_id".to_string()))
        );
    }
}
