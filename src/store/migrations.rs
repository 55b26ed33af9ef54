//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "intake_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS tenant_routes (
                id TEXT PRIMARY KEY,
                source_address TEXT NOT NULL,
                user_id TEXT NOT NULL,
                org_id TEXT NOT NULL,
                timezone TEXT NOT NULL DEFAULT '+02:00',
                active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            );
            CREATE INDEX IF NOT EXISTS idx_tenant_routes_address ON tenant_routes(source_address);

            CREATE TABLE IF NOT EXISTS inbound_messages (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                route_id TEXT NOT NULL,
                org_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                source_message_id TEXT NOT NULL,
                thread_id TEXT,
                sender TEXT NOT NULL,
                subject TEXT,
                received_at TEXT NOT NULL,
                attachment_count INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'processing',
                error TEXT,
                processed_at TEXT,
                created_at TEXT NOT NULL,
                UNIQUE (source_message_id, org_id)
            );
            CREATE INDEX IF NOT EXISTS idx_inbound_messages_run ON inbound_messages(run_id);
            CREATE INDEX IF NOT EXISTS idx_inbound_messages_status ON inbound_messages(status);

            CREATE TABLE IF NOT EXISTS candidates (
                id TEXT PRIMARY KEY,
                org_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                source_address TEXT NOT NULL,
                message_record_id TEXT NOT NULL,
                source_filename TEXT NOT NULL,
                canonical_day TEXT NOT NULL,
                name TEXT NOT NULL,
                email TEXT,
                phone TEXT,
                qualification TEXT,
                qualification_type TEXT NOT NULL DEFAULT 'unknown',
                has_degree INTEGER NOT NULL DEFAULT 0,
                institution TEXT,
                institution_canonical TEXT,
                degree_country TEXT,
                years_experience REAL NOT NULL DEFAULT 0,
                teaching_phases TEXT NOT NULL DEFAULT '[]',
                subjects TEXT NOT NULL DEFAULT '[]',
                has_teaching_registration INTEGER NOT NULL DEFAULT 0,
                has_tefl INTEGER NOT NULL DEFAULT 0,
                countries TEXT NOT NULL DEFAULT '[]',
                current_location TEXT,
                holistic_score REAL,
                notes TEXT,
                flags TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_candidates_org_created ON candidates(org_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_candidates_canonical_day ON candidates(canonical_day);

            CREATE TABLE IF NOT EXISTS audit_log (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                message_record_id TEXT,
                org_id TEXT,
                user_id TEXT,
                stage TEXT NOT NULL,
                action TEXT NOT NULL,
                reason TEXT NOT NULL,
                context TEXT NOT NULL DEFAULT '{}',
                candidate_id TEXT,
                candidate_name TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_audit_log_run ON audit_log(run_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_audit_log_stage ON audit_log(stage);

            CREATE TABLE IF NOT EXISTS processing_runs (
                id TEXT PRIMARY KEY,
                target_day TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'running',
                stats TEXT NOT NULL DEFAULT '{}',
                started_at TEXT NOT NULL,
                completed_at TEXT,
                duration_ms INTEGER,
                error TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_processing_runs_started ON processing_runs(started_at);

            CREATE TABLE IF NOT EXISTS institutions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                canonical_name TEXT NOT NULL,
                variant TEXT NOT NULL UNIQUE
            );
            CREATE INDEX IF NOT EXISTS idx_institutions_canonical ON institutions(canonical_name);
        "#,
    },
    Migration {
        version: 2,
        name: "seed_south_african_universities",
        sql: r#"
            INSERT OR IGNORE INTO institutions (canonical_name, variant) VALUES
                ('University of Cape Town', 'university of cape town'),
                ('University of Cape Town', 'uct'),
                ('University of the Witwatersrand', 'university of the witwatersrand'),
                ('University of the Witwatersrand', 'university of witwatersrand'),
                ('University of the Witwatersrand', 'wits university'),
                ('University of the Witwatersrand', 'wits'),
                ('Stellenbosch University', 'stellenbosch university'),
                ('Stellenbosch University', 'university of stellenbosch'),
                ('Stellenbosch University', 'universiteit stellenbosch'),
                ('University of Pretoria', 'university of pretoria'),
                ('University of Pretoria', 'universiteit van pretoria'),
                ('University of Pretoria', 'tuks'),
                ('University of Pretoria', 'up'),
                ('University of Johannesburg', 'university of johannesburg'),
                ('University of Johannesburg', 'rand afrikaans university'),
                ('University of Johannesburg', 'uj'),
                ('University of KwaZulu-Natal', 'university of kwazulu natal'),
                ('University of KwaZulu-Natal', 'university of natal'),
                ('University of KwaZulu-Natal', 'ukzn'),
                ('Rhodes University', 'rhodes university'),
                ('Rhodes University', 'rhodes'),
                ('University of the Free State', 'university of the free state'),
                ('University of the Free State', 'university of free state'),
                ('University of the Free State', 'ufs'),
                ('North-West University', 'north west university'),
                ('North-West University', 'potchefstroom university'),
                ('North-West University', 'nwu'),
                ('Nelson Mandela University', 'nelson mandela university'),
                ('Nelson Mandela University', 'nelson mandela metropolitan university'),
                ('Nelson Mandela University', 'university of port elizabeth'),
                ('Nelson Mandela University', 'nmmu'),
                ('Nelson Mandela University', 'nmu'),
                ('University of the Western Cape', 'university of the western cape'),
                ('University of the Western Cape', 'university of western cape'),
                ('University of the Western Cape', 'uwc'),
                ('University of South Africa', 'university of south africa'),
                ('University of South Africa', 'unisa'),
                ('University of Fort Hare', 'university of fort hare'),
                ('University of Fort Hare', 'fort hare'),
                ('University of Limpopo', 'university of limpopo'),
                ('University of Limpopo', 'university of the north'),
                ('University of Limpopo', 'ul'),
                ('University of Venda', 'university of venda'),
                ('University of Venda', 'univen'),
                ('University of Zululand', 'university of zululand'),
                ('University of Zululand', 'unizulu'),
                ('Walter Sisulu University', 'walter sisulu university'),
                ('Walter Sisulu University', 'wsu'),
                ('Sefako Makgatho Health Sciences University', 'sefako makgatho health sciences university'),
                ('Sefako Makgatho Health Sciences University', 'medunsa'),
                ('Sefako Makgatho Health Sciences University', 'smu'),
                ('University of Mpumalanga', 'university of mpumalanga'),
                ('University of Mpumalanga', 'ump'),
                ('Sol Plaatje University', 'sol plaatje university'),
                ('Sol Plaatje University', 'spu'),
                ('Cape Peninsula University of Technology', 'cape peninsula university of technology'),
                ('Cape Peninsula University of Technology', 'cape technikon'),
                ('Cape Peninsula University of Technology', 'cput'),
                ('Durban University of Technology', 'durban university of technology'),
                ('Durban University of Technology', 'dut'),
                ('Tshwane University of Technology', 'tshwane university of technology'),
                ('Tshwane University of Technology', 'technikon pretoria'),
                ('Tshwane University of Technology', 'tut'),
                ('Central University of Technology', 'central university of technology'),
                ('Central University of Technology', 'cut'),
                ('Vaal University of Technology', 'vaal university of technology'),
                ('Vaal University of Technology', 'vut'),
                ('Mangosuthu University of Technology', 'mangosuthu university of technology'),
                ('Mangosuthu University of Technology', 'mut');
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    tracing::debug!(version = get_current_version(conn).await?, "Database migrations complete");
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::registry::normalize_institution;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    async fn count(conn: &Connection, sql: &str) -> i64 {
        let mut rows = conn.query(sql, ()).await.unwrap();
        let row = rows.next().await.unwrap().unwrap();
        row.get(0).unwrap()
    }

    #[tokio::test]
    async fn migrations_create_all_tables() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        for table in &[
            "_migrations",
            "tenant_routes",
            "inbound_messages",
            "candidates",
            "audit_log",
            "processing_runs",
            "institutions",
        ] {
            let mut rows = conn
                .query(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    libsql::params![*table],
                )
                .await
                .unwrap();
            let row = rows.next().await.unwrap().unwrap();
            let count: i64 = row.get(0).unwrap();
            assert_eq!(count, 1, "Table '{}' should exist", table);
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        let version = get_current_version(&conn).await.unwrap();
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn registry_is_seeded() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        let universities = count(&conn, "SELECT COUNT(DISTINCT canonical_name) FROM institutions").await;
        assert_eq!(universities, 26);
        let wits = count(&conn, "SELECT COUNT(*) FROM institutions WHERE variant = 'wits'").await;
        assert_eq!(wits, 1);
    }

    #[tokio::test]
    async fn seeded_variants_are_normalized() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        let mut rows = conn.query("SELECT variant FROM institutions", ()).await.unwrap();
        while let Some(row) = rows.next().await.unwrap() {
            let variant: String = row.get(0).unwrap();
            assert_eq!(normalize_institution(&variant), variant);
        }
    }

    #[tokio::test]
    async fn message_claim_key_is_unique() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        let insert = "INSERT INTO inbound_messages (id, run_id, route_id, org_id, user_id,
            source_message_id, sender, received_at, created_at)
            VALUES (?1, 'r', 'route', ?2, 'u', 'msg-1', 's', 't', 't')";
        conn.execute(insert, libsql::params!["a", "org-1"]).await.unwrap();
        assert!(conn.execute(insert, libsql::params!["b", "org-1"]).await.is_err());
        // Same source id under another org is a separate claim.
        conn.execute(insert, libsql::params!["c", "org-2"]).await.unwrap();
    }
}
