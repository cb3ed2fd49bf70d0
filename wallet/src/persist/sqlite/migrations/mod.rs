//! Schema versions of the wallet database.
//!
//! The schema version is kept in sqlite's `user_version` header field, 0 for
//! a new database. Migration `n` moves the schema from version `n - 1` to
//! `n`, each in its own transaction together with the version bump.

mod m0001_initial_version;

use anyhow::Context;
use rusqlite::{Connection, Transaction};


/// One step of the schema history.
trait Migration {
	fn description(&self) -> &'static str;

	fn apply(&self, tx: &Transaction) -> anyhow::Result<()>;
}

/// All migrations, oldest first.
const MIGRATIONS: &[&dyn Migration] = &[
	&m0001_initial_version::InitialTables,
];

pub fn schema_version(conn: &Connection) -> anyhow::Result<u32> {
	conn.pragma_query_value(None, "user_version", |row| row.get(0))
		.context("failed to read database schema version")
}

/// Bring the database to the latest schema version and return it.
pub fn migrate(conn: &mut Connection) -> anyhow::Result<u32> {
	apply_migrations(conn, MIGRATIONS)
}

fn apply_migrations(conn: &mut Connection, migrations: &[&dyn Migration]) -> anyhow::Result<u32> {
	let latest = migrations.len() as u32;
	let current = schema_version(conn)?;
	if current > latest {
		bail!("database schema version {} is newer than the supported version {}", current, latest);
	}

	for (version, migration) in (1..).zip(migrations.iter()).skip(current as usize) {
		let tx = conn.transaction().context("failed to start migration")?;
		migration.apply(&tx)
			.with_context(|| format!("migration to schema version {} failed", version))?;
		tx.pragma_update(None, "user_version", version)
			.context("failed to store database schema version")?;
		tx.commit().context("failed to commit migration")?;
		debug!("Migrated wallet database to schema version {}: {}", version, migration.description());
	}
	Ok(latest)
}
