use common_database::{MigrationError, MigrationSet, Migrator};

/// Schema scripts from `migrations/`, compiled into the binary and applied in version
/// order at startup.
static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

pub fn bundled() -> Result<MigrationSet, MigrationError> {
    MigrationSet::from_migrator(&MIGRATOR)
}
