//! Mapping from sqlx errors to the core taxonomy.

use crucible_core::Error;

/// Map a sqlx error to a core error: unique violations become
/// `store-conflict`, missing rows become `not-found`, everything else is a
/// generic store failure.
pub fn store_err(e: sqlx::Error) -> Error {
    match &e {
        sqlx::Error::RowNotFound => Error::NotFound("row not found".into()),
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            Error::StoreConflict(db.message().to_string())
        }
        _ => Error::Store(e.to_string()),
    }
}
