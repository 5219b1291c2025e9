use catalog_core::StoreError;

pub(crate) fn db_err(err: sqlx::Error) -> StoreError {
    StoreError::Database(err.to_string())
}

/// True when the error is Postgres `lock_not_available` (55P03), raised by
/// `FOR UPDATE NOWAIT` when another transaction holds the row lock.
pub(crate) fn is_lock_not_available(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some("55P03"),
        _ => false,
    }
}
