use rusqlite::Connection;

/// Applies connection pragmas. Read-only connections skip the ones that
/// would need write access to the database file.
pub fn configure_connection(conn: &Connection, read_only: bool) -> rusqlite::Result<()> {
    if read_only {
        conn.execute_batch(
            "PRAGMA query_only = ON;\n\
             PRAGMA temp_store = MEMORY;\n\
             PRAGMA busy_timeout = 5000;\n",
        )
    } else {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;\n\
             PRAGMA synchronous = NORMAL;\n\
             PRAGMA foreign_keys = ON;\n\
             PRAGMA busy_timeout = 5000;\n",
        )
    }
}
