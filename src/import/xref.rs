use crate::schema::fold;
use rusqlite::Connection;
use std::collections::HashMap;

/// Maps case-folded entity names to their keys. Lookups are exact after
/// folding; spelling variants are not guessed.
#[derive(Debug, Clone, Default)]
pub struct NameIndex {
    entries: HashMap<String, String>,
}

impl NameIndex {
    pub fn from_pairs<I, N, K>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (N, K)>,
        N: AsRef<str>,
        K: Into<String>,
    {
        let mut entries = HashMap::new();
        for (name, key) in pairs {
            entries.entry(fold(name.as_ref())).or_insert_with(|| key.into());
        }
        Self { entries }
    }

    /// Reads `(name_column, key_column)` pairs from a registry table.
    pub fn load(conn: &Connection, table: &str, name_column: &str, key_column: &str) -> rusqlite::Result<Self> {
        let sql = format!(
            "SELECT {}, {} FROM {} ORDER BY rowid ASC",
            crate::db::statement::quote_ident(name_column),
            crate::db::statement::quote_ident(key_column),
            crate::db::statement::quote_ident(table),
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
        let mut pairs = Vec::new();
        for row in rows {
            pairs.push(row?);
        }
        Ok(Self::from_pairs(pairs))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn resolve_by_name(&self, name: &str) -> Option<&str> {
        self.entries.get(&fold(name)).map(String::as_str)
    }
}
