//! Automatic Schema Synchronization
//!
//! Declarative column definitions per table, compared against
//! `PRAGMA table_info` on startup. Missing columns are added with
//! `ALTER TABLE ADD COLUMN`; type and constraint drift is only reported,
//! since SQLite cannot alter those in place.
//!
//! Runs after `CREATE TABLE IF NOT EXISTS` and before versioned migrations.

use crate::Result;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, warn};

/// Column definition with SQL constraints
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDefinition {
    pub name: String,
    /// SQL type (e.g., "TEXT", "INTEGER", "TIMESTAMP")
    pub sql_type: String,
    pub not_null: bool,
    pub primary_key: bool,
    pub unique: bool,
    /// DEFAULT expression, inserted verbatim
    pub default_value: Option<String>,
}

impl ColumnDefinition {
    pub fn new(name: impl Into<String>, sql_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql_type: sql_type.into(),
            not_null: false,
            primary_key: false,
            unique: false,
            default_value: None,
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn default(mut self, value: impl Into<String>) -> Self {
        self.default_value = Some(value.into());
        self
    }

    /// SQL fragment for `ALTER TABLE ADD COLUMN`
    ///
    /// SQLite accepts NOT NULL there only together with a DEFAULT, and never
    /// PRIMARY KEY or UNIQUE.
    fn add_column_sql(&self, table: &str) -> String {
        let mut sql = format!("ALTER TABLE {} ADD COLUMN {} {}", table, self.name, self.sql_type);

        match (&self.default_value, self.not_null) {
            (Some(default), true) => sql.push_str(&format!(" NOT NULL DEFAULT {}", default)),
            (Some(default), false) => sql.push_str(&format!(" DEFAULT {}", default)),
            (None, _) => {}
        }

        sql
    }
}

/// One row of `PRAGMA table_info`
#[derive(Debug, Clone)]
pub struct ActualColumn {
    pub cid: i32,
    pub name: String,
    pub type_name: String,
    pub not_null: bool,
    pub default_value: Option<String>,
    pub pk: bool,
}

/// Difference between expected and actual schema
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaDrift {
    MissingColumn {
        table: String,
        column: ColumnDefinition,
    },
    /// Needs a manual migration
    TypeMismatch {
        table: String,
        column: String,
        expected: String,
        actual: String,
    },
    /// Needs a manual migration (table rebuild)
    ConstraintMismatch {
        table: String,
        column: String,
        constraint: &'static str,
    },
}

/// Expected schema for one table
pub trait TableSchema {
    fn table_name() -> &'static str;

    fn expected_columns() -> Vec<ColumnDefinition>;
}

/// Reads the actual database schema
pub struct SchemaIntrospector;

impl SchemaIntrospector {
    /// Columns of `table_name` in declaration order
    pub async fn introspect_table(pool: &SqlitePool, table_name: &str) -> Result<Vec<ActualColumn>> {
        let rows = sqlx::query("SELECT cid, name, type, \"notnull\", dflt_value, pk FROM pragma_table_info(?)")
            .bind(table_name)
            .fetch_all(pool)
            .await?;

        let mut columns: Vec<ActualColumn> = rows
            .iter()
            .map(|row| ActualColumn {
                cid: row.get("cid"),
                name: row.get("name"),
                type_name: row.get("type"),
                not_null: row.get::<i32, _>("notnull") != 0,
                default_value: row.get("dflt_value"),
                pk: row.get::<i32, _>("pk") != 0,
            })
            .collect();

        columns.sort_by_key(|c| c.cid);

        Ok(columns)
    }

    pub async fn table_exists(pool: &SqlitePool, table_name: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?)",
        )
        .bind(table_name)
        .fetch_one(pool)
        .await?;

        Ok(exists)
    }

    pub async fn column_exists(pool: &SqlitePool, table_name: &str, column: &str) -> Result<bool> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM pragma_table_info(?) WHERE name = ?")
                .bind(table_name)
                .bind(column)
                .fetch_one(pool)
                .await?;

        Ok(count > 0)
    }
}

/// Compares expected and actual columns
pub struct SchemaDiff;

impl SchemaDiff {
    pub fn compare(
        table_name: &str,
        expected: &[ColumnDefinition],
        actual: &[ActualColumn],
    ) -> Vec<SchemaDrift> {
        let mut drift = Vec::new();

        for expected_col in expected {
            let Some(actual_col) = actual.iter().find(|c| c.name == expected_col.name) else {
                drift.push(SchemaDrift::MissingColumn {
                    table: table_name.to_string(),
                    column: expected_col.clone(),
                });
                continue;
            };

            if !Self::types_compatible(&expected_col.sql_type, &actual_col.type_name) {
                drift.push(SchemaDrift::TypeMismatch {
                    table: table_name.to_string(),
                    column: expected_col.name.clone(),
                    expected: expected_col.sql_type.clone(),
                    actual: actual_col.type_name.clone(),
                });
            }

            if expected_col.not_null && !actual_col.not_null {
                drift.push(SchemaDrift::ConstraintMismatch {
                    table: table_name.to_string(),
                    column: expected_col.name.clone(),
                    constraint: "NOT NULL",
                });
            }

            if expected_col.primary_key && !actual_col.pk {
                drift.push(SchemaDrift::ConstraintMismatch {
                    table: table_name.to_string(),
                    column: expected_col.name.clone(),
                    constraint: "PRIMARY KEY",
                });
            }
        }

        drift
    }

    /// SQLite type affinity comparison
    fn types_compatible(expected: &str, actual: &str) -> bool {
        fn affinity(sql_type: &str) -> &'static str {
            let t = sql_type.to_uppercase();
            if t.contains("INT") {
                "INTEGER"
            } else if t.contains("CHAR") || t.contains("CLOB") || t.contains("TEXT") {
                "TEXT"
            } else if t.contains("REAL") || t.contains("FLOA") || t.contains("DOUB") {
                "REAL"
            } else if t.is_empty() || t.contains("BLOB") {
                "BLOB"
            } else {
                "NUMERIC"
            }
        }

        expected.eq_ignore_ascii_case(actual) || affinity(expected) == affinity(actual)
    }
}

/// Applies schema drift fixes
pub struct SchemaSync;

impl SchemaSync {
    /// Add missing columns to `T`'s table and report anything that cannot be fixed
    pub async fn sync_table<T: TableSchema>(pool: &SqlitePool) -> Result<()> {
        let table_name = T::table_name();

        if !SchemaIntrospector::table_exists(pool, table_name).await? {
            warn!(
                "Schema sync: table '{}' does not exist, expected CREATE TABLE to run first",
                table_name
            );
            return Ok(());
        }

        let actual = SchemaIntrospector::introspect_table(pool, table_name).await?;
        let drift = SchemaDiff::compare(table_name, &T::expected_columns(), &actual);

        if drift.is_empty() {
            debug!("Schema sync: '{}' up to date", table_name);
            return Ok(());
        }

        for change in drift {
            match change {
                SchemaDrift::MissingColumn { table, column } => {
                    Self::add_column(pool, &table, &column).await?;
                }
                SchemaDrift::TypeMismatch { table, column, expected, actual } => {
                    warn!(
                        "Type mismatch in {}.{}: expected '{}', found '{}'. Manual migration required.",
                        table, column, expected, actual
                    );
                }
                SchemaDrift::ConstraintMismatch { table, column, constraint } => {
                    warn!(
                        "Constraint mismatch in {}.{}: missing '{}'. Manual migration required.",
                        table, column, constraint
                    );
                }
            }
        }

        Ok(())
    }

    async fn add_column(pool: &SqlitePool, table: &str, column: &ColumnDefinition) -> Result<()> {
        if column.primary_key || column.unique {
            warn!(
                "Column {}.{} will be added without PRIMARY KEY/UNIQUE constraint",
                table, column.name
            );
        }
        if column.not_null && column.default_value.is_none() {
            warn!(
                "Column {}.{} has no DEFAULT and will be added as nullable",
                table, column.name
            );
        }

        info!("Adding column: {}.{} ({})", table, column.name, column.sql_type);

        match sqlx::query(&column.add_column_sql(table)).execute(pool).await {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.message().contains("duplicate column") => {
                debug!("Column {}.{} already added concurrently", table, column.name);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_test_db() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    struct WidgetSchema;

    impl TableSchema for WidgetSchema {
        fn table_name() -> &'static str {
            "widgets"
        }

        fn expected_columns() -> Vec<ColumnDefinition> {
            vec![
                ColumnDefinition::new("id", "INTEGER").primary_key(),
                ColumnDefinition::new("name", "TEXT").not_null(),
                ColumnDefinition::new("colour", "TEXT"),
                ColumnDefinition::new("weight", "INTEGER").not_null().default("0"),
            ]
        }
    }

    #[test]
    fn test_add_column_sql() {
        let col = ColumnDefinition::new("weight", "INTEGER").not_null().default("0");
        assert_eq!(
            col.add_column_sql("widgets"),
            "ALTER TABLE widgets ADD COLUMN weight INTEGER NOT NULL DEFAULT 0"
        );

        let col = ColumnDefinition::new("colour", "TEXT").not_null();
        assert_eq!(col.add_column_sql("widgets"), "ALTER TABLE widgets ADD COLUMN colour TEXT");
    }

    #[test]
    fn test_types_compatible() {
        assert!(SchemaDiff::types_compatible("TEXT", "text"));
        assert!(SchemaDiff::types_compatible("INTEGER", "INT"));
        assert!(SchemaDiff::types_compatible("TEXT", "VARCHAR(20)"));
        assert!(SchemaDiff::types_compatible("REAL", "DOUBLE"));
        assert!(SchemaDiff::types_compatible("TIMESTAMP", "DATETIME"));

        assert!(!SchemaDiff::types_compatible("TEXT", "INTEGER"));
        assert!(!SchemaDiff::types_compatible("REAL", "TEXT"));
    }

    #[test]
    fn test_compare_reports_missing_and_mismatched() {
        let actual = vec![
            ActualColumn {
                cid: 0,
                name: "id".to_string(),
                type_name: "INTEGER".to_string(),
                not_null: false,
                default_value: None,
                pk: true,
            },
            ActualColumn {
                cid: 1,
                name: "name".to_string(),
                type_name: "INTEGER".to_string(),
                not_null: false,
                default_value: None,
                pk: false,
            },
        ];

        let drift = SchemaDiff::compare("widgets", &WidgetSchema::expected_columns(), &actual);

        assert!(drift.iter().any(|d| matches!(d, SchemaDrift::TypeMismatch { column, .. } if column == "name")));
        assert!(drift.iter().any(|d| matches!(d, SchemaDrift::ConstraintMismatch { constraint: "NOT NULL", .. })));
        let missing: Vec<_> = drift
            .iter()
            .filter_map(|d| match d {
                SchemaDrift::MissingColumn { column, .. } => Some(column.name.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(missing, vec!["colour", "weight"]);
    }

    #[tokio::test]
    async fn test_sync_adds_missing_columns() {
        let pool = setup_test_db().await;

        sqlx::query("CREATE TABLE widgets (id INTEGER PRIMARY KEY, name TEXT NOT NULL)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO widgets (name) VALUES ('old')")
            .execute(&pool)
            .await
            .unwrap();

        SchemaSync::sync_table::<WidgetSchema>(&pool).await.unwrap();

        assert!(SchemaIntrospector::column_exists(&pool, "widgets", "colour").await.unwrap());
        let weight: i64 = sqlx::query_scalar("SELECT weight FROM widgets WHERE name = 'old'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(weight, 0, "Existing rows pick up the column default");

        // Second run is a no-op
        SchemaSync::sync_table::<WidgetSchema>(&pool).await.unwrap();
        let columns = SchemaIntrospector::introspect_table(&pool, "widgets").await.unwrap();
        assert_eq!(columns.len(), 4);
    }

    #[tokio::test]
    async fn test_sync_skips_missing_table() {
        let pool = setup_test_db().await;
        SchemaSync::sync_table::<WidgetSchema>(&pool).await.unwrap();
        assert!(!SchemaIntrospector::table_exists(&pool, "widgets").await.unwrap());
    }
}
