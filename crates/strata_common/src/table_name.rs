use std::fmt;

pub const DEFAULT_DATABASE: &str = "MACHBASEDB";
pub const DEFAULT_USER: &str = "SYS";

/// Fully-qualified table name `<db>.<user>.<table>`.
///
/// Missing parts default to [`DEFAULT_DATABASE`] and [`DEFAULT_USER`]; all
/// parts are uppercased.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableName {
    pub database: String,
    pub user: String,
    pub table: String,
}

impl TableName {
    pub fn parse(name: &str) -> TableName {
        let parts: Vec<&str> = name.trim().split('.').collect();
        let (database, user, table) = match parts.as_slice() {
            [db, user, table] => (*db, *user, *table),
            [user, table] => (DEFAULT_DATABASE, *user, *table),
            [table] => (DEFAULT_DATABASE, DEFAULT_USER, *table),
            _ => {
                // more than three parts: the last two are user/table, the rest is the db
                let n = parts.len();
                return TableName {
                    database: parts[..n - 2].join(".").to_uppercase(),
                    user: parts[n - 2].to_uppercase(),
                    table: parts[n - 1].to_uppercase(),
                };
            }
        };
        TableName {
            database: database.to_uppercase(),
            user: user.to_uppercase(),
            table: table.to_uppercase(),
        }
    }

    pub fn split(&self) -> (&str, &str, &str) {
        (&self.database, &self.user, &self.table)
    }

    /// True for dictionary (`M$`) and virtual (`V$`) tables.
    pub fn is_dictionary(&self) -> bool {
        self.table.starts_with("M$") || self.table.starts_with("V$")
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.database, self.user, self.table)
    }
}

impl From<&str> for TableName {
    fn from(name: &str) -> Self {
        TableName::parse(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_and_uppercase() {
        let tn = TableName::parse("tag_data");
        assert_eq!(tn.split(), ("MACHBASEDB", "SYS", "TAG_DATA"));
        assert_eq!(tn.to_string(), "MACHBASEDB.SYS.TAG_DATA");
    }

    #[test]
    fn test_user_and_database_parts() {
        assert_eq!(
            TableName::parse("demo.tbl").split(),
            ("MACHBASEDB", "DEMO", "TBL")
        );
        assert_eq!(
            TableName::parse("mydb.demo.tbl").split(),
            ("MYDB", "DEMO", "TBL")
        );
    }

    #[test]
    fn test_dictionary_tables() {
        assert!(TableName::parse("m$sys_tables").is_dictionary());
        assert!(TableName::parse("v$tag_stat").is_dictionary());
        assert!(!TableName::parse("tag").is_dictionary());
    }
}
