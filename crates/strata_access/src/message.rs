//! Human-readable result messages keyed by statement type.

use strata_engine::StmtType;

/// Group digits with `,` the way an English locale prints them.
pub fn thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

/// `"no rows <verb>"`, `"a row <verb>"` or `"N rows <verb>"`.
pub fn rows_phrase(n: u64, verb: &str) -> String {
    match n {
        0 => format!("no rows {}", verb),
        1 => format!("a row {}", verb),
        _ => format!("{} rows {}", thousands(n), verb),
    }
}

/// Fixed message for DDL keyed by the first keyword of the statement text.
/// Leading `--` comment lines are skipped.
fn defined_message(sql: &str) -> Option<&'static str> {
    let head = sql
        .lines()
        .map(str::trim_start)
        .find(|l| !l.is_empty() && !l.starts_with("--"))?
        .split_whitespace()
        .next()?
        .to_ascii_lowercase();
    match head.as_str() {
        "create" => Some("Created successfully."),
        "drop" => Some("Dropped successfully."),
        "truncate" => Some("Truncated successfully."),
        "alter" => Some("Altered successfully."),
        "connect" => Some("Connected successfully."),
        _ => None,
    }
}

/// Message for an executed statement. `rows` is the affected count, or the
/// number of rows fetched so far for a select.
pub fn result_message(stmt_type: StmtType, sql: &str, rows: u64) -> String {
    let verb = if stmt_type.is_ddl() {
        return defined_message(sql).unwrap_or("executed.").to_string();
    } else if stmt_type.is_alter_system() {
        return defined_message(sql).unwrap_or("system altered.").to_string();
    } else if stmt_type.is_select() {
        "fetched."
    } else if stmt_type.is_insert() {
        "inserted."
    } else if stmt_type.is_delete() {
        "deleted."
    } else if stmt_type.is_insert_select() {
        "select and inserted."
    } else if stmt_type.is_update() {
        "updated."
    } else if stmt_type.is_exec_rollup() {
        return "rollup executed.".to_string();
    } else {
        return format!("executed ({}).", stmt_type.0);
    };
    rows_phrase(rows, verb)
}

/// Lower-case label used for metrics and logs.
pub fn stmt_kind(stmt_type: StmtType) -> &'static str {
    if stmt_type.is_ddl() {
        "ddl"
    } else if stmt_type.is_alter_system() {
        "alter_system"
    } else if stmt_type.is_select() {
        "select"
    } else if stmt_type.is_insert() {
        "insert"
    } else if stmt_type.is_delete() {
        "delete"
    } else if stmt_type.is_insert_select() {
        "insert_select"
    } else if stmt_type.is_update() {
        "update"
    } else if stmt_type.is_exec_rollup() {
        "exec_rollup"
    } else {
        "other"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thousands_separator() {
        assert_eq!(thousands(0), "0");
        assert_eq!(thousands(999), "999");
        assert_eq!(thousands(1000), "1,000");
        assert_eq!(thousands(1234567), "1,234,567");
    }

    #[test]
    fn test_dml_messages() {
        assert_eq!(
            result_message(StmtType::INSERT, "insert into t values(1)", 1),
            "a row inserted."
        );
        assert_eq!(
            result_message(StmtType::DELETE, "delete from t", 0),
            "no rows deleted."
        );
        assert_eq!(
            result_message(StmtType::SELECT, "select * from t", 3),
            "3 rows fetched."
        );
        assert_eq!(
            result_message(StmtType::UPDATE, "update t", 12345),
            "12,345 rows updated."
        );
        assert_eq!(
            result_message(StmtType::INSERT_SELECT, "insert into t select", 2),
            "2 rows select and inserted."
        );
    }

    #[test]
    fn test_ddl_messages_follow_first_keyword() {
        assert_eq!(
            result_message(StmtType::DDL_CREATE, "CREATE TABLE t (v int)", 0),
            "Created successfully."
        );
        assert_eq!(
            result_message(StmtType::DDL_DROP, "  drop table t", 0),
            "Dropped successfully."
        );
        assert_eq!(
            result_message(StmtType::DDL_CREATE, "-- logs\n\ncreate table t (v int)", 0),
            "Created successfully."
        );
        assert_eq!(result_message(StmtType(10), "grant all", 0), "executed.");
        assert_eq!(
            result_message(StmtType::ALTER_SYSTEM, "alter system checkpoint", 0),
            "Altered successfully."
        );
        assert_eq!(result_message(StmtType(300), "", 0), "system altered.");
    }

    #[test]
    fn test_other_statement_types() {
        assert_eq!(result_message(StmtType(523), "exec rollup", 0), "rollup executed.");
        assert_eq!(result_message(StmtType(521), "x", 0), "executed (521).");
        assert_eq!(stmt_kind(StmtType(516)), "delete");
    }
}
