//! PostgreSQL wire-format inspection: error packets and simple queries.

use crate::span::SqlError;

/// Parse a PostgreSQL ErrorResponse packet:
/// `'E' <4-byte big-endian length> {<field-code><c-string>}* <0>`.
///
/// Returns the error only when both the SQLSTATE (`C`) and message (`M`)
/// fields are present and properly null-terminated. Every other field code
/// (`S`, `D`, `H`, ...) is skipped.
pub fn parse_postgres_error(buf: &[u8]) -> Option<SqlError> {
    if buf.len() < 5 || buf[0] != b'E' {
        return None;
    }

    let mut sql_state: Option<String> = None;
    let mut message: Option<String> = None;

    let mut pos = 5;
    while pos < buf.len() {
        let code = buf[pos];
        if code == 0 {
            break;
        }
        pos += 1;
        // A field without its terminator makes the whole packet invalid.
        let len = buf[pos..].iter().position(|&b| b == 0)?;
        let value = String::from_utf8_lossy(&buf[pos..pos + len]).into_owned();
        match code {
            b'C' => sql_state = Some(value),
            b'M' => message = Some(value),
            _ => {}
        }
        pos += len + 1;
    }

    match (sql_state, message) {
        (Some(sql_state), Some(message)) => Some(SqlError { sql_state, message }),
        _ => None,
    }
}

const SQL_KEYWORDS: [&str; 8] = [
    "SELECT", "INSERT", "UPDATE", "DELETE", "CREATE", "ALTER", "DROP", "BEGIN",
];

/// Detect a SQL statement in a request payload and return its operation
/// keyword. Understands both bare statements and the PostgreSQL simple-query
/// framing (`'Q' <len> <statement>`).
pub fn sql_operation(buf: &[u8]) -> Option<&'static str> {
    let statement = if buf.first() == Some(&b'Q') && buf.len() > 5 {
        &buf[5..]
    } else {
        buf
    };
    let head: Vec<u8> = statement
        .iter()
        .skip_while(|b| b.is_ascii_whitespace())
        .take(8)
        .map(|b| b.to_ascii_uppercase())
        .collect();
    SQL_KEYWORDS
        .iter()
        .find(|kw| head.starts_with(kw.as_bytes()))
        .copied()
}
