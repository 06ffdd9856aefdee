use std::collections::HashMap;

use chrono::{NaiveDate, Weekday};
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::model::*;

/// Which calendar entry a working-hours statement targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayKey {
    Weekly(Weekday),
    Date(NaiveDate),
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    SelectSlots {
        service_id: Ulid,
        date: NaiveDate,
        duration: Minute,
    },
    SelectUnavailableDates {
        service_id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
    },
    SelectWorkingHours {
        date: NaiveDate,
    },
    SelectSlotCounts {
        service_id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
    },
    SelectSlotStatus {
        id: Ulid,
    },
    SelectNearestSlot {
        service_id: Ulid,
        date: NaiveDate,
        start: Minute,
        duration: Minute,
    },
    SelectReservation {
        reference: String,
    },
    SelectServices,
    InsertReservation(ReservationRequest),
    InsertConfirmation {
        reservation_id: Ulid,
        reference: String,
    },
    DeleteReservation {
        id: Ulid,
    },
    /// Renew an unfinalized claim's expiry.
    InsertClaimRenewal {
        reservation_id: Ulid,
    },
    InsertService {
        id: Ulid,
        kind: ServiceKind,
        name_en: String,
        name_ar: String,
        durations: Vec<Minute>,
        requires_payment: bool,
    },
    /// Services are never removed, only deactivated.
    DeleteService {
        id: Ulid,
    },
    InsertWorkingHours {
        day: DayKey,
        hours: WorkingHours,
    },
    DeleteWorkingHours {
        day: DayKey,
    },
    InsertUnits {
        service_id: Ulid,
        date: NaiveDate,
        units: Vec<(Ulid, Span)>,
    },
    InsertBlockedDate {
        date: NaiveDate,
    },
    DeleteBlockedDate {
        date: NaiveDate,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(first) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match first {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let rows = extract_insert_rows(insert)?;
    let values = &rows[0];

    match table.as_str() {
        "reservations" => {
            arity("reservations", values, 7)?;
            let start = parse_clock_expr(&values[4])?;
            let end = parse_clock_expr(&values[5])?;
            if start >= end {
                return Err(SqlError::Parse("reservation start must be before end".into()));
            }
            Ok(Command::InsertReservation(ReservationRequest {
                id: parse_ulid(&values[0])?,
                slot_id: parse_ulid(&values[1])?,
                service_id: parse_ulid(&values[2])?,
                date: parse_date_expr(&values[3])?,
                span: Span::new(start, end),
                duration: parse_u16(&values[6])?,
            }))
        }
        "confirmations" => {
            arity("confirmations", values, 2)?;
            Ok(Command::InsertConfirmation {
                reservation_id: parse_ulid(&values[0])?,
                reference: parse_string(&values[1])?,
            })
        }
        "claim_renewals" => {
            arity("claim_renewals", values, 1)?;
            Ok(Command::InsertClaimRenewal {
                reservation_id: parse_ulid(&values[0])?,
            })
        }
        "services" => {
            arity("services", values, 5)?;
            let durations = parse_string(&values[4])?
                .split(',')
                .map(|d| {
                    d.trim()
                        .parse::<Minute>()
                        .map_err(|e| SqlError::Parse(format!("bad duration {d:?}: {e}")))
                })
                .collect::<Result<Vec<_>, _>>()?;
            let kind: ServiceKind = parse_string(&values[1])?.parse().map_err(SqlError::Parse)?;
            let requires_payment = match values.get(5) {
                Some(v) => parse_bool(v)?,
                None => kind == ServiceKind::Wakala,
            };
            Ok(Command::InsertService {
                id: parse_ulid(&values[0])?,
                kind,
                name_en: parse_string(&values[2])?,
                name_ar: parse_string(&values[3])?,
                durations,
                requires_payment,
            })
        }
        "working_hours" => {
            arity("working_hours", values, 3)?;
            let day = parse_day_key(&values[0])?;
            let hours = match (parse_clock_or_null(&values[1])?, parse_clock_or_null(&values[2])?) {
                (Some(open), Some(close)) => {
                    let breaks = match values.get(3) {
                        Some(v) => parse_breaks(v)?,
                        None => Vec::new(),
                    };
                    WorkingHours::new(open, close, breaks)
                }
                (None, None) => WorkingHours::closed(),
                _ => return Err(SqlError::Parse("open and close must both be set or both NULL".into())),
            };
            Ok(Command::InsertWorkingHours { day, hours })
        }
        "units" => {
            let mut key: Option<(Ulid, NaiveDate)> = None;
            let mut units = Vec::with_capacity(rows.len());
            for (i, row) in rows.iter().enumerate() {
                arity("units row", row, 5)?;
                let row_err = |e: SqlError| SqlError::Parse(format!("row {i}: {e}"));
                let service_id = parse_ulid(&row[1]).map_err(row_err)?;
                let date = parse_date_expr(&row[2]).map_err(row_err)?;
                match key {
                    None => key = Some((service_id, date)),
                    Some(k) if k != (service_id, date) => {
                        return Err(SqlError::Parse(
                            "all unit rows must share service_id and date".into(),
                        ));
                    }
                    Some(_) => {}
                }
                let start = parse_clock_expr(&row[3]).map_err(row_err)?;
                let end = parse_clock_expr(&row[4]).map_err(row_err)?;
                if start >= end {
                    return Err(SqlError::Parse(format!("row {i}: unit start must be before end")));
                }
                units.push((parse_ulid(&row[0]).map_err(row_err)?, Span::new(start, end)));
            }
            let (service_id, date) = key.ok_or_else(|| SqlError::Parse("empty VALUES".into()))?;
            Ok(Command::InsertUnits { service_id, date, units })
        }
        "blocked_dates" => {
            arity("blocked_dates", values, 1)?;
            Ok(Command::InsertBlockedDate {
                date: parse_date_expr(&values[0])?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = Filters::collect(delete.selection.as_ref())?;

    match table.as_str() {
        "reservations" => Ok(Command::DeleteReservation {
            id: parse_ulid(filters.equal("id")?)?,
        }),
        "services" => Ok(Command::DeleteService {
            id: parse_ulid(filters.equal("id")?)?,
        }),
        "working_hours" => Ok(Command::DeleteWorkingHours {
            day: parse_day_key(filters.equal("day")?)?,
        }),
        "blocked_dates" => Ok(Command::DeleteBlockedDate {
            date: parse_date_expr(filters.equal("date")?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let f = Filters::collect(select.selection.as_ref())?;

    match table.as_str() {
        "slots" => Ok(Command::SelectSlots {
            service_id: parse_ulid(f.equal("service_id")?)?,
            date: parse_date_expr(f.equal("date")?)?,
            duration: parse_u16(f.equal("duration")?)?,
        }),
        "unavailable_dates" => Ok(Command::SelectUnavailableDates {
            service_id: parse_ulid(f.equal("service_id")?)?,
            start: parse_date_expr(f.at_least("date")?)?,
            end: parse_date_expr(f.at_most("date")?)?,
        }),
        "working_hours" => Ok(Command::SelectWorkingHours {
            date: parse_date_expr(f.equal("date")?)?,
        }),
        "slot_counts" => Ok(Command::SelectSlotCounts {
            service_id: parse_ulid(f.equal("service_id")?)?,
            start: parse_date_expr(f.at_least("date")?)?,
            end: parse_date_expr(f.at_most("date")?)?,
        }),
        "slot_status" => Ok(Command::SelectSlotStatus {
            id: parse_ulid(f.equal("id")?)?,
        }),
        "nearest_slot" => Ok(Command::SelectNearestSlot {
            service_id: parse_ulid(f.equal("service_id")?)?,
            date: parse_date_expr(f.equal("date")?)?,
            start: parse_clock_expr(f.equal("start")?)?,
            duration: parse_u16(f.equal("duration")?)?,
        }),
        "reservations" => Ok(Command::SelectReservation {
            reference: parse_string(f.equal("reference")?)?,
        }),
        "services" => Ok(Command::SelectServices),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Column comparisons from a conjunctive WHERE clause.
#[derive(Default)]
struct Filters<'a> {
    eq: HashMap<String, &'a Expr>,
    ge: HashMap<String, &'a Expr>,
    le: HashMap<String, &'a Expr>,
}

impl<'a> Filters<'a> {
    fn collect(selection: Option<&'a Expr>) -> Result<Self, SqlError> {
        let mut filters = Filters::default();
        if let Some(expr) = selection {
            filters.walk(expr)?;
        }
        Ok(filters)
    }

    fn walk(&mut self, expr: &'a Expr) -> Result<(), SqlError> {
        match expr {
            Expr::Nested(inner) => self.walk(inner),
            Expr::BinaryOp { left, op, right } => {
                let target = match op {
                    ast::BinaryOperator::And => {
                        self.walk(left)?;
                        return self.walk(right);
                    }
                    ast::BinaryOperator::Eq => &mut self.eq,
                    ast::BinaryOperator::GtEq => &mut self.ge,
                    ast::BinaryOperator::LtEq => &mut self.le,
                    other => return Err(SqlError::Unsupported(format!("operator {other}"))),
                };
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Parse(format!("expected column, got {left}")))?;
                target.insert(col, &**right);
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!("filter {other}"))),
        }
    }

    fn equal(&self, col: &'static str) -> Result<&'a Expr, SqlError> {
        self.eq.get(col).copied().ok_or(SqlError::MissingFilter(col))
    }

    fn at_least(&self, col: &'static str) -> Result<&'a Expr, SqlError> {
        self.ge.get(col).copied().ok_or(SqlError::MissingFilter(col))
    }

    fn at_most(&self, col: &'static str) -> Result<&'a Expr, SqlError> {
        self.le.get(col).copied().ok_or(SqlError::MissingFilter(col))
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn arity(table: &'static str, values: &[Expr], expected: usize) -> Result<(), SqlError> {
    if values.len() < expected {
        return Err(SqlError::WrongArity(table, expected, values.len()));
    }
    Ok(())
}

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) if !values.rows.is_empty() => Ok(&values.rows),
        SetExpr::Values(_) => Err(SqlError::Parse("empty VALUES".into())),
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
}

fn parse_u16(expr: &Expr) -> Result<u16, SqlError> {
    let s = parse_string(expr)?;
    s.trim()
        .parse()
        .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}")))
}

fn parse_date_expr(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    parse_date(&s).ok_or_else(|| SqlError::Parse(format!("bad date {s:?}, expected YYYY-MM-DD")))
}

fn parse_clock_expr(expr: &Expr) -> Result<Minute, SqlError> {
    let s = parse_string(expr)?;
    parse_clock(&s).ok_or_else(|| SqlError::Parse(format!("bad time {s:?}, expected HH:MM")))
}

fn parse_clock_or_null(expr: &Expr) -> Result<Option<Minute>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_clock_expr(expr).map(Some)
}

/// `'12:00-13:00,15:00-15:15'`; NULL or empty means no breaks.
fn parse_breaks(expr: &Expr) -> Result<Vec<Span>, SqlError> {
    if is_null(expr) {
        return Ok(Vec::new());
    }
    parse_string(expr)?
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| parse_span(s).ok_or_else(|| SqlError::Parse(format!("bad break {s:?}"))))
        .collect()
}

/// A weekday name (`mon`, `Monday`) or a `YYYY-MM-DD` date.
fn parse_day_key(expr: &Expr) -> Result<DayKey, SqlError> {
    let s = parse_string(expr)?;
    if let Some(date) = parse_date(&s) {
        return Ok(DayKey::Date(date));
    }
    s.trim()
        .parse::<Weekday>()
        .map(DayKey::Weekly)
        .map_err(|_| SqlError::Parse(format!("bad day {s:?}, expected weekday or YYYY-MM-DD")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    const SID: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const RID: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";

    fn date(s: &str) -> NaiveDate {
        parse_date(s).unwrap()
    }

    #[test]
    fn parse_select_slots() {
        let sql = format!(
            "SELECT * FROM slots WHERE service_id = '{SID}' AND date = '2026-10-20' AND duration = 60"
        );
        match parse_sql(&sql).unwrap() {
            Command::SelectSlots { service_id, date: d, duration } => {
                assert_eq!(service_id.to_string(), SID);
                assert_eq!(d, date("2026-10-20"));
                assert_eq!(duration, 60);
            }
            cmd => panic!("expected SelectSlots, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_select_unavailable_dates_range() {
        let sql = format!(
            "SELECT * FROM unavailable_dates WHERE service_id = '{SID}' AND date >= '2026-10-01' AND date <= '2026-10-31'"
        );
        match parse_sql(&sql).unwrap() {
            Command::SelectUnavailableDates { start, end, .. } => {
                assert_eq!(start, date("2026-10-01"));
                assert_eq!(end, date("2026-10-31"));
            }
            cmd => panic!("expected SelectUnavailableDates, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_select_nearest_slot() {
        let sql = format!(
            "SELECT * FROM nearest_slot WHERE service_id = '{SID}' AND date = '2026-10-20' AND start = '10:00' AND duration = 30"
        );
        match parse_sql(&sql).unwrap() {
            Command::SelectNearestSlot { start, duration, .. } => {
                assert_eq!(start, 600);
                assert_eq!(duration, 30);
            }
            cmd => panic!("expected SelectNearestSlot, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_select_without_where_and_missing_filter() {
        assert_eq!(parse_sql("SELECT * FROM services").unwrap(), Command::SelectServices);
        assert!(matches!(
            parse_sql("SELECT * FROM slots WHERE date = '2026-10-20'"),
            Err(SqlError::MissingFilter("service_id"))
        ));
    }

    #[test]
    fn parse_insert_reservation() {
        let sql = format!(
            r#"INSERT INTO reservations (id, slot_id, service_id, date, start, "end", duration) VALUES ('{RID}', '{SID}', '{SID}', '2026-10-20', '10:00', '11:00', 60)"#
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertReservation(req) => {
                assert_eq!(req.id.to_string(), RID);
                assert_eq!(req.span, Span::new(600, 660));
                assert_eq!(req.duration, 60);
            }
            cmd => panic!("expected InsertReservation, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_reservation_rejects_inverted_span() {
        let sql = format!(
            r#"INSERT INTO reservations (id, slot_id, service_id, date, start, "end", duration) VALUES ('{RID}', '{SID}', '{SID}', '2026-10-20', '11:00', '10:00', 60)"#
        );
        assert!(parse_sql(&sql).is_err());
    }

    #[test]
    fn parse_insert_confirmation_and_delete_reservation() {
        let sql = format!(
            "INSERT INTO confirmations (reservation_id, reference) VALUES ('{RID}', 'ADV-20261020-ABCDEFGH')"
        );
        assert!(matches!(
            parse_sql(&sql).unwrap(),
            Command::InsertConfirmation { ref reference, .. } if reference == "ADV-20261020-ABCDEFGH"
        ));
        let sql = format!("DELETE FROM reservations WHERE id = '{RID}'");
        assert!(matches!(parse_sql(&sql).unwrap(), Command::DeleteReservation { .. }));
        let sql = format!("INSERT INTO claim_renewals (reservation_id) VALUES ('{RID}')");
        assert!(matches!(
            parse_sql(&sql).unwrap(),
            Command::InsertClaimRenewal { reservation_id } if reservation_id.to_string() == RID
        ));
    }

    #[test]
    fn parse_insert_service_defaults_payment_by_kind() {
        let sql = format!(
            "INSERT INTO services (id, kind, name_en, name_ar, durations) VALUES ('{SID}', 'wakala', 'Wakala Services', 'خدمات الوكالة', '30, 60')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertService { kind, durations, requires_payment, name_ar, .. } => {
                assert_eq!(kind, ServiceKind::Wakala);
                assert_eq!(durations, vec![30, 60]);
                assert!(requires_payment);
                assert_eq!(name_ar, "خدمات الوكالة");
            }
            cmd => panic!("expected InsertService, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_working_hours_weekly_and_override() {
        let sql = "INSERT INTO working_hours (day, open, close, breaks) VALUES ('mon', '09:00', '17:00', '12:00-13:00')";
        match parse_sql(sql).unwrap() {
            Command::InsertWorkingHours { day, hours } => {
                assert_eq!(day, DayKey::Weekly(Weekday::Mon));
                assert_eq!(hours.breaks, vec![Span::new(720, 780)]);
            }
            cmd => panic!("expected InsertWorkingHours, got {cmd:?}"),
        }
        let sql = "INSERT INTO working_hours (day, open, close) VALUES ('2026-12-25', NULL, NULL)";
        match parse_sql(sql).unwrap() {
            Command::InsertWorkingHours { day, hours } => {
                assert_eq!(day, DayKey::Date(date("2026-12-25")));
                assert!(!hours.active);
            }
            cmd => panic!("expected InsertWorkingHours, got {cmd:?}"),
        }
        let sql = "DELETE FROM working_hours WHERE day = 'friday'";
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::DeleteWorkingHours { day: DayKey::Weekly(Weekday::Fri) }
        );
    }

    #[test]
    fn parse_insert_units_multi_row() {
        let sql = format!(
            r#"INSERT INTO units (id, service_id, date, start, "end") VALUES ('{RID}', '{SID}', '2026-10-20', '09:00', '09:30'), ('{SID}', '{SID}', '2026-10-20', '09:30', '10:00')"#
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertUnits { units, date: d, .. } => {
                assert_eq!(d, date("2026-10-20"));
                assert_eq!(units.len(), 2);
                assert_eq!(units[1].1, Span::new(570, 600));
            }
            cmd => panic!("expected InsertUnits, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_units_rejects_mixed_dates() {
        let sql = format!(
            r#"INSERT INTO units (id, service_id, date, start, "end") VALUES ('{RID}', '{SID}', '2026-10-20', '09:00', '09:30'), ('{SID}', '{SID}', '2026-10-21', '09:30', '10:00')"#
        );
        assert!(parse_sql(&sql).is_err());
    }

    #[test]
    fn parse_blocked_dates() {
        assert_eq!(
            parse_sql("INSERT INTO blocked_dates (date) VALUES ('2026-12-25')").unwrap(),
            Command::InsertBlockedDate { date: date("2026-12-25") }
        );
        assert_eq!(
            parse_sql("DELETE FROM blocked_dates WHERE date = '2026-12-25'").unwrap(),
            Command::DeleteBlockedDate { date: date("2026-12-25") }
        );
    }

    #[test]
    fn parse_unknown_table_errors() {
        let sql = "INSERT INTO foobar (id) VALUES ('01ARZ3NDEKTSV4RRFFQ69G5FAV')";
        assert!(matches!(parse_sql(sql), Err(SqlError::UnknownTable(_))));
    }

    #[test]
    fn parse_bad_date_errors() {
        let sql = format!(
            "SELECT * FROM slots WHERE service_id = '{SID}' AND date = '20/10/2026' AND duration = 60"
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
