use std::collections::HashMap;

use sqlparser::ast::{
    self, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, UnaryOperator, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed statement.
#[derive(Debug, PartialEq)]
pub enum Command {
    RegisterVehicle {
        vehicle: Vehicle,
    },
    UpdateVehicle {
        id: Ulid,
        patch: VehiclePatch,
    },
    AddWindow {
        id: Ulid,
        vehicle_id: Ulid,
        available_from: Ms,
        available_to: Ms,
        recurrence: Option<Recurrence>,
    },
    UpdateWindow {
        id: Ulid,
        patch: WindowPatch,
    },
    RemoveWindow {
        id: Ulid,
    },
    SelectWindows {
        vehicle_id: Ulid,
        status: Option<WindowStatus>,
        from: Option<Ms>,
        to: Option<Ms>,
    },
    SelectCanBook {
        vehicle_id: Ulid,
        start: Ms,
        end: Ms,
    },
    CreateReservation {
        request: NewReservation,
    },
    ConfirmReservation {
        id: Ulid,
    },
    CancelReservation {
        id: Ulid,
    },
    DisputeReservation {
        id: Ulid,
    },
    IssueCode {
        reservation_id: Ulid,
        phase: Phase,
    },
    Pickup {
        reservation_id: Ulid,
        code: String,
        report: HandoverReport,
    },
    Return {
        reservation_id: Ulid,
        code: String,
        report: ReturnReport,
    },
    SelectReservations {
        filter: ReservationFilter,
    },
    SelectActiveReservation,
    SelectReservationHistory,
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

/// The kind of rows a statement answers with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowShape {
    /// Command tag only.
    Tag,
    Windows,
    CanBook,
    Reservations,
    Code,
}

/// Classify a statement by verb and table alone, so `$n` statements can be
/// described before their parameters are bound.
pub fn row_shape(sql: &str) -> RowShape {
    let dialect = PostgreSqlDialect {};
    let Ok(stmts) = Parser::parse_sql(&dialect, sql) else {
        return RowShape::Tag;
    };
    match stmts.first() {
        Some(Statement::Insert(insert)) => match insert_table_name(insert).as_deref() {
            Ok("availability" | "availability_updates") => RowShape::Windows,
            Ok("reservations" | "confirmations" | "disputes" | "pickups" | "returns") => {
                RowShape::Reservations
            }
            Ok("handover_codes") => RowShape::Code,
            _ => RowShape::Tag,
        },
        Some(Statement::Delete(delete)) => match delete_table_name(delete).as_deref() {
            Ok("reservations") => RowShape::Reservations,
            _ => RowShape::Tag,
        },
        Some(Statement::Query(query)) => {
            let table = match query.body.as_ref() {
                SetExpr::Select(select) => select
                    .from
                    .first()
                    .and_then(|from| table_factor_name(&from.relation).ok()),
                _ => None,
            };
            match table.as_deref() {
                Some("availability") => RowShape::Windows,
                Some("can_book") => RowShape::CanBook,
                Some("reservations" | "active_reservation" | "reservation_history") => {
                    RowShape::Reservations
                }
                _ => RowShape::Tag,
            }
        }
        _ => RowShape::Tag,
    }
}

// ── INSERT ────────────────────────────────────────────────────

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let row = Row::from_insert(insert)?;

    match table.as_str() {
        "vehicles" => Ok(Command::RegisterVehicle {
            vehicle: Vehicle {
                id: row.ulid("id")?,
                owner_id: row.ulid("owner_id")?,
                rates: Rates {
                    price_per_km: row.opt_i64("price_per_km")?.unwrap_or(0),
                    price_per_hour: row.opt_i64("price_per_hour")?.unwrap_or(0),
                    price_per_day: row.opt_i64("price_per_day")?.unwrap_or(0),
                    base_price: row.opt_i64("base_price")?.unwrap_or(0),
                },
                is_available: row.opt_bool("is_available")?.unwrap_or(true),
                is_active: row.opt_bool("is_active")?.unwrap_or(true),
            },
        }),
        "vehicle_updates" => Ok(Command::UpdateVehicle {
            id: row.ulid("id")?,
            patch: VehiclePatch {
                owner_id: row.opt_ulid("owner_id")?,
                price_per_km: row.opt_i64("price_per_km")?,
                price_per_hour: row.opt_i64("price_per_hour")?,
                price_per_day: row.opt_i64("price_per_day")?,
                base_price: row.opt_i64("base_price")?,
                is_available: row.opt_bool("is_available")?,
                is_active: row.opt_bool("is_active")?,
            },
        }),
        "availability" => {
            let recurrence = match row.opt_text("days_of_week")? {
                None => None,
                Some(days) => Some(Recurrence {
                    days_of_week: parse_weekdays(&days).map_err(SqlError::invalid)?,
                    daily_start: row.opt_clock("daily_start")?.unwrap_or(0),
                    daily_end: row.opt_clock("daily_end")?.unwrap_or(23 * 60 + 59),
                }),
            };
            Ok(Command::AddWindow {
                id: row.ulid("id")?,
                vehicle_id: row.ulid("vehicle_id")?,
                available_from: row.i64("available_from")?,
                available_to: row.i64("available_to")?,
                recurrence,
            })
        }
        "availability_updates" => Ok(Command::UpdateWindow {
            id: row.ulid("id")?,
            patch: WindowPatch {
                available_from: row.opt_i64("available_from")?,
                available_to: row.opt_i64("available_to")?,
                status: row.opt_parsed("status")?,
            },
        }),
        "reservations" => Ok(Command::CreateReservation {
            request: NewReservation {
                id: row.ulid("id")?,
                vehicle_id: row.ulid("vehicle_id")?,
                start: row.i64("start")?,
                end: row.i64("end")?,
                pickup_location: row.text("pickup_location")?,
                return_location: row.opt_text("return_location")?,
                pricing_model: row.opt_text("pricing_model")?,
                estimated_distance_km: row.opt_f64("estimated_distance_km")?,
                notes: row.opt_text("notes")?,
            },
        }),
        "confirmations" => Ok(Command::ConfirmReservation {
            id: row.ulid("reservation_id")?,
        }),
        "disputes" => Ok(Command::DisputeReservation {
            id: row.ulid("reservation_id")?,
        }),
        "handover_codes" => Ok(Command::IssueCode {
            reservation_id: row.ulid("reservation_id")?,
            phase: row.parsed("phase")?,
        }),
        "pickups" => Ok(Command::Pickup {
            reservation_id: row.ulid("reservation_id")?,
            code: row.text("code")?,
            report: row.handover_report()?,
        }),
        "returns" => Ok(Command::Return {
            reservation_id: row.ulid("reservation_id")?,
            code: row.text("code")?,
            report: ReturnReport {
                handover: row.handover_report()?,
                actual_distance_km: row.opt_f64("actual_distance_km")?,
                fuel_consumed_liters: row.opt_f64("fuel_consumed_liters")?,
                fuel_price_per_liter: row.opt_i64("fuel_price_per_liter")?,
            },
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// One VALUES row addressed by column name.
struct Row<'a> {
    values: HashMap<String, &'a Expr>,
}

impl<'a> Row<'a> {
    fn from_insert(insert: &'a ast::Insert) -> Result<Self, SqlError> {
        let source = insert
            .source
            .as_ref()
            .ok_or_else(|| SqlError::Parse("no VALUES".into()))?;
        let rows = match source.body.as_ref() {
            SetExpr::Values(values) => &values.rows,
            _ => return Err(SqlError::Parse("expected VALUES".into())),
        };
        let [row] = rows.as_slice() else {
            return Err(SqlError::Unsupported("multi-row INSERT".into()));
        };
        if insert.columns.is_empty() {
            return Err(SqlError::Parse("INSERT requires an explicit column list".into()));
        }
        if insert.columns.len() != row.len() {
            return Err(SqlError::WrongArity(insert.columns.len(), row.len()));
        }
        let values = insert
            .columns
            .iter()
            .map(|c| c.value.to_lowercase())
            .zip(row.iter())
            .collect();
        Ok(Self { values })
    }

    /// Column value, with SQL NULL read as absent.
    fn get(&self, col: &'static str) -> Option<&'a Expr> {
        self.values
            .get(col)
            .copied()
            .filter(|e| !matches!(extract_value(e), Some(Value::Null)))
    }

    fn require(&self, col: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(col).ok_or(SqlError::MissingColumn(col))
    }

    fn ulid(&self, col: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid_expr(self.require(col)?)
    }

    fn opt_ulid(&self, col: &'static str) -> Result<Option<Ulid>, SqlError> {
        self.get(col).map(parse_ulid_expr).transpose()
    }

    fn i64(&self, col: &'static str) -> Result<i64, SqlError> {
        parse_i64_expr(self.require(col)?)
    }

    fn opt_i64(&self, col: &'static str) -> Result<Option<i64>, SqlError> {
        self.get(col).map(parse_i64_expr).transpose()
    }

    fn opt_f64(&self, col: &'static str) -> Result<Option<f64>, SqlError> {
        self.get(col).map(parse_f64_expr).transpose()
    }

    fn opt_bool(&self, col: &'static str) -> Result<Option<bool>, SqlError> {
        self.get(col).map(parse_bool_expr).transpose()
    }

    fn text(&self, col: &'static str) -> Result<String, SqlError> {
        parse_text_expr(self.require(col)?)
    }

    fn opt_text(&self, col: &'static str) -> Result<Option<String>, SqlError> {
        self.get(col).map(parse_text_expr).transpose()
    }

    fn parsed<T>(&self, col: &'static str) -> Result<T, SqlError>
    where
        T: std::str::FromStr<Err = UnknownVariant>,
    {
        self.text(col)?.parse().map_err(SqlError::invalid)
    }

    fn opt_parsed<T>(&self, col: &'static str) -> Result<Option<T>, SqlError>
    where
        T: std::str::FromStr<Err = UnknownVariant>,
    {
        self.opt_text(col)?
            .map(|s| s.parse().map_err(SqlError::invalid))
            .transpose()
    }

    fn opt_clock(&self, col: &'static str) -> Result<Option<u16>, SqlError> {
        self.opt_text(col)?
            .map(|s| parse_clock(&s).map_err(SqlError::invalid))
            .transpose()
    }

    /// `images` is a JSON array of strings.
    fn opt_images(&self) -> Result<Vec<String>, SqlError> {
        match self.opt_text("images")? {
            None => Ok(Vec::new()),
            Some(raw) => serde_json::from_str(&raw)
                .map_err(|e| SqlError::InvalidValue(format!("images: {e}"))),
        }
    }

    fn handover_report(&self) -> Result<HandoverReport, SqlError> {
        let fuel_level = match self.opt_i64("fuel_level")? {
            None => None,
            Some(v) => Some(
                u8::try_from(v)
                    .map_err(|_| SqlError::InvalidValue(format!("fuel_level out of range: {v}")))?,
            ),
        };
        Ok(HandoverReport {
            odometer_km: self.opt_i64("odometer_km")?,
            fuel_level,
            condition_report: self.opt_text("condition_report")?,
            images: self.opt_images()?,
        })
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "availability" => Ok(Command::RemoveWindow { id }),
        "reservations" => Ok(Command::CancelReservation { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_filters(selection, &mut filters)?;
    }
    let find = |col: &str, op: BinaryOperator| {
        filters
            .iter()
            .find(|(c, o, _)| c == col && *o == op)
            .map(|(_, _, e)| *e)
    };

    match table.as_str() {
        "availability" => Ok(Command::SelectWindows {
            vehicle_id: parse_ulid_expr(
                find("vehicle_id", BinaryOperator::Eq).ok_or(SqlError::MissingFilter("vehicle_id"))?,
            )?,
            status: find("status", BinaryOperator::Eq)
                .map(parse_enum_expr)
                .transpose()?,
            from: find("available_from", BinaryOperator::GtEq)
                .map(parse_i64_expr)
                .transpose()?,
            to: find("available_to", BinaryOperator::LtEq)
                .map(parse_i64_expr)
                .transpose()?,
        }),
        "can_book" => Ok(Command::SelectCanBook {
            vehicle_id: parse_ulid_expr(
                find("vehicle_id", BinaryOperator::Eq).ok_or(SqlError::MissingFilter("vehicle_id"))?,
            )?,
            start: parse_i64_expr(
                find("start", BinaryOperator::GtEq).ok_or(SqlError::MissingFilter("start"))?,
            )?,
            end: parse_i64_expr(
                find("end", BinaryOperator::LtEq).ok_or(SqlError::MissingFilter("end"))?,
            )?,
        }),
        "reservations" => {
            let filter = ReservationFilter {
                id: find("id", BinaryOperator::Eq).map(parse_ulid_expr).transpose()?,
                role: find("role", BinaryOperator::Eq)
                    .map(parse_enum_expr)
                    .transpose()?,
                status: find("status", BinaryOperator::Eq)
                    .map(parse_enum_expr)
                    .transpose()?,
            };
            Ok(Command::SelectReservations { filter })
        }
        "active_reservation" => Ok(Command::SelectActiveReservation),
        "reservation_history" => Ok(Command::SelectReservationHistory),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Flatten an `AND` tree of `column <op> literal` comparisons.
fn collect_filters<'a>(
    expr: &'a Expr,
    out: &mut Vec<(String, BinaryOperator, &'a Expr)>,
) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_filters(inner, out),
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            collect_filters(left, out)?;
            collect_filters(right, out)
        }
        Expr::BinaryOp { left, op, right } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.push((col, op.clone(), right.as_ref()));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

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
    let tables = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    match tables.first() {
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

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    match selection {
        Some(Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        }) if expr_column_name(left).as_deref() == Some("id") => parse_ulid_expr(right),
        _ => Err(SqlError::MissingFilter("id")),
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

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s).map_err(|e| SqlError::InvalidValue(format!("bad ULID {s:?}: {e}")))
        }
        Some(other) => Err(SqlError::InvalidValue(format!("expected ULID string, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

/// Literal number or quoted numeric string, with leading minus.
fn numeric_literal(expr: &Expr) -> Result<String, SqlError> {
    if let Expr::UnaryOp {
        op: UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(format!("-{}", numeric_literal(expr)?));
    }
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => Ok(s.trim().to_string()),
        Some(other) => Err(SqlError::InvalidValue(format!("expected number, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    let s = numeric_literal(expr)?;
    s.parse()
        .map_err(|e| SqlError::InvalidValue(format!("bad integer {s:?}: {e}")))
}

fn parse_f64_expr(expr: &Expr) -> Result<f64, SqlError> {
    let s = numeric_literal(expr)?;
    let v: f64 = s
        .parse()
        .map_err(|e| SqlError::InvalidValue(format!("bad number {s:?}: {e}")))?;
    if !v.is_finite() {
        return Err(SqlError::InvalidValue(format!("non-finite number {s:?}")));
    }
    Ok(v)
}

fn parse_bool_expr(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::InvalidValue(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(other) => Err(SqlError::InvalidValue(format!("expected bool, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_enum_expr<T>(expr: &Expr) -> Result<T, SqlError>
where
    T: std::str::FromStr<Err = UnknownVariant>,
{
    parse_text_expr(expr)?.parse().map_err(SqlError::invalid)
}

fn parse_text_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(Value::Number(n, _)) => Ok(n.clone()),
        Some(other) => Err(SqlError::InvalidValue(format!("expected string, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("expected {0} values, got {1}")]
    WrongArity(usize, usize),
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("invalid value: {0}")]
    InvalidValue(String),
}

impl SqlError {
    fn invalid(e: UnknownVariant) -> Self {
        SqlError::InvalidValue(e.to_string())
    }

    pub fn sqlstate(&self) -> &'static str {
        match self {
            SqlError::InvalidValue(_) => "22023",
            SqlError::UnknownTable(_) => "42P01",
            _ => "42601",
        }
    }
}
