use chrono::NaiveDate;
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, TableWithJoins, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;
use crate::validator::Transition;

/// The virtual tables clients can address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Laboratories,
    Users,
    Bookings,
    Calendar,
    Availability,
}

impl Table {
    fn lookup(name: &str) -> Result<Self, SqlError> {
        match name {
            "laboratories" => Ok(Table::Laboratories),
            "users" => Ok(Table::Users),
            "bookings" => Ok(Table::Bookings),
            "calendar" => Ok(Table::Calendar),
            "availability" => Ok(Table::Availability),
            _ => Err(SqlError::UnknownTable(name.to_string())),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Table::Laboratories => "laboratories",
            Table::Users => "users",
            Table::Bookings => "bookings",
            Table::Calendar => "calendar",
            Table::Availability => "availability",
        }
    }

    fn read_only(self) -> SqlError {
        SqlError::Unsupported(format!("{} is read-only", self.name()))
    }

    /// Only the three entity tables accept writes.
    fn writable(self) -> Result<Self, SqlError> {
        match self {
            Table::Laboratories | Table::Users | Table::Bookings => Ok(self),
            Table::Calendar | Table::Availability => Err(self.read_only()),
        }
    }
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertLaboratory(NewLaboratory),
    UpdateLaboratory { id: Ulid, patch: LaboratoryPatch },
    DeleteLaboratory { id: Ulid },
    InsertUser(NewUser),
    UpdateUser { id: Ulid, patch: UserPatch },
    OverridePermissions { id: Ulid, permissions: PermissionSet },
    DeleteUser { id: Ulid },
    InsertBooking(NewBooking),
    UpdateBooking { id: Ulid, patch: BookingPatch },
    TransitionBooking {
        id: Ulid,
        transition: Transition,
        reason: Option<String>,
    },
    DeleteBooking { id: Ulid },
    SelectLaboratories { id: Option<Ulid> },
    SelectUsers { id: Option<Ulid> },
    SelectBookings { id: Option<Ulid>, filter: BookingFilter },
    SelectCalendar { laboratory_id: Ulid, date: NaiveDate },
    SelectAvailability {
        laboratory_id: Ulid,
        date: NaiveDate,
        min_duration: Option<u16>,
    },
}

impl Command {
    /// The table a command reads or writes, for result schemas.
    pub fn table(&self) -> Table {
        match self {
            Command::InsertLaboratory(_)
            | Command::UpdateLaboratory { .. }
            | Command::DeleteLaboratory { .. }
            | Command::SelectLaboratories { .. } => Table::Laboratories,
            Command::InsertUser(_)
            | Command::UpdateUser { .. }
            | Command::OverridePermissions { .. }
            | Command::DeleteUser { .. }
            | Command::SelectUsers { .. } => Table::Users,
            Command::InsertBooking(_)
            | Command::UpdateBooking { .. }
            | Command::TransitionBooking { .. }
            | Command::DeleteBooking { .. }
            | Command::SelectBookings { .. } => Table::Bookings,
            Command::SelectCalendar { .. } => Table::Calendar,
            Command::SelectAvailability { .. } => Table::Availability,
        }
    }
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let stmt = match stmts.as_slice() {
        [] => return Err(SqlError::Empty),
        [stmt] => stmt,
        _ => return Err(SqlError::Unsupported("multiple statements".into())),
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── Column/value pairs ───────────────────────────────────────

/// Named values from an INSERT row, a SET list or a WHERE conjunction.
/// Columns are consumed as they are read; leftovers are unknown columns.
struct Fields<'a> {
    table: Table,
    values: Vec<(String, &'a Expr)>,
}

impl<'a> Fields<'a> {
    fn new(table: Table, values: Vec<(String, &'a Expr)>) -> Result<Self, SqlError> {
        for (i, (col, _)) in values.iter().enumerate() {
            if values[..i].iter().any(|(c, _)| c == col) {
                return Err(SqlError::DuplicateColumn(col.clone()));
            }
        }
        Ok(Self { table, values })
    }

    fn take(&mut self, column: &str) -> Option<&'a Expr> {
        let pos = self.values.iter().position(|(c, _)| c == column)?;
        Some(self.values.remove(pos).1)
    }

    fn required(&mut self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.take(column)
            .ok_or(SqlError::MissingColumn(self.table.name(), column))
    }

    fn filter(&mut self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.take(column).ok_or(SqlError::MissingFilter(column))
    }

    fn optional<T>(
        &mut self,
        column: &str,
        parse: impl Fn(&Expr) -> Result<T, SqlError>,
    ) -> Result<Option<T>, SqlError> {
        match self.take(column) {
            Some(e) if !is_null(e) => parse(e).map(Some),
            _ => Ok(None),
        }
    }

    fn patch<T>(
        &mut self,
        column: &str,
        parse: impl Fn(&Expr) -> Result<T, SqlError>,
    ) -> Result<Patch<T>, SqlError> {
        match self.take(column) {
            None => Ok(Patch::Keep),
            Some(e) if is_null(e) => Ok(Patch::Clear),
            Some(e) => parse(e).map(Patch::Set),
        }
    }

    fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn finish(self) -> Result<(), SqlError> {
        match self.values.into_iter().next() {
            Some((col, _)) => Err(SqlError::UnknownColumn(self.table.name(), col)),
            None => Ok(()),
        }
    }
}

// ── INSERT ───────────────────────────────────────────────────

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = Table::lookup(&insert_table_name(insert)?)?.writable()?;
    let row = extract_insert_row(insert)?;
    if insert.columns.is_empty() {
        return Err(SqlError::Parse("INSERT needs an explicit column list".into()));
    }
    if insert.columns.len() != row.len() {
        return Err(SqlError::Parse(format!(
            "{} columns but {} values",
            insert.columns.len(),
            row.len()
        )));
    }
    let pairs = insert
        .columns
        .iter()
        .map(|c| c.value.to_lowercase())
        .zip(row.iter())
        .collect();
    let mut f = Fields::new(table, pairs)?;

    let cmd = match table {
        Table::Laboratories => {
            let open = f.optional("open_time", parse_time)?;
            let close = f.optional("close_time", parse_time)?;
            let operating_hours = (open.is_some() || close.is_some()).then(|| {
                let defaults = OperatingHours::default();
                OperatingHours {
                    open: open.unwrap_or(defaults.open),
                    close: close.unwrap_or(defaults.close),
                }
            });
            Command::InsertLaboratory(NewLaboratory {
                id: f.optional("id", parse_ulid)?,
                name: parse_text(f.required("name")?)?,
                code: parse_text(f.required("code")?)?,
                capacity: parse_u32(f.required("capacity")?)?,
                operating_hours,
                status: f.optional("status", parse_enum::<LabStatus>)?,
                location: f.optional("location", parse_text)?,
                description: f.optional("description", parse_text)?,
            })
        }
        Table::Users => Command::InsertUser(NewUser {
            id: f.optional("id", parse_ulid)?,
            username: parse_text(f.required("username")?)?,
            email: parse_text(f.required("email")?)?,
            role: f.optional("role", parse_enum::<Role>)?,
            password: parse_text(f.required("password")?)?,
        }),
        Table::Bookings => Command::InsertBooking(NewBooking {
            id: f.optional("id", parse_ulid)?,
            laboratory_id: parse_ulid(f.required("laboratory_id")?)?,
            user_id: f.optional("user_id", parse_ulid)?,
            date: parse_date_expr(f.required("date")?)?,
            start: parse_time(f.required("start_time")?)?,
            end: parse_time(f.required("end_time")?)?,
            attendees: parse_u32(f.required("attendees")?)?,
            purpose: parse_text(f.required("purpose")?)?,
            notes: f.optional("notes", parse_text)?,
        }),
        Table::Calendar | Table::Availability => return Err(table.read_only()),
    };
    f.finish()?;
    Ok(cmd)
}

// ── UPDATE ───────────────────────────────────────────────────

fn parse_update(
    table: &TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = Table::lookup(&table_factor_name(&table.relation)?)?.writable()?;
    let id = extract_where_id(selection)?;
    let mut pairs = Vec::with_capacity(assignments.len());
    for a in assignments {
        let col = match &a.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name)
                .ok_or_else(|| SqlError::Parse("empty column name".into()))?,
            AssignmentTarget::Tuple(_) => {
                return Err(SqlError::Unsupported("tuple assignment".into()));
            }
        };
        pairs.push((col, &a.value));
    }
    let mut f = Fields::new(table, pairs)?;

    let cmd = match table {
        Table::Laboratories => Command::UpdateLaboratory {
            id,
            patch: LaboratoryPatch {
                name: f.patch("name", parse_text)?,
                code: f.patch("code", parse_text)?,
                capacity: f.patch("capacity", parse_u32)?,
                open: f.patch("open_time", parse_time)?,
                close: f.patch("close_time", parse_time)?,
                status: f.patch("status", parse_enum::<LabStatus>)?,
                location: f.patch("location", parse_text)?,
                description: f.patch("description", parse_text)?,
            },
        },
        Table::Users => {
            if let Some(expr) = f.take("permissions") {
                if !f.is_empty() {
                    return Err(SqlError::Unsupported(
                        "permissions must be updated on their own".into(),
                    ));
                }
                let json = parse_text(expr)?;
                let permissions = serde_json::from_str(&json)
                    .map_err(|e| SqlError::Parse(format!("bad permissions JSON: {e}")))?;
                return Ok(Command::OverridePermissions { id, permissions });
            }
            Command::UpdateUser {
                id,
                patch: UserPatch {
                    username: f.patch("username", parse_text)?,
                    email: f.patch("email", parse_text)?,
                    role: f.patch("role", parse_enum::<Role>)?,
                    is_active: f.patch("is_active", parse_bool)?,
                    password: f.patch("password", parse_text)?,
                },
            }
        }
        Table::Bookings => {
            if let Some(expr) = f.take("status") {
                let reason = f.optional("rejection_reason", parse_text)?;
                if !f.is_empty() {
                    return Err(SqlError::Unsupported(
                        "status must be updated on its own".into(),
                    ));
                }
                let transition = match parse_enum::<BookingStatus>(expr)? {
                    BookingStatus::Approved => Transition::Approve,
                    BookingStatus::Rejected => Transition::Reject,
                    BookingStatus::Cancelled => Transition::Cancel,
                    BookingStatus::Pending => Transition::Reopen,
                };
                if reason.is_some() && transition != Transition::Reject {
                    return Err(SqlError::Unsupported(
                        "rejection_reason only accompanies status = 'rejected'".into(),
                    ));
                }
                return Ok(Command::TransitionBooking { id, transition, reason });
            }
            Command::UpdateBooking {
                id,
                patch: BookingPatch {
                    date: f.patch("date", parse_date_expr)?,
                    start: f.patch("start_time", parse_time)?,
                    end: f.patch("end_time", parse_time)?,
                    attendees: f.patch("attendees", parse_u32)?,
                    purpose: f.patch("purpose", parse_text)?,
                    notes: f.patch("notes", parse_text)?,
                },
            }
        }
        Table::Calendar | Table::Availability => return Err(table.read_only()),
    };
    f.finish()?;
    Ok(cmd)
}

// ── DELETE ───────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = Table::lookup(&delete_table_name(delete)?)?.writable()?;
    let id = extract_where_id(&delete.selection)?;

    match table {
        Table::Laboratories => Ok(Command::DeleteLaboratory { id }),
        Table::Users => Ok(Command::DeleteUser { id }),
        Table::Bookings => Ok(Command::DeleteBooking { id }),
        Table::Calendar | Table::Availability => return Err(table.read_only()),
    }
}

// ── SELECT ───────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = Table::lookup(&table_factor_name(&select.from[0].relation)?)?;

    let mut pairs = Vec::new();
    if let Some(selection) = &select.selection {
        collect_equalities(selection, &mut pairs)?;
    }
    let mut f = Fields::new(table, pairs)?;

    let cmd = match table {
        Table::Laboratories => Command::SelectLaboratories {
            id: f.optional("id", parse_ulid)?,
        },
        Table::Users => Command::SelectUsers {
            id: f.optional("id", parse_ulid)?,
        },
        Table::Bookings => Command::SelectBookings {
            id: f.optional("id", parse_ulid)?,
            filter: BookingFilter {
                laboratory_id: f.optional("laboratory_id", parse_ulid)?,
                user_id: f.optional("user_id", parse_ulid)?,
                date: f.optional("date", parse_date_expr)?,
                status: f.optional("status", parse_enum::<BookingStatus>)?,
            },
        },
        Table::Calendar => Command::SelectCalendar {
            laboratory_id: parse_ulid(f.filter("laboratory_id")?)?,
            date: parse_date_expr(f.filter("date")?)?,
        },
        Table::Availability => Command::SelectAvailability {
            laboratory_id: parse_ulid(f.filter("laboratory_id")?)?,
            date: parse_date_expr(f.filter("date")?)?,
            min_duration: f.optional("min_duration", parse_u16)?,
        },
    };
    f.finish()?;
    Ok(cmd)
}

/// The table a SELECT reads, without interpreting its filters. Prepared
/// statements are described before their parameters are bound.
pub fn select_table(sql: &str) -> Option<Table> {
    let stmts = Parser::parse_sql(&PostgreSqlDialect {}, sql).ok()?;
    let Statement::Query(query) = stmts.first()? else {
        return None;
    };
    let SetExpr::Select(select) = query.body.as_ref() else {
        return None;
    };
    let from = select.from.first()?;
    Table::lookup(&table_factor_name(&from.relation).ok()?).ok()
}

/// Flatten `a = 1 AND b = 2 AND ...` into column/value pairs.
fn collect_equalities<'a>(expr: &'a Expr, out: &mut Vec<(String, &'a Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_equalities(left, out)?;
            collect_equalities(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.push((col, right.as_ref()));
            Ok(())
        }
        Expr::Nested(inner) => collect_equalities(inner, out),
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
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
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

fn extract_insert_row(insert: &ast::Insert) -> Result<&[Expr], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            if expr_column_name(left).as_deref() == Some("id") {
                parse_ulid(right)
            } else {
                Err(SqlError::MissingFilter("id"))
            }
        }
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

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

/// Bound parameters arrive as quoted text, so numbers and booleans are
/// accepted in either form.
fn literal(expr: &Expr) -> Result<&str, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(s),
        Some(value) => Err(SqlError::Parse(format!("expected literal, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = literal(expr)?;
    Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let s = literal(expr)?;
    s.parse().map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}")))
}

fn parse_u16(expr: &Expr) -> Result<u16, SqlError> {
    let s = literal(expr)?;
    s.parse().map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        _ => match literal(expr)?.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            s => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
    }
}

fn parse_time(expr: &Expr) -> Result<TimeOfDay, SqlError> {
    literal(expr)?.parse().map_err(|e: ValueError| SqlError::Parse(e.to_string()))
}

fn parse_date_expr(expr: &Expr) -> Result<NaiveDate, SqlError> {
    parse_date(literal(expr)?).map_err(|e| SqlError::Parse(e.to_string()))
}

fn parse_enum<T>(expr: &Expr) -> Result<T, SqlError>
where
    T: std::str::FromStr<Err = ValueError>,
{
    literal(expr)?.parse().map_err(|e: ValueError| SqlError::Parse(e.to_string()))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, PartialEq)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(&'static str, String),
    DuplicateColumn(String),
    MissingColumn(&'static str, &'static str),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(t, c) => write!(f, "{t}: unknown column {c}"),
            SqlError::DuplicateColumn(c) => write!(f, "column {c} given twice"),
            SqlError::MissingColumn(t, c) => write!(f, "{t}: missing column {c}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
