//! SQL statement and expression tree.
//!
//! The wire-protocol frontend parses SQL text; this crate only defines the
//! tree the planner consumes. `Expr::Offset` is not produced by parsing: the
//! analyzer rewrites expressions into offset references once a column has
//! been pushed into a child's output.

use std::fmt;

use storm_common::Value;

/// A statement the planner accepts.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Select(Select),
    Union(Union),
    Insert(Insert),
    Update(Update),
    Delete(Delete),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Select {
    pub distinct: bool,
    pub exprs: Vec<SelectExpr>,
    pub from: Vec<TableRef>,
    pub where_clause: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub having: Option<Expr>,
    pub order_by: Vec<OrderExpr>,
    pub limit: Option<Limit>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Union {
    pub inputs: Vec<Select>,
    pub all: bool,
    pub order_by: Vec<OrderExpr>,
    pub limit: Option<Limit>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Insert {
    pub table: TableName,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Expr>>,
    pub ignore: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub table: TableName,
    pub assignments: Vec<(String, Expr)>,
    pub where_clause: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Delete {
    pub table: TableName,
    pub where_clause: Option<Expr>,
}

/// A possibly keyspace-qualified table name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableName {
    pub keyspace: Option<String>,
    pub name: String,
}

impl TableName {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            keyspace: None,
            name: name.into(),
        }
    }

    pub fn qualified(keyspace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            keyspace: Some(keyspace.into()),
            name: name.into(),
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.keyspace {
            Some(ks) => write!(f, "{}.{}", ks, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// An entry in the FROM clause.
#[derive(Debug, Clone, PartialEq)]
pub enum TableRef {
    Named {
        table: TableName,
        alias: Option<String>,
    },
    Join(Box<Join>),
}

impl TableRef {
    pub fn named(name: impl Into<String>) -> Self {
        TableRef::Named {
            table: TableName::new(name),
            alias: None,
        }
    }

    /// The name this table is referred to by in column qualifiers.
    pub fn binding_name(&self) -> Option<&str> {
        match self {
            TableRef::Named { table, alias } => {
                Some(alias.as_deref().unwrap_or(table.name.as_str()))
            }
            TableRef::Join(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub left: TableRef,
    pub right: TableRef,
    pub kind: JoinKind,
    pub on: Option<Expr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
}

/// A select-list entry.
#[derive(Debug, Clone, PartialEq)]
pub enum SelectExpr {
    Aliased {
        expr: Expr,
        alias: Option<String>,
    },
    Star,
}

impl SelectExpr {
    pub fn expr(expr: Expr) -> Self {
        SelectExpr::Aliased { expr, alias: None }
    }

    pub fn aliased(expr: Expr, alias: impl Into<String>) -> Self {
        SelectExpr::Aliased {
            expr,
            alias: Some(alias.into()),
        }
    }

    /// The output column name: the alias, the column name, or the printed
    /// expression.
    pub fn column_name(&self) -> String {
        match self {
            SelectExpr::Aliased {
                alias: Some(alias), ..
            } => alias.clone(),
            SelectExpr::Aliased { expr, .. } => match expr {
                Expr::Column { name, .. } => name.clone(),
                other => other.to_string(),
            },
            SelectExpr::Star => "*".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderExpr {
    pub expr: Expr,
    pub desc: bool,
}

impl OrderExpr {
    pub fn asc(expr: Expr) -> Self {
        Self { expr, desc: false }
    }

    pub fn desc(expr: Expr) -> Self {
        Self { expr, desc: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limit {
    pub count: u64,
    pub offset: u64,
}

/// Aggregate functions recognized in select lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggrFunc {
    Count,
    Sum,
    Min,
    Max,
    Avg,
}

impl AggrFunc {
    pub fn parse(name: &str) -> Option<AggrFunc> {
        match name.to_ascii_lowercase().as_str() {
            "count" => Some(AggrFunc::Count),
            "sum" => Some(AggrFunc::Sum),
            "min" => Some(AggrFunc::Min),
            "max" => Some(AggrFunc::Max),
            "avg" => Some(AggrFunc::Avg),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AggrFunc::Count => "count",
            AggrFunc::Sum => "sum",
            AggrFunc::Min => "min",
            AggrFunc::Max => "max",
            AggrFunc::Avg => "avg",
        }
    }
}

/// How a merging aggregator combines per-shard partial values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateOpcode {
    /// SUM of partial sums.
    Sum,
    /// COUNT merges by summing partial counts.
    Count,
    /// COUNT(*) merges by summing partial counts.
    CountStar,
    Min,
    Max,
    /// Dedup values across shards, then sum.
    SumDistinct,
    /// Dedup values across shards, then count.
    CountDistinct,
    /// A non-aggregated column in an aggregation: any shard's value works
    /// because grouping keys are equal within a group.
    AnyValue,
}

impl AggregateOpcode {
    /// Distinct opcodes cannot be partially aggregated per shard; the
    /// merger needs every raw value.
    pub fn is_distinct(&self) -> bool {
        matches!(
            self,
            AggregateOpcode::SumDistinct | AggregateOpcode::CountDistinct
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Column {
        table: Option<String>,
        name: String,
    },
    Literal(Value),
    BindVar(String),
    Tuple(Vec<Expr>),
    BinaryOp {
        left: Box<Expr>,
        op: BinaryOperator,
        right: Box<Expr>,
    },
    UnaryOp {
        op: UnaryOperator,
        expr: Box<Expr>,
    },
    FuncCall {
        name: String,
        args: Vec<Expr>,
    },
    Aggregate {
        func: AggrFunc,
        /// `None` is `COUNT(*)`.
        arg: Option<Box<Expr>>,
        distinct: bool,
    },
    InList {
        expr: Box<Expr>,
        list: Vec<Expr>,
        negated: bool,
    },
    IsNull {
        expr: Box<Expr>,
        negated: bool,
    },
    Exists(Box<Select>),
    Subquery(Box<Select>),
    /// A reference into the child's output at a known column offset. The
    /// original expression is kept for display.
    Offset {
        offset: usize,
        original: Box<Expr>,
    },
}

impl Expr {
    pub fn col(name: impl Into<String>) -> Expr {
        Expr::Column {
            table: None,
            name: name.into(),
        }
    }

    pub fn qual_col(table: impl Into<String>, name: impl Into<String>) -> Expr {
        Expr::Column {
            table: Some(table.into()),
            name: name.into(),
        }
    }

    pub fn lit(value: impl Into<Value>) -> Expr {
        Expr::Literal(value.into())
    }

    pub fn bindvar(name: impl Into<String>) -> Expr {
        Expr::BindVar(name.into())
    }

    pub fn eq(left: Expr, right: Expr) -> Expr {
        Expr::BinaryOp {
            left: Box::new(left),
            op: BinaryOperator::Eq,
            right: Box::new(right),
        }
    }

    pub fn and(left: Expr, right: Expr) -> Expr {
        Expr::BinaryOp {
            left: Box::new(left),
            op: BinaryOperator::And,
            right: Box::new(right),
        }
    }

    pub fn aggregate(func: AggrFunc, arg: Expr) -> Expr {
        Expr::Aggregate {
            func,
            arg: Some(Box::new(arg)),
            distinct: false,
        }
    }

    pub fn count_star() -> Expr {
        Expr::Aggregate {
            func: AggrFunc::Count,
            arg: None,
            distinct: false,
        }
    }

    /// Split a predicate on AND into its conjuncts.
    pub fn split_and(&self) -> Vec<&Expr> {
        let mut out = Vec::new();
        fn walk<'a>(expr: &'a Expr, out: &mut Vec<&'a Expr>) {
            match expr {
                Expr::BinaryOp {
                    left,
                    op: BinaryOperator::And,
                    right,
                } => {
                    walk(left, out);
                    walk(right, out);
                }
                other => out.push(other),
            }
        }
        walk(self, &mut out);
        out
    }

    /// Pre-order walk. The visitor returns false to skip a subtree.
    pub fn walk(&self, visit: &mut dyn FnMut(&Expr) -> bool) {
        if !visit(self) {
            return;
        }
        match self {
            Expr::BinaryOp { left, right, .. } => {
                left.walk(visit);
                right.walk(visit);
            }
            Expr::UnaryOp { expr, .. } => expr.walk(visit),
            Expr::FuncCall { args, .. } => {
                for arg in args {
                    arg.walk(visit);
                }
            }
            Expr::Aggregate { arg, .. } => {
                if let Some(arg) = arg {
                    arg.walk(visit);
                }
            }
            Expr::Tuple(items) => {
                for item in items {
                    item.walk(visit);
                }
            }
            Expr::InList { expr, list, .. } => {
                expr.walk(visit);
                for item in list {
                    item.walk(visit);
                }
            }
            Expr::IsNull { expr, .. } => expr.walk(visit),
            Expr::Offset { original, .. } => original.walk(visit),
            Expr::Column { .. }
            | Expr::Literal(_)
            | Expr::BindVar(_)
            | Expr::Exists(_)
            | Expr::Subquery(_) => {}
        }
    }

    /// Whether any aggregate function appears in this expression.
    pub fn contains_aggregation(&self) -> bool {
        let mut found = false;
        self.walk(&mut |e| {
            if matches!(e, Expr::Aggregate { .. }) {
                found = true;
                return false;
            }
            true
        });
        found
    }

    /// Whether a subquery (or a subquery placeholder bind variable)
    /// appears in this expression.
    pub fn contains_subquery(&self) -> bool {
        let mut found = false;
        self.walk(&mut |e| match e {
            Expr::Subquery(_) | Expr::Exists(_) => {
                found = true;
                false
            }
            Expr::BindVar(name) if name.starts_with("__sq") => {
                found = true;
                false
            }
            _ => true,
        });
        found
    }

    /// Whether the expression already references child output by offset
    /// (i.e. it has been through the offset rewrite).
    pub fn contains_offset(&self) -> bool {
        let mut found = false;
        self.walk(&mut |e| {
            if matches!(e, Expr::Offset { .. }) {
                found = true;
                return false;
            }
            true
        });
        found
    }

    pub fn is_null_literal(&self) -> bool {
        matches!(self, Expr::Literal(Value::Null))
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Column { table: Some(t), name } => write!(f, "{}.{}", t, name),
            Expr::Column { table: None, name } => write!(f, "{}", name),
            Expr::Literal(v) => write!(f, "{}", v),
            Expr::BindVar(name) => write!(f, ":{}", name),
            Expr::Tuple(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, ")")
            }
            Expr::BinaryOp { left, op, right } => write!(f, "{} {} {}", left, op, right),
            Expr::UnaryOp { op, expr } => write!(f, "{}{}", op, expr),
            Expr::FuncCall { name, args } => {
                write!(f, "{}(", name)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ")")
            }
            Expr::Aggregate {
                func,
                arg,
                distinct,
            } => {
                write!(f, "{}(", func.name())?;
                if *distinct {
                    write!(f, "distinct ")?;
                }
                match arg {
                    Some(arg) => write!(f, "{})", arg),
                    None => write!(f, "*)"),
                }
            }
            Expr::InList {
                expr,
                list,
                negated,
            } => {
                write!(f, "{}{} in (", expr, if *negated { " not" } else { "" })?;
                for (i, item) in list.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, ")")
            }
            Expr::IsNull { expr, negated } => {
                write!(f, "{} is {}null", expr, if *negated { "not " } else { "" })
            }
            Expr::Exists(_) => write!(f, "exists (subquery)"),
            Expr::Subquery(_) => write!(f, "(subquery)"),
            Expr::Offset { offset, original } => write!(f, "[{}:{}]", offset, original),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperator {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
    Like,
}

impl fmt::Display for BinaryOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinaryOperator::Add => "+",
            BinaryOperator::Sub => "-",
            BinaryOperator::Mul => "*",
            BinaryOperator::Div => "/",
            BinaryOperator::Eq => "=",
            BinaryOperator::NotEq => "!=",
            BinaryOperator::Lt => "<",
            BinaryOperator::LtEq => "<=",
            BinaryOperator::Gt => ">",
            BinaryOperator::GtEq => ">=",
            BinaryOperator::And => "and",
            BinaryOperator::Or => "or",
            BinaryOperator::Like => "like",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOperator {
    Not,
    Neg,
}

impl fmt::Display for UnaryOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnaryOperator::Not => write!(f, "not "),
            UnaryOperator::Neg => write!(f, "-"),
        }
    }
}
