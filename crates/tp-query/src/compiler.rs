//! # Query Compiler
//!
//! Turns a restricted SQL `SELECT` into a [`QueryPlan`].
//!
//! Syntax:
//! ```text
//! SELECT * FROM app, worker WHERE line.level = 'error' AND line.code IN (500, 502)
//! SELECT line.cmd AS command FROM app WHERE date >= '2016-10-05' AND date < '2016-10-07'
//! SELECT COUNT(*) FROM app WHERE line.path LIKE '/api/%'
//! SELECT COUNT(DISTINCT(line.cmd)) FROM app
//! SELECT DISTINCT(line.cmd) FROM app
//! ```
//!
//! WHERE clauses are conjunctions only. `BETWEEN` expands into a `>=`/`<=`
//! pair and conditions on `date` become [`DatePredicate`]s.

use crate::dates::{DatePredicate, DATE_FIELD};
use crate::error::CompileError;
use crate::escape::EscapedQuery;
use crate::plan::{
    FieldPath, FieldPredicate, LikePattern, Operator, PredicateValue, Projection, QueryPlan,
    ResultKind,
};
use sqlparser::ast::{
    BinaryOperator, Distinct, DuplicateTreatment, Expr, Function, FunctionArg, FunctionArgExpr,
    FunctionArguments, GroupByExpr, Select, SelectItem, SetExpr, Statement, TableFactor,
    UnaryOperator, Value,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

/// Compile a query string into a [`QueryPlan`].
pub fn compile(sql: &str) -> Result<QueryPlan, CompileError> {
    let query = EscapedQuery::new(sql.trim());

    let statements = Parser::parse_sql(&GenericDialect {}, query.as_str())
        .map_err(|e| CompileError::Syntax(query.restore(&e.to_string())))?;

    let statement = match statements.as_slice() {
        [single] => single,
        [] => return Err(CompileError::Syntax("empty query".into())),
        _ => {
            return Err(CompileError::Unsupported(format!(
                "expected exactly one statement, got {}",
                statements.len()
            )))
        }
    };

    let select = match statement {
        Statement::Query(q) => {
            if q.order_by.is_some() || q.limit.is_some() || q.offset.is_some() {
                return Err(CompileError::Unsupported(
                    "ORDER BY / LIMIT / OFFSET".to_string(),
                ));
            }
            match q.body.as_ref() {
                SetExpr::Select(select) => select.as_ref(),
                other => {
                    return Err(CompileError::Unsupported(query.restore(&other.to_string())))
                }
            }
        }
        other => return Err(CompileError::NotASelect(query.restore(&other.to_string()))),
    };

    let plan = PlanBuilder::new(&query).build(select)?;
    tracing::debug!(query = %sql, ?plan, "compiled query");
    Ok(plan)
}

struct PlanBuilder<'q> {
    query: &'q EscapedQuery,
    conditions: Vec<FieldPredicate>,
    selected: Vec<FieldPredicate>,
    date_predicates: Vec<DatePredicate>,
    projections: Vec<Projection>,
    aggregation_field: Option<FieldPath>,
    result_kind: ResultKind,
}

impl<'q> PlanBuilder<'q> {
    fn new(query: &'q EscapedQuery) -> Self {
        Self {
            query,
            conditions: Vec::new(),
            selected: Vec::new(),
            date_predicates: Vec::new(),
            projections: Vec::new(),
            aggregation_field: None,
            result_kind: ResultKind::Search,
        }
    }

    fn build(mut self, select: &Select) -> Result<QueryPlan, CompileError> {
        if select.having.is_some() {
            return Err(CompileError::Unsupported("HAVING".into()));
        }
        match &select.group_by {
            GroupByExpr::Expressions(exprs, _) if exprs.is_empty() => {}
            _ => return Err(CompileError::Unsupported("GROUP BY".into())),
        }

        if let Some(selection) = &select.selection {
            self.visit_where(selection)?;
        }

        let distinct = match &select.distinct {
            None => false,
            Some(Distinct::Distinct) => true,
            Some(other) => return Err(CompileError::Unsupported(self.fragment(other))),
        };
        for item in &select.projection {
            match item {
                SelectItem::Wildcard(_) => {}
                SelectItem::UnnamedExpr(expr) => self.visit_select(expr, None, distinct)?,
                SelectItem::ExprWithAlias { expr, alias } => {
                    let alias = self.query.restore(&alias.value);
                    self.visit_select(expr, Some(alias), distinct)?
                }
                other => return Err(CompileError::Unsupported(self.fragment(other))),
            }
        }

        let sources = self.visit_from(select)?;

        let mut predicates = self.conditions;
        predicates.extend(self.selected);

        Ok(QueryPlan {
            sources,
            predicates,
            date_predicates: self.date_predicates,
            projections: self.projections,
            aggregation_field: self.aggregation_field,
            result_kind: self.result_kind,
        })
    }

    // WHERE

    fn visit_where(&mut self, expr: &Expr) -> Result<(), CompileError> {
        match expr {
            Expr::Nested(inner) => self.visit_where(inner),
            Expr::BinaryOp {
                left,
                op: BinaryOperator::And,
                right,
            } => {
                self.visit_where(left)?;
                self.visit_where(right)
            }
            Expr::BinaryOp { left, op, right } => {
                let operator = comparison(op)
                    .ok_or_else(|| CompileError::Unsupported(self.fragment(expr)))?;
                let field = self.field_name(left)?;
                let literal = self.literal(right)?;
                self.push_condition(field, operator, literal)
            }
            Expr::Between {
                expr: target,
                negated: false,
                low,
                high,
                ..
            } => {
                let field = self.field_name(target)?;
                let low = self.literal(low)?;
                let high = self.literal(high)?;
                self.push_condition(field.clone(), Operator::GtEq, low)?;
                self.push_condition(field, Operator::LtEq, high)
            }
            Expr::InList {
                expr: target,
                list,
                negated: false,
                ..
            } => {
                let field = self.field_name(target)?;
                let values = list
                    .iter()
                    .map(|e| self.literal(e))
                    .collect::<Result<Vec<_>, _>>()?;
                self.push_set(field, values)
            }
            Expr::Like {
                negated: false,
                expr: target,
                pattern,
                ..
            } => {
                let field = self.field_name(target)?;
                let pattern = self.literal(pattern)?;
                self.push_condition(field, Operator::Like, pattern)
            }
            Expr::ILike {
                negated: false,
                expr: target,
                pattern,
                ..
            } => {
                let field = self.field_name(target)?;
                let pattern = self.literal(pattern)?;
                self.push_condition(field, Operator::ILike, pattern)
            }
            Expr::IsNotNull(target) => {
                let field = self.field_name(target)?;
                self.push_condition(field, Operator::Exists, String::new())
            }
            _ => Err(CompileError::Unsupported(self.fragment(expr))),
        }
    }

    fn push_condition(
        &mut self,
        field: String,
        operator: Operator,
        literal: String,
    ) -> Result<(), CompileError> {
        if field.eq_ignore_ascii_case(DATE_FIELD) {
            // Every record has a date, so `date IS NOT NULL` filters nothing.
            if operator != Operator::Exists {
                self.date_predicates
                    .push(DatePredicate::parse(&literal, operator)?);
            }
            return Ok(());
        }

        let value = match operator {
            Operator::Exists => PredicateValue::None,
            Operator::Like | Operator::ILike => PredicateValue::Pattern(
                LikePattern::new(&literal, operator == Operator::ILike)
                    .map_err(|_| CompileError::InvalidLiteral(literal.clone()))?,
            ),
            _ => typed_literal(&field, operator, literal)?,
        };
        self.conditions
            .push(FieldPredicate::new(FieldPath::new(field), operator, value));
        Ok(())
    }

    /// `IN (...)`: all-integer lists stay integers, anything mixed becomes
    /// strings.
    fn push_set(&mut self, field: String, values: Vec<String>) -> Result<(), CompileError> {
        if field.eq_ignore_ascii_case(DATE_FIELD) {
            return Err(CompileError::Unsupported(format!("{} IN (...)", field)));
        }
        let ints: Option<Vec<i64>> = values.iter().map(|v| v.parse().ok()).collect();
        let value = match ints {
            Some(ints) => PredicateValue::IntSet(ints),
            None => PredicateValue::StrSet(values),
        };
        self.conditions
            .push(FieldPredicate::new(FieldPath::new(field), Operator::In, value));
        Ok(())
    }

    // SELECT

    fn visit_select(
        &mut self,
        expr: &Expr,
        alias: Option<String>,
        distinct: bool,
    ) -> Result<(), CompileError> {
        if let Expr::Function(func) = expr {
            return self.visit_function(func);
        }

        let path = FieldPath::new(self.field_name(expr)?);
        if distinct && self.result_kind != ResultKind::CountDistinct {
            self.result_kind = ResultKind::Distinct;
            self.aggregation_field = Some(path.clone());
            self.selected.push(FieldPredicate::exists(path));
            return Ok(());
        }

        let alias = alias.unwrap_or_else(|| path.leaf().to_string());
        let mut exists = FieldPredicate::exists(path.clone());
        exists.alias = alias.clone();
        self.selected.push(exists);
        self.projections.push(Projection { path, alias });
        Ok(())
    }

    fn visit_function(&mut self, func: &Function) -> Result<(), CompileError> {
        let name = self.query.restore(&func.name.to_string());
        if !name.eq_ignore_ascii_case("count") {
            return Err(CompileError::Unsupported(format!("function {}", name)));
        }

        let (distinct, args) = match &func.args {
            FunctionArguments::None => (false, &[][..]),
            FunctionArguments::List(list) => (
                matches!(list.duplicate_treatment, Some(DuplicateTreatment::Distinct)),
                list.args.as_slice(),
            ),
            FunctionArguments::Subquery(_) => {
                return Err(CompileError::Unsupported(self.fragment(func)))
            }
        };

        match args {
            [] | [FunctionArg::Unnamed(FunctionArgExpr::Wildcard)] if !distinct => {
                self.result_kind = ResultKind::Count;
            }
            [FunctionArg::Unnamed(FunctionArgExpr::Expr(arg))] => {
                let path = FieldPath::new(self.field_name(arg)?);
                self.selected.push(FieldPredicate::exists(path.clone()));
                self.aggregation_field = Some(path);
                self.result_kind = if distinct {
                    ResultKind::CountDistinct
                } else {
                    ResultKind::Count
                };
            }
            _ => return Err(CompileError::Unsupported(self.fragment(func))),
        }
        Ok(())
    }

    // FROM

    fn visit_from(&self, select: &Select) -> Result<Vec<String>, CompileError> {
        if select.from.is_empty() {
            return Err(CompileError::MissingFrom);
        }

        let mut sources: Vec<String> = Vec::new();
        for table in &select.from {
            if !table.joins.is_empty() {
                return Err(CompileError::Unsupported("JOIN".into()));
            }
            match &table.relation {
                TableFactor::Table { name, .. } => {
                    let source = name
                        .0
                        .iter()
                        .map(|ident| self.query.restore(&ident.value))
                        .collect::<Vec<_>>()
                        .join(".");
                    if !sources.contains(&source) {
                        sources.push(source);
                    }
                }
                other => return Err(CompileError::Unsupported(self.fragment(other))),
            }
        }
        Ok(sources)
    }

    // Leaves

    fn field_name(&self, expr: &Expr) -> Result<String, CompileError> {
        match expr {
            Expr::Identifier(ident) => Ok(self.query.restore(&ident.value)),
            Expr::CompoundIdentifier(parts) => Ok(parts
                .iter()
                .map(|ident| self.query.restore(&ident.value))
                .collect::<Vec<_>>()
                .join(".")),
            Expr::Nested(inner) => self.field_name(inner),
            _ => Err(CompileError::Unsupported(format!(
                "expected a field, got {}",
                self.fragment(expr)
            ))),
        }
    }

    /// Lexical text of a literal. Double-quoted tokens are accepted as
    /// strings.
    fn literal(&self, expr: &Expr) -> Result<String, CompileError> {
        match expr {
            Expr::Value(Value::Number(n, _)) => Ok(n.clone()),
            Expr::Value(Value::SingleQuotedString(s)) | Expr::Value(Value::DoubleQuotedString(s)) => {
                Ok(s.clone())
            }
            Expr::Value(Value::Boolean(b)) => Ok(b.to_string()),
            Expr::Identifier(ident) if ident.quote_style.is_some() => Ok(ident.value.clone()),
            Expr::UnaryOp {
                op: UnaryOperator::Minus,
                expr: inner,
            } => match inner.as_ref() {
                Expr::Value(Value::Number(n, _)) => Ok(format!("-{}", n)),
                _ => Err(CompileError::InvalidLiteral(self.fragment(expr))),
            },
            Expr::Nested(inner) => self.literal(inner),
            _ => Err(CompileError::InvalidLiteral(self.fragment(expr))),
        }
    }

    fn fragment(&self, node: &impl std::fmt::Display) -> String {
        self.query.restore(&node.to_string())
    }
}

/// Integers and finite floats compare numerically. Strings only support
/// equality.
fn typed_literal(
    field: &str,
    operator: Operator,
    literal: String,
) -> Result<PredicateValue, CompileError> {
    if let Ok(n) = literal.parse::<i64>() {
        return Ok(PredicateValue::Int(n));
    }
    if let Some(f) = literal.parse::<f64>().ok().filter(|f| f.is_finite()) {
        return Ok(PredicateValue::Float(f));
    }
    match operator {
        Operator::Eq | Operator::NotEq => Ok(PredicateValue::Str(literal)),
        _ => Err(CompileError::Unsupported(format!(
            "{} {} '{}': ordering needs a numeric literal",
            field,
            operator.as_str(),
            literal
        ))),
    }
}

fn comparison(op: &BinaryOperator) -> Option<Operator> {
    match op {
        BinaryOperator::Eq => Some(Operator::Eq),
        BinaryOperator::NotEq => Some(Operator::NotEq),
        BinaryOperator::Gt => Some(Operator::Gt),
        BinaryOperator::GtEq => Some(Operator::GtEq),
        BinaryOperator::Lt => Some(Operator::Lt),
        BinaryOperator::LtEq => Some(Operator::LtEq),
        _ => None,
    }
}
