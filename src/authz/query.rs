//! Compiled authorization queries.
//!
//! The resource hierarchy is compiled into one recursive traversal, the
//! *ancestor walk*, driven by a dispatch table keyed on resource type: for a
//! row `(type, id)` of the walk, the arm for `type` yields the parent id and
//! parent type. Because the dispatch happens inside a single recursive CTE,
//! the number of declared resource types does not change the number of
//! queries a check issues.
//!
//! The walk carries `(origin, resource_id, resource_type, depth)`. `origin` is
//! the instance the walk started from, which lets the bulk filter seed the
//! walk with every instance of a type at once and report which origins
//! reached a matching assignment.
//!
//! Statements are assembled with sea-query and rendered per backend by
//! `DbBackend::build`. Every value, including the resource type tags of the
//! dispatch, is bound. Table and column names come from the policy and were
//! validated as plain identifiers when the model was built.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use sea_orm::sea_query::{
    Alias, CaseStatement, CommonTableExpression, Condition, Expr, JoinType, Order, Query,
    SelectStatement, SimpleExpr, SubQueryStatement, UnionType, WithClause,
};
use sea_orm::{DbBackend, Statement};

use crate::authz::types::{Relationship, ResourceType};

const USER_ROLES: &str = "user_roles";
const WALK: &str = "walk";
const ORIGIN: &str = "origin";
const RESOURCE_ID: &str = "resource_id";
const RESOURCE_TYPE: &str = "resource_type";
const DEPTH: &str = "depth";

/// One arm of the parent dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentStep {
    pub child_type: String,
    pub parent_type: String,
    pub child_table: String,
    pub child_id: String,
    pub parent_table: String,
    pub parent_id: String,
    pub parent_field: String,
    pub references: String,
}

impl From<&Relationship> for ParentStep {
    fn from(rel: &Relationship) -> Self {
        Self {
            child_type: rel.child_type.clone(),
            parent_type: rel.parent_type.clone(),
            child_table: rel.child_table.clone(),
            child_id: rel.child_id.clone(),
            parent_table: rel.parent_table.clone(),
            parent_id: rel.parent_id.clone(),
            parent_field: rel.parent_field.clone(),
            references: rel.references.clone(),
        }
    }
}

impl ParentStep {
    /// `(SELECT p.parent_id FROM child c JOIN parent p ON ... WHERE c.child_id = walk.resource_id)`
    fn parent_lookup(&self, backend: DbBackend) -> SimpleExpr {
        let lookup = Query::select()
            .expr(as_text(col("p", &self.parent_id), backend))
            .from_as(Alias::new(&self.child_table), Alias::new("c"))
            .join_as(
                JoinType::InnerJoin,
                Alias::new(&self.parent_table),
                Alias::new("p"),
                col("c", &self.parent_field).equals((Alias::new("p"), Alias::new(&self.references))),
            )
            .and_where(
                Expr::expr(as_text(col("c", &self.child_id), backend))
                    .equals((Alias::new(WALK), Alias::new(RESOURCE_ID))),
            )
            .to_owned();
        SimpleExpr::SubQuery(None, Box::new(SubQueryStatement::SelectStatement(lookup)))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AncestorWalk {
    /// Sorted by child type; at most one step per child type.
    steps: Vec<ParentStep>,
}

/// Where the walk starts.
enum Seed<'a> {
    /// One instance, bound as parameters.
    Instance {
        resource_type: &'a str,
        resource_id: &'a str,
    },
    /// Every row of a resource table.
    AllOf { target: &'a FilterTarget },
}

impl AncestorWalk {
    pub fn from_relationships(relationships: &BTreeMap<String, Relationship>) -> Self {
        Self {
            steps: relationships.values().map(ParentStep::from).collect(),
        }
    }

    pub fn steps(&self) -> &[ParentStep] {
        &self.steps
    }

    /// Chain of `(type, id)` pairs from `resource` up to the root, nearest first.
    pub fn render_chain(&self, backend: DbBackend, resource_type: &str, resource_id: &str) -> Statement {
        let select = Query::select()
            .expr_as(walk_col(RESOURCE_TYPE), Alias::new(RESOURCE_TYPE))
            .expr_as(walk_col(RESOURCE_ID), Alias::new(RESOURCE_ID))
            .from(Alias::new(WALK))
            .and_where(walk_col(RESOURCE_ID).is_not_null())
            .order_by((Alias::new(WALK), Alias::new(DEPTH)), Order::Asc)
            .to_owned();
        let seed = Seed::Instance {
            resource_type,
            resource_id,
        };
        backend.build(&self.with_clause(backend, seed).query(select))
    }

    /// `WITH RECURSIVE walk (origin, resource_id, resource_type, depth) AS (seed UNION step)`
    fn with_clause(&self, backend: DbBackend, seed: Seed<'_>) -> WithClause {
        let mut base = Query::select();
        match seed {
            Seed::Instance {
                resource_type,
                resource_id,
            } => {
                base.expr(as_text(Expr::val(resource_id), backend))
                    .expr(as_text(Expr::val(resource_id), backend))
                    .expr(as_text(Expr::val(resource_type), backend));
            }
            Seed::AllOf { target } => {
                base.expr(as_text(col("r", &target.id_column), backend))
                    .expr(as_text(col("r", &target.id_column), backend))
                    .expr(as_text(Expr::val(target.resource_type.as_str()), backend))
                    .from_as(Alias::new(&target.table), Alias::new("r"));
            }
        }
        base.expr(Expr::val(0));

        if !self.steps.is_empty() {
            base.union(UnionType::Distinct, self.parent_step(backend));
        }

        let cte = CommonTableExpression::new()
            .query(base)
            .columns([ORIGIN, RESOURCE_ID, RESOURCE_TYPE, DEPTH].map(Alias::new))
            .table_name(Alias::new(WALK))
            .to_owned();
        WithClause::new().recursive(true).cte(cte).to_owned()
    }

    /// Recursive arm: one CASE dispatch on the row's type for the parent id and
    /// one for the parent type.
    fn parent_step(&self, backend: DbBackend) -> SelectStatement {
        let mut parent_id = CaseStatement::new();
        let mut parent_type = CaseStatement::new();
        for step in &self.steps {
            parent_id = parent_id.case(
                walk_col(RESOURCE_TYPE).eq(step.child_type.as_str()),
                step.parent_lookup(backend),
            );
            parent_type = parent_type.case(
                walk_col(RESOURCE_TYPE).eq(step.child_type.as_str()),
                as_text(Expr::val(step.parent_type.as_str()), backend),
            );
        }

        Query::select()
            .expr(walk_col(ORIGIN))
            .expr(parent_id)
            .expr(parent_type)
            .expr(walk_col(DEPTH).add(1))
            .from(Alias::new(WALK))
            .and_where(walk_col(RESOURCE_ID).is_not_null())
            .and_where(
                walk_col(RESOURCE_TYPE).is_in(self.steps.iter().map(|step| step.child_type.as_str())),
            )
            .to_owned()
    }
}

/// Inputs of a point check.
#[derive(Debug, Clone, Copy)]
pub struct PointParams<'a> {
    pub user_id: &'a str,
    pub resource_type: &'a str,
    pub resource_id: &'a str,
    /// Relevant roles for the requested permission; must be non-empty.
    pub roles: &'a BTreeSet<String>,
}

/// Does any ancestor of one instance (itself included) carry an assignment
/// of a relevant role for the user?
#[derive(Debug, Clone)]
pub struct PointCheck {
    walk: Arc<AncestorWalk>,
}

impl PointCheck {
    pub fn new(walk: Arc<AncestorWalk>) -> Self {
        Self { walk }
    }

    pub fn render(&self, backend: DbBackend, params: &PointParams<'_>) -> Statement {
        let mut select = Query::select();
        select
            .expr_as(col("ur", "role"), Alias::new("role"))
            .from_as(Alias::new(USER_ROLES), Alias::new("ur"));
        match_assignments(&mut select, params.user_id, params.roles);
        select.limit(1);

        let seed = Seed::Instance {
            resource_type: params.resource_type,
            resource_id: params.resource_id,
        };
        backend.build(&self.walk.with_clause(backend, seed).query(select))
    }
}

/// Table backing one resource type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterTarget {
    pub resource_type: String,
    pub table: String,
    pub id_column: String,
}

impl From<&ResourceType> for FilterTarget {
    fn from(res: &ResourceType) -> Self {
        Self {
            resource_type: res.name.clone(),
            table: res.table.clone(),
            id_column: res.id_column.clone(),
        }
    }
}

/// Inputs of a bulk filter.
#[derive(Debug, Clone, Copy)]
pub struct FilterParams<'a> {
    pub user_id: &'a str,
    /// Relevant roles for the requested permission; must be non-empty.
    pub roles: &'a BTreeSet<String>,
}

/// Every instance of one resource type the user is authorized on, computed as
/// one set query: the walk is seeded with all instances at once and the
/// origins that reach a matching assignment are returned.
#[derive(Debug, Clone)]
pub struct BulkFilter {
    walk: Arc<AncestorWalk>,
    target: FilterTarget,
}

impl BulkFilter {
    pub fn new(walk: Arc<AncestorWalk>, target: FilterTarget) -> Self {
        Self { walk, target }
    }

    pub fn resource_type(&self) -> &str {
        &self.target.resource_type
    }

    pub fn render(&self, backend: DbBackend, params: &FilterParams<'_>) -> Statement {
        let mut select = Query::select();
        select
            .distinct()
            .expr_as(walk_col(ORIGIN), Alias::new(RESOURCE_ID))
            .from_as(Alias::new(USER_ROLES), Alias::new("ur"));
        match_assignments(&mut select, params.user_id, params.roles);
        select.order_by((Alias::new(WALK), Alias::new(ORIGIN)), Order::Asc);

        let seed = Seed::AllOf {
            target: &self.target,
        };
        backend.build(&self.walk.with_clause(backend, seed).query(select))
    }
}

/// Join `user_roles ur` to the walk and keep the user's relevant assignments.
fn match_assignments(select: &mut SelectStatement, user_id: &str, roles: &BTreeSet<String>) {
    select
        .join(
            JoinType::InnerJoin,
            Alias::new(WALK),
            Condition::all()
                .add(col("ur", RESOURCE_TYPE).equals((Alias::new(WALK), Alias::new(RESOURCE_TYPE))))
                .add(col("ur", RESOURCE_ID).equals((Alias::new(WALK), Alias::new(RESOURCE_ID)))),
        )
        .and_where(col("ur", "user_id").eq(user_id))
        .and_where(col("ur", "role").is_in(roles.iter().map(String::as_str)));
}

fn col(table: &str, column: &str) -> Expr {
    Expr::col((Alias::new(table), Alias::new(column)))
}

fn walk_col(column: &str) -> Expr {
    col(WALK, column)
}

/// Key columns may be INTEGER, the walk compares them as text. MySQL casts
/// to `CHAR` instead of `TEXT`.
fn as_text(expr: impl Into<SimpleExpr>, backend: DbBackend) -> SimpleExpr {
    let text = match backend {
        DbBackend::MySql => "CHAR",
        _ => "TEXT",
    };
    Expr::expr(expr).cast_as(Alias::new(text))
}
