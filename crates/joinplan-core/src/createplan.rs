//! # Plan Emission
//!
//! [`create_plan`] turns the chosen path tree into the executor's [`Plan`]
//! tree. Each path becomes one plan node, with a few additions:
//!
//! * hash joins get a `Hash` node over their inner input;
//! * merge joins get explicit `Sort` nodes over inputs that need sorting and a
//!   `Material` node over an inner side that must support mark/restore;
//! * pseudoconstant quals become a gating `Result` node above the node that
//!   would otherwise have evaluated them.
//!
//! ## Nest-loop Parameters
//!
//! A parameterized inner scan references columns of rels on the outer side of
//! some nest loop above it. While its quals are emitted those references are
//! replaced by `PARAM_EXEC` params and queued in
//! [`PlannerInfo::cur_outer_params`]; the first nest loop whose outer side
//! supplies them claims them as its `nest_params`.

use crate::equivalence::find_ec_member_for_relids;
use crate::error::{PlanError, Result};
use crate::expr::{expression_tree_mutator, Expr};
use crate::path::{PathKind, SortDirection};
use crate::params::{identify_current_nestloop_params, replace_nestloop_param_placeholdervar, replace_nestloop_param_var};
use crate::pathnode::create_sort_path;
use crate::planner_info::{NestLoopParam, PathId, PathKeyId, PlannerInfo, RelId, RinfoId};
use crate::query::JoinType;
use crate::relids::{Index, Relids};
use crate::restrictinfo::{extract_actual_clauses, extract_actual_join_clauses};
use serde::Serialize;
use std::fmt;

/// One sort column of a `Sort` node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SortKey {
    pub expr: Expr,
    pub descending: bool,
    pub nulls_first: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum PlanNode {
    SeqScan {
        scanrelid: Index,
        alias: String,
    },
    IndexScan {
        scanrelid: Index,
        alias: String,
        indexoid: u32,
        indexqual: Vec<Expr>,
    },
    SubqueryScan {
        scanrelid: Index,
        alias: String,
    },
    Append,
    /// Evaluates `resconstantqual` once; with no child it emits at most one
    /// row, otherwise it passes its child's rows through when the qual holds.
    Result {
        resconstantqual: Vec<Expr>,
    },
    Material,
    Sort {
        keys: Vec<SortKey>,
    },
    Hash,
    NestLoop {
        jointype: JoinType,
        joinqual: Vec<Expr>,
        nest_params: Vec<NestLoopParam>,
    },
    MergeJoin {
        jointype: JoinType,
        joinqual: Vec<Expr>,
        mergeclauses: Vec<Expr>,
        skip_mark_restore: bool,
    },
    HashJoin {
        jointype: JoinType,
        joinqual: Vec<Expr>,
        hashclauses: Vec<Expr>,
    },
}

/// Executor plan tree.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Plan {
    pub node: PlanNode,
    pub startup_cost: f64,
    pub total_cost: f64,
    pub rows: f64,
    pub width: i32,
    /// Filter applied to the node's output rows.
    pub qual: Vec<Expr>,
    /// Inputs, outer first.
    pub children: Vec<Plan>,
}

impl Plan {
    fn leaf(node: PlanNode, startup_cost: f64, total_cost: f64, rows: f64, width: i32) -> Self {
        Self {
            node,
            startup_cost,
            total_cost,
            rows,
            width,
            qual: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Wraps `child` in a node with the same costs and row count.
    fn over(node: PlanNode, child: Plan) -> Self {
        Self {
            node,
            startup_cost: child.startup_cost,
            total_cost: child.total_cost,
            rows: child.rows,
            width: child.width,
            qual: Vec::new(),
            children: vec![child],
        }
    }

    pub fn name(&self) -> &'static str {
        match &self.node {
            PlanNode::SeqScan { .. } => "SeqScan",
            PlanNode::IndexScan { .. } => "IndexScan",
            PlanNode::SubqueryScan { .. } => "SubqueryScan",
            PlanNode::Append => "Append",
            PlanNode::Result { .. } => "Result",
            PlanNode::Material => "Material",
            PlanNode::Sort { .. } => "Sort",
            PlanNode::Hash => "Hash",
            PlanNode::NestLoop { .. } => "NestLoop",
            PlanNode::MergeJoin { .. } => "MergeJoin",
            PlanNode::HashJoin { .. } => "HashJoin",
        }
    }

    /// Pre-order iteration over the tree.
    pub fn iter(&self) -> impl Iterator<Item = &Plan> {
        let mut stack = vec![self];
        std::iter::from_fn(move || {
            let next = stack.pop()?;
            stack.extend(next.children.iter().rev());
            Some(next)
        })
    }

    /// Indented rendering, one node per line followed by its conditions.
    pub fn display(&self, indent: usize) -> String {
        let mut out = String::new();
        self.render(indent, false, &mut out);
        out
    }

    fn render(&self, indent: usize, arrow: bool, out: &mut String) {
        let pad = "  ".repeat(indent);
        let target = match &self.node {
            PlanNode::SeqScan { alias, .. } | PlanNode::SubqueryScan { alias, .. } => format!(" on {alias}"),
            PlanNode::IndexScan { alias, indexoid, .. } => format!(" using {indexoid} on {alias}"),
            PlanNode::NestLoop { jointype, .. }
            | PlanNode::MergeJoin { jointype, .. }
            | PlanNode::HashJoin { jointype, .. }
                if *jointype != JoinType::Inner =>
            {
                format!(" {jointype:?}")
            }
            _ => String::new(),
        };
        out.push_str(&format!(
            "{pad}{}{}{target} (cost={:.2}..{:.2} rows={:.0} width={})\n",
            if arrow { "-> " } else { "" },
            self.name(),
            self.startup_cost,
            self.total_cost,
            self.rows,
            self.width
        ));

        let detail_pad = if arrow { format!("{pad}     ") } else { format!("{pad}  ") };
        let mut detail = |label: &str, exprs: &[Expr]| {
            if !exprs.is_empty() {
                let text: Vec<String> = exprs.iter().map(|e| e.to_string()).collect();
                out.push_str(&format!("{detail_pad}{label}: {}\n", text.join(" AND ")));
            }
        };
        match &self.node {
            PlanNode::IndexScan { indexqual, .. } => detail("Index Cond", indexqual),
            PlanNode::Result { resconstantqual } => detail("One-Time Filter", resconstantqual),
            PlanNode::Sort { keys } => {
                let exprs: Vec<Expr> = keys.iter().map(|k| k.expr.clone()).collect();
                detail("Sort Key", &exprs);
            }
            PlanNode::NestLoop { joinqual, .. } => detail("Join Filter", joinqual),
            PlanNode::MergeJoin {
                joinqual, mergeclauses, ..
            } => {
                detail("Merge Cond", mergeclauses);
                detail("Join Filter", joinqual);
            }
            PlanNode::HashJoin {
                joinqual, hashclauses, ..
            } => {
                detail("Hash Cond", hashclauses);
                detail("Join Filter", joinqual);
            }
            _ => {}
        }
        detail("Filter", &self.qual);

        let child_indent = if arrow { indent + 2 } else { indent + 1 };
        for child in &self.children {
            child.render(child_indent, true, out);
        }
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display(0))
    }
}

/// Converts the path tree rooted at `best_path` into a plan tree.
pub fn create_plan(root: &mut PlannerInfo, best_path: PathId) -> Result<Plan> {
    root.cur_outer_params.clear();
    let plan = create_plan_recurse(root, best_path)?;
    if !root.cur_outer_params.is_empty() {
        return Err(PlanError::InvalidInput(format!(
            "{} nest-loop parameters were not supplied by any outer rel",
            root.cur_outer_params.len()
        )));
    }
    Ok(plan)
}

fn create_plan_recurse(root: &mut PlannerInfo, path_id: PathId) -> Result<Plan> {
    root.check_for_interrupts()?;
    let path = root.path(path_id).clone();
    let rel = root.rel(path.parent);
    let width = rel.reltarget.width;
    let relid = rel.relid;
    let alias = rel.alias.clone();
    let (startup, total, rows) = (path.startup_cost, path.total_cost, path.rows);

    match &path.kind {
        PathKind::SeqScan => {
            let node = PlanNode::SeqScan {
                scanrelid: relid,
                alias,
            };
            create_scan_plan(root, path_id, Plan::leaf(node, startup, total, rows, width), &[])
        }
        PathKind::SubqueryScan => {
            let node = PlanNode::SubqueryScan {
                scanrelid: relid,
                alias,
            };
            create_scan_plan(root, path_id, Plan::leaf(node, startup, total, rows, width), &[])
        }
        PathKind::IndexScan { index, indexclauses } => {
            let outer = path.req_outer();
            let indexqual = indexclauses
                .iter()
                .map(|id| {
                    let clause = root.rinfo(*id).clause.clone();
                    replace_nestloop_params(root, clause, &outer)
                })
                .collect();
            let node = PlanNode::IndexScan {
                scanrelid: relid,
                alias,
                indexoid: index.indexoid,
                indexqual,
            };
            let plan = Plan::leaf(node, startup, total, rows, width);
            create_scan_plan(root, path_id, plan, indexclauses)
        }
        PathKind::Result => {
            // only dummy rels have Result paths
            let node = PlanNode::Result {
                resconstantqual: vec![Expr::bool_const(false)],
            };
            Ok(Plan::leaf(node, startup, total, rows, width))
        }
        PathKind::Append { subpaths } => {
            let children = subpaths
                .iter()
                .map(|sub| create_plan_recurse(root, *sub))
                .collect::<Result<Vec<_>>>()?;
            let mut plan = Plan::leaf(PlanNode::Append, startup, total, rows, width);
            plan.children = children;
            Ok(plan)
        }
        PathKind::Material { subpath } => {
            let child = create_plan_recurse(root, *subpath)?;
            let mut plan = Plan::over(PlanNode::Material, child);
            (plan.startup_cost, plan.total_cost) = (startup, total);
            Ok(plan)
        }
        PathKind::Sort { subpath } => {
            let child = create_plan_recurse(root, *subpath)?;
            let keys = make_sort_keys(root, &path.pathkeys, path.parent)?;
            let mut plan = Plan::over(PlanNode::Sort { keys }, child);
            (plan.startup_cost, plan.total_cost) = (startup, total);
            Ok(plan)
        }
        PathKind::NestLoop(join) => {
            let outer_relids = root.rel(root.path(join.outerjoinpath).parent).relids.clone();
            let outer = create_plan_recurse(root, join.outerjoinpath)?;
            let inner = create_plan_recurse(root, join.innerjoinpath)?;
            let nest_params = identify_current_nestloop_params(root, &outer_relids);
            let (joinqual, qual, gating) = join_quals(root, path_id, &join.joinrestrictinfo, &[], join.jointype);
            let node = PlanNode::NestLoop {
                jointype: join.jointype,
                joinqual,
                nest_params,
            };
            let mut plan = Plan::leaf(node, startup, total, rows, width);
            plan.qual = qual;
            plan.children = vec![outer, inner];
            Ok(gate(plan, gating))
        }
        PathKind::MergeJoin {
            join,
            mergeclauses,
            outersortkeys,
            innersortkeys,
            skip_mark_restore,
            materialize_inner,
        } => {
            let mut outer = create_plan_recurse(root, join.outerjoinpath)?;
            let mut inner = create_plan_recurse(root, join.innerjoinpath)?;
            if !outersortkeys.is_empty() {
                outer = make_sort(root, outer, outersortkeys, join.outerjoinpath)?;
            }
            if !innersortkeys.is_empty() {
                inner = make_sort(root, inner, innersortkeys, join.innerjoinpath)?;
            }
            if *materialize_inner {
                inner = Plan::over(PlanNode::Material, inner);
            }
            let merge_exprs = mergeclauses.iter().map(|id| root.rinfo(*id).clause.clone()).collect();
            let (joinqual, qual, gating) =
                join_quals(root, path_id, &join.joinrestrictinfo, mergeclauses, join.jointype);
            let node = PlanNode::MergeJoin {
                jointype: join.jointype,
                joinqual,
                mergeclauses: merge_exprs,
                skip_mark_restore: *skip_mark_restore,
            };
            let mut plan = Plan::leaf(node, startup, total, rows, width);
            plan.qual = qual;
            plan.children = vec![outer, inner];
            Ok(gate(plan, gating))
        }
        PathKind::HashJoin { join, hashclauses, .. } => {
            let outer = create_plan_recurse(root, join.outerjoinpath)?;
            let inner = Plan::over(PlanNode::Hash, create_plan_recurse(root, join.innerjoinpath)?);
            let hash_exprs = hashclauses.iter().map(|id| root.rinfo(*id).clause.clone()).collect();
            let (joinqual, qual, gating) = join_quals(root, path_id, &join.joinrestrictinfo, hashclauses, join.jointype);
            let node = PlanNode::HashJoin {
                jointype: join.jointype,
                joinqual,
                hashclauses: hash_exprs,
            };
            let mut plan = Plan::leaf(node, startup, total, rows, width);
            plan.qual = qual;
            plan.children = vec![outer, inner];
            Ok(gate(plan, gating))
        }
    }
}

/// Attaches the scan's filter: the rel's restrictions plus, for a
/// parameterized path, the join clauses moved down to it, minus those
/// already used as index conditions.
fn create_scan_plan(root: &mut PlannerInfo, path_id: PathId, mut plan: Plan, used: &[RinfoId]) -> Result<Plan> {
    let path = root.path(path_id);
    let outer = path.req_outer();
    let mut clauses: Vec<RinfoId> = root.rel(path.parent).baserestrictinfo.clone();
    if let Some(ppi) = &path.param_info {
        clauses.extend(ppi.clauses.iter().copied());
    }
    clauses.retain(|id| !used.contains(id));

    let rinfos: Vec<_> = clauses.iter().map(|id| root.rinfo(*id)).collect();
    let qual = extract_actual_clauses(rinfos.iter().copied(), false);
    let gating = extract_actual_clauses(rinfos.iter().copied(), true);
    plan.qual = qual
        .into_iter()
        .map(|clause| replace_nestloop_params(root, clause, &outer))
        .collect();
    Ok(gate(plan, gating))
}

/// Join conditions, post-join filters and pseudoconstant gating quals of a
/// join, leaving out the clauses the join method consumes itself.
fn join_quals(
    root: &PlannerInfo,
    path_id: PathId,
    restrictinfo: &[RinfoId],
    consumed: &[RinfoId],
    jointype: JoinType,
) -> (Vec<Expr>, Vec<Expr>, Vec<Expr>) {
    let joinrelids = &root.rel(root.path(path_id).parent).relids;
    let rinfos: Vec<_> = restrictinfo
        .iter()
        .filter(|id| !consumed.contains(id))
        .map(|id| root.rinfo(*id))
        .collect();
    let gating = extract_actual_clauses(rinfos.iter().copied(), true);
    if jointype.is_outer() {
        let (joinqual, otherqual) = extract_actual_join_clauses(rinfos.iter().copied(), joinrelids);
        (joinqual, otherqual, gating)
    } else {
        (extract_actual_clauses(rinfos.iter().copied(), false), Vec::new(), gating)
    }
}

fn gate(plan: Plan, resconstantqual: Vec<Expr>) -> Plan {
    if resconstantqual.is_empty() {
        return plan;
    }
    Plan::over(PlanNode::Result { resconstantqual }, plan)
}

fn make_sort(root: &PlannerInfo, child: Plan, pathkeys: &[PathKeyId], input: PathId) -> Result<Plan> {
    let keys = make_sort_keys(root, pathkeys, root.path(input).parent)?;
    let sort_path = create_sort_path(root, root.path(input).parent, input, pathkeys.to_vec());
    let mut plan = Plan::over(PlanNode::Sort { keys }, child);
    plan.startup_cost = sort_path.startup_cost;
    plan.total_cost = sort_path.total_cost;
    Ok(plan)
}

/// Sort columns for `pathkeys`, each taken from the equivalence member that
/// the rel can compute.
fn make_sort_keys(root: &PlannerInfo, pathkeys: &[PathKeyId], rel: RelId) -> Result<Vec<SortKey>> {
    let relids = &root.rel(rel).relids;
    pathkeys
        .iter()
        .map(|pk_id| {
            let pk = root.pathkey(*pk_id);
            let member = find_ec_member_for_relids(root, pk.ec, relids)
                .map(|i| root.ec(pk.ec).ec_members[i].em_expr.clone())
                .or_else(|| {
                    root.ec(pk.ec)
                        .ec_members
                        .iter()
                        .find(|em| em.em_is_const)
                        .map(|em| em.em_expr.clone())
                });
            let expr = member.ok_or_else(|| {
                PlanError::InvalidInput(format!("could not find sort column for rel {relids}"))
            })?;
            Ok(SortKey {
                expr,
                descending: pk.direction == SortDirection::Desc,
                nulls_first: pk.nulls_first,
            })
        })
        .collect()
}

/// Replaces references to `outer` rels by nest-loop params.
fn replace_nestloop_params(root: &mut PlannerInfo, expr: Expr, outer: &Relids) -> Expr {
    if outer.is_empty() {
        return expr;
    }
    expression_tree_mutator(expr, &mut |node| match &node {
        Expr::Var(var) if var.varlevelsup == 0 && outer.contains(var.varno) => {
            replace_nestloop_param_var(root, var)
        }
        Expr::PlaceHolderVar(phv)
            if phv.phlevelsup == 0
                && root
                    .placeholder_list
                    .iter()
                    .find(|info| info.phid == phv.phid)
                    .is_some_and(|info| info.ph_eval_at.is_subset(outer)) =>
        {
            replace_nestloop_param_placeholdervar(root, phv)
        }
        _ => node,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::oids;

    fn scan(alias: &str, rows: f64, total: f64) -> Plan {
        Plan::leaf(
            PlanNode::SeqScan {
                scanrelid: 1,
                alias: alias.into(),
            },
            0.0,
            total,
            rows,
            8,
        )
    }

    #[test]
    fn test_display_indents_children() {
        let outer = scan("a", 100.0, 10.0);
        let inner = Plan::over(PlanNode::Hash, scan("b", 10.0, 2.0));
        let clause = Expr::op(oids::INT4EQ, Expr::int4_var(1, 1), Expr::int4_var(2, 1));
        let mut join = Plan::leaf(
            PlanNode::HashJoin {
                jointype: JoinType::Inner,
                joinqual: Vec::new(),
                hashclauses: vec![clause],
            },
            2.0,
            14.0,
            100.0,
            16,
        );
        join.children = vec![outer, inner];

        let text = join.to_string();
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[0].starts_with("HashJoin (cost=2.00..14.00 rows=100 width=16)"));
        assert_eq!(lines[1], "  Hash Cond: 1.1 = 2.1");
        assert!(lines[2].starts_with("  -> SeqScan on a"));
        assert!(lines[3].starts_with("  -> Hash"));
        assert!(lines[4].starts_with("      -> SeqScan on b"));
    }

    #[test]
    fn test_iter_visits_preorder() {
        let mut top = Plan::over(PlanNode::Material, scan("a", 1.0, 1.0));
        top.children.push(scan("b", 1.0, 1.0));
        let names: Vec<&str> = top.iter().map(Plan::name).collect();
        assert_eq!(names, vec!["Material", "SeqScan", "SeqScan"]);
    }

    #[test]
    fn test_gate_only_wraps_with_quals() {
        let plain = gate(scan("a", 1.0, 1.0), Vec::new());
        assert_eq!(plain.name(), "SeqScan");
        let gated = gate(scan("a", 1.0, 1.0), vec![Expr::bool_const(true)]);
        assert_eq!(gated.name(), "Result");
        assert_eq!(gated.children.len(), 1);
    }

    #[test]
    fn test_plan_serializes() {
        let json = serde_json::to_value(scan("a", 5.0, 1.5)).unwrap();
        assert_eq!(json["node"]["SeqScan"]["alias"], "a");
        assert_eq!(json["rows"], 5.0);
    }
}
