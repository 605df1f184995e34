//! # PARAM_EXEC Slots
//!
//! Values that cross plan-node boundaries at run time travel through
//! `PARAM_EXEC` slots. Two producers exist:
//!
//! - correlated references from a subquery to an outer query level (Vars,
//!   placeholders, aggregates and grouping functions of the outer level);
//! - nest loops passing outer-row values into a parameterized inner scan.
//!
//! Every slot is an index into [`PlannerGlobal::param_exec_types`]. Outer-level
//! Vars and placeholders are shared per level; aggregates and grouping
//! functions always get a new slot.

use crate::error::{PlanError, Result};
use crate::expr::{oids, Expr, Oid, Param, ParamKind, PlaceHolderVar, Var, INVALID_OID};
use crate::planner_info::{NestLoopParam, PlannerGlobal, PlannerInfo, PlannerParamItem};
use crate::relids::Relids;

fn vars_match(a: &Var, b: &Var) -> bool {
    a.varno == b.varno
        && a.varattno == b.varattno
        && a.vartype == b.vartype
        && a.vartypmod == b.vartypmod
        && a.varcollid == b.varcollid
}

fn exec_param(id: usize, paramtype: Oid) -> Expr {
    Expr::Param(Param {
        kind: ParamKind::Exec,
        id,
        paramtype,
    })
}

/// Allocates a new slot of the given type.
pub fn generate_new_exec_param(glob: &mut PlannerGlobal, paramtype: Oid) -> Expr {
    exec_param(new_exec_slot(glob, paramtype), paramtype)
}

fn new_exec_slot(glob: &mut PlannerGlobal, paramtype: Oid) -> usize {
    glob.param_exec_types.push(paramtype);
    glob.param_exec_types.len() - 1
}

/// Allocates a slot that carries no value, used only to signal rescans.
pub fn assign_special_exec_param(glob: &mut PlannerGlobal) -> usize {
    new_exec_slot(glob, INVALID_OID)
}

fn outer_level(root: &PlannerInfo, levelsup: u32) -> Result<u32> {
    if levelsup == 0 || levelsup >= root.query_level {
        return Err(PlanError::InvalidInput(format!(
            "reference {levelsup} levels up from query level {}",
            root.query_level
        )));
    }
    Ok(root.query_level - levelsup)
}

/// Slot for an outer-level Var, shared with earlier references to the same
/// column from the same level.
pub fn replace_outer_var(root: &mut PlannerInfo, var: &Var) -> Result<Expr> {
    let level = outer_level(root, var.varlevelsup)?;
    let mut local = var.clone();
    local.varlevelsup = 0;
    let existing = root
        .glob
        .level_params_mut(level)
        .iter()
        .find(|item| matches!(&item.item, Expr::Var(v) if vars_match(v, &local)))
        .map(|item| item.param_id);
    let param_id = match existing {
        Some(id) => id,
        None => {
            let id = new_exec_slot(&mut root.glob, var.vartype);
            root.glob.level_params_mut(level).push(PlannerParamItem {
                item: Expr::Var(local),
                param_id: id,
            });
            id
        }
    };
    Ok(exec_param(param_id, var.vartype))
}

/// Slot for an outer-level placeholder, shared per placeholder id.
pub fn replace_outer_placeholdervar(root: &mut PlannerInfo, phv: &PlaceHolderVar) -> Result<Expr> {
    let level = outer_level(root, phv.phlevelsup)?;
    let paramtype = phv.phexpr.type_oid();
    let existing = root
        .glob
        .level_params_mut(level)
        .iter()
        .find(|item| matches!(&item.item, Expr::PlaceHolderVar(p) if p.phid == phv.phid))
        .map(|item| item.param_id);
    let param_id = match existing {
        Some(id) => id,
        None => {
            let mut local = phv.clone();
            local.phlevelsup = 0;
            let id = new_exec_slot(&mut root.glob, paramtype);
            root.glob.level_params_mut(level).push(PlannerParamItem {
                item: Expr::PlaceHolderVar(local),
                param_id: id,
            });
            id
        }
    };
    Ok(exec_param(param_id, paramtype))
}

/// Slot for an outer-level aggregate. Never shared.
pub fn replace_outer_agg(root: &mut PlannerInfo, agg: &Expr) -> Result<Expr> {
    let Expr::Aggref {
        aggfnoid,
        aggtype,
        args,
        agglevelsup,
    } = agg
    else {
        return Err(PlanError::InvalidInput(format!("{agg} is not an aggregate")));
    };
    let level = outer_level(root, *agglevelsup)?;
    let id = new_exec_slot(&mut root.glob, *aggtype);
    let item = Expr::Aggref {
        aggfnoid: *aggfnoid,
        aggtype: *aggtype,
        args: args.clone(),
        agglevelsup: 0,
    };
    root.glob
        .level_params_mut(level)
        .push(PlannerParamItem { item, param_id: id });
    Ok(exec_param(id, *aggtype))
}

/// Slot for an outer-level GROUPING() call. Never shared.
pub fn replace_outer_grouping(root: &mut PlannerInfo, grp: &Expr) -> Result<Expr> {
    let Expr::GroupingFunc { args, agglevelsup } = grp else {
        return Err(PlanError::InvalidInput(format!("{grp} is not a grouping function")));
    };
    let level = outer_level(root, *agglevelsup)?;
    let id = new_exec_slot(&mut root.glob, oids::INT4OID);
    let item = Expr::GroupingFunc {
        args: args.clone(),
        agglevelsup: 0,
    };
    root.glob
        .level_params_mut(level)
        .push(PlannerParamItem { item, param_id: id });
    Ok(exec_param(id, oids::INT4OID))
}

/// Replaces every upper-level reference in `expr` with its slot.
pub fn replace_correlation_vars(root: &mut PlannerInfo, expr: Expr) -> Result<Expr> {
    let mut failure = None;
    let out = crate::expr::expression_tree_mutator(expr, &mut |node| {
        if failure.is_some() {
            return node;
        }
        let replaced = match &node {
            Expr::Var(v) if v.varlevelsup > 0 => Some(replace_outer_var(root, v)),
            Expr::PlaceHolderVar(p) if p.phlevelsup > 0 => Some(replace_outer_placeholdervar(root, p)),
            Expr::Aggref { agglevelsup, .. } if *agglevelsup > 0 => Some(replace_outer_agg(root, &node)),
            Expr::GroupingFunc { agglevelsup, .. } if *agglevelsup > 0 => {
                Some(replace_outer_grouping(root, &node))
            }
            _ => None,
        };
        match replaced {
            Some(Ok(param)) => param,
            Some(Err(e)) => {
                failure = Some(e);
                node
            }
            None => node,
        }
    });
    match failure {
        Some(e) => Err(e),
        None => Ok(out),
    }
}

/// Nest-loop parameter for an outer-side Var, reusing an existing one for the
/// same Var.
pub fn replace_nestloop_param_var(root: &mut PlannerInfo, var: &Var) -> Expr {
    let existing = root.cur_outer_params.iter().find(|nlp| {
        matches!(&nlp.paramval, Expr::Var(v) if vars_match(v, var) && v.varnullingrels == var.varnullingrels)
    });
    if let Some(nlp) = existing {
        return exec_param(nlp.paramno, var.vartype);
    }
    let id = new_exec_slot(&mut root.glob, var.vartype);
    root.cur_outer_params.push(NestLoopParam {
        paramno: id,
        paramval: Expr::Var(var.clone()),
    });
    exec_param(id, var.vartype)
}

/// Nest-loop parameter for an outer-side placeholder.
pub fn replace_nestloop_param_placeholdervar(root: &mut PlannerInfo, phv: &PlaceHolderVar) -> Expr {
    let paramtype = phv.phexpr.type_oid();
    let existing = root.cur_outer_params.iter().find(|nlp| {
        matches!(&nlp.paramval, Expr::PlaceHolderVar(p) if p.phid == phv.phid && p.phnullingrels == phv.phnullingrels)
    });
    if let Some(nlp) = existing {
        return exec_param(nlp.paramno, paramtype);
    }
    let id = new_exec_slot(&mut root.glob, paramtype);
    root.cur_outer_params.push(NestLoopParam {
        paramno: id,
        paramval: Expr::PlaceHolderVar(phv.clone()),
    });
    exec_param(id, paramtype)
}

/// Removes and returns the pending nest-loop parameters that the outer side
/// `leftrelids` can supply.
pub fn identify_current_nestloop_params(root: &mut PlannerInfo, leftrelids: &Relids) -> Vec<NestLoopParam> {
    let placeholders = &root.placeholder_list;
    let (mine, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut root.cur_outer_params)
        .into_iter()
        .partition(|nlp| match &nlp.paramval {
            Expr::Var(v) => leftrelids.contains(v.varno),
            Expr::PlaceHolderVar(p) => placeholders
                .iter()
                .find(|phinfo| phinfo.phid == p.phid)
                .is_some_and(|phinfo| phinfo.ph_eval_at.is_subset(leftrelids)),
            _ => false,
        });
    root.cur_outer_params = rest;
    mine
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::InMemoryCatalog;
    use crate::config::PlannerConfig;
    use crate::query::Query;
    use crate::relids;
    use std::sync::Arc;

    fn subquery_root(level: u32) -> PlannerInfo {
        let mut root = PlannerInfo::new(
            Query::new(),
            Arc::new(InMemoryCatalog::new()),
            PlannerConfig::default(),
        );
        root.query_level = level;
        root
    }

    fn upper_var(varno: usize, attno: i32, levelsup: u32) -> Var {
        let Expr::Var(mut v) = Expr::int4_var(varno, attno) else {
            unreachable!()
        };
        v.varlevelsup = levelsup;
        v
    }

    #[test]
    fn test_outer_vars_are_deduplicated_per_level() {
        let mut root = subquery_root(2);
        let a = replace_outer_var(&mut root, &upper_var(1, 1, 1)).unwrap();
        let b = replace_outer_var(&mut root, &upper_var(1, 1, 1)).unwrap();
        let c = replace_outer_var(&mut root, &upper_var(1, 2, 1)).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(root.glob.param_exec_types, vec![oids::INT4OID, oids::INT4OID]);
        assert_eq!(root.glob.plan_params[0].len(), 2);
    }

    #[test]
    fn test_outer_aggregates_are_not_deduplicated() {
        let mut root = subquery_root(2);
        let agg = Expr::Aggref {
            aggfnoid: 2147,
            aggtype: oids::INT8OID,
            args: vec![],
            agglevelsup: 1,
        };
        let a = replace_outer_agg(&mut root, &agg).unwrap();
        let b = replace_outer_agg(&mut root, &agg).unwrap();
        assert_ne!(a, b);
        assert_eq!(root.glob.param_exec_types, vec![oids::INT8OID, oids::INT8OID]);
    }

    #[test]
    fn test_grouping_param_is_int4() {
        let mut root = subquery_root(3);
        let grp = Expr::GroupingFunc {
            args: vec![],
            agglevelsup: 2,
        };
        replace_outer_grouping(&mut root, &grp).unwrap();
        assert_eq!(root.glob.param_exec_types, vec![oids::INT4OID]);
        assert_eq!(root.glob.plan_params[0].len(), 1);
    }

    #[test]
    fn test_reference_past_top_level_is_rejected() {
        let mut root = subquery_root(1);
        assert!(replace_outer_var(&mut root, &upper_var(1, 1, 1)).is_err());
    }

    #[test]
    fn test_special_param_has_invalid_type() {
        let mut glob = PlannerGlobal::new();
        generate_new_exec_param(&mut glob, oids::INT4OID);
        let id = assign_special_exec_param(&mut glob);
        assert_eq!(id, 1);
        assert_eq!(glob.param_exec_types[1], INVALID_OID);
    }

    #[test]
    fn test_replace_correlation_vars_rewrites_nested_refs() {
        let mut root = subquery_root(2);
        let expr = Expr::op(
            oids::INT4EQ,
            Expr::int4_var(1, 1),
            Expr::Var(upper_var(1, 1, 1)),
        );
        let out = replace_correlation_vars(&mut root, expr).unwrap();
        let (_, right) = out.binary_args().unwrap();
        assert!(matches!(right, Expr::Param(Param { kind: ParamKind::Exec, id: 0, .. })));
    }

    #[test]
    fn test_nestloop_params_are_claimed_by_outer_side() {
        let mut root = subquery_root(1);
        let Expr::Var(v1) = Expr::int4_var(1, 1) else { unreachable!() };
        let Expr::Var(v2) = Expr::int4_var(2, 1) else { unreachable!() };
        let p1 = replace_nestloop_param_var(&mut root, &v1);
        let again = replace_nestloop_param_var(&mut root, &v1);
        replace_nestloop_param_var(&mut root, &v2);
        assert_eq!(p1, again);
        let claimed = identify_current_nestloop_params(&mut root, &relids![1]);
        assert_eq!(claimed.len(), 1);
        assert_eq!(root.cur_outer_params.len(), 1);
    }
}
