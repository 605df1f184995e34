//! # Catalog Interface
//!
//! The catalog provides the planner with everything it needs to know about the
//! schema: relation sizes, indexes, NOT NULL columns, foreign keys, per-column
//! statistics and the properties of comparison operators.
//!
//! ## Trait Design
//!
//! `Catalog` lives behind a trait object (`Arc<dyn Catalog>`) so that different
//! backends can supply metadata. [`InMemoryCatalog`] is a HashMap-backed
//! implementation populated programmatically; it comes preloaded with the
//! integer and text comparison operators and their btree/hash families.
//!
//! ## Operator Properties
//!
//! A clause `a op b` can drive a merge join when `op` is the equality member of
//! at least one btree family (`mergejoin_opfamilies`), and a hash join when the
//! operator is `hashjoinable`. Equivalence classes are keyed by the same
//! families.

use crate::expr::{oids, AttrNumber, Expr, Oid};
use crate::stats::ColumnStatistics;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Btree strategy numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BtStrategy {
    Less,
    LessEqual,
    Equal,
    GreaterEqual,
    Greater,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorInfo {
    pub opno: Oid,
    pub name: String,
    pub left_type: Oid,
    pub right_type: Oid,
    pub commutator: Option<Oid>,
    pub negator: Option<Oid>,
    /// Btree families in which this operator is the equality member.
    pub mergejoin_opfamilies: Vec<Oid>,
    pub hashjoinable: bool,
    /// Family and strategy of the operator in its primary btree family.
    pub btree: Option<(Oid, BtStrategy)>,
    pub leakproof: bool,
}

impl OperatorInfo {
    pub fn is_equality(&self) -> bool {
        matches!(self.btree, Some((_, BtStrategy::Equal)))
    }

    pub fn is_inequality(&self) -> bool {
        matches!(
            self.btree,
            Some((
                _,
                BtStrategy::Less | BtStrategy::LessEqual | BtStrategy::Greater | BtStrategy::GreaterEqual
            ))
        )
    }
}

/// A btree index on a relation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexInfo {
    pub indexoid: Oid,
    /// Indexed columns, in key order.
    pub keys: Vec<AttrNumber>,
    /// Operator family of each key column.
    pub opfamilies: Vec<Oid>,
    pub unique: bool,
    /// Uniqueness is enforced immediately rather than deferred to commit.
    pub immediate: bool,
    /// Partial-index predicate, if any.
    pub predicate: Option<Expr>,
    pub pages: f64,
    pub tuples: f64,
    pub tree_height: u32,
}

impl IndexInfo {
    /// A unique, immediately-enforced btree index on the given integer columns.
    pub fn unique_btree(indexoid: Oid, keys: Vec<AttrNumber>, tuples: f64) -> Self {
        let opfamilies = vec![oids::INTEGER_BTREE_FAM; keys.len()];
        Self {
            indexoid,
            keys,
            opfamilies,
            unique: true,
            immediate: true,
            predicate: None,
            pages: (tuples / 300.0).ceil().max(1.0),
            tuples,
            tree_height: 2,
        }
    }

    /// A non-unique btree index on integer columns.
    pub fn btree(indexoid: Oid, keys: Vec<AttrNumber>, tuples: f64) -> Self {
        Self {
            unique: false,
            ..Self::unique_btree(indexoid, keys, tuples)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForeignKeyInfo {
    pub conkey: Vec<AttrNumber>,
    pub ref_relation: Oid,
    pub confkey: Vec<AttrNumber>,
    pub eq_ops: Vec<Oid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionStrategy {
    Range,
    List,
    Hash,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionInfo {
    pub strategy: PartitionStrategy,
    pub key_attrs: Vec<AttrNumber>,
    pub nparts: usize,
}

/// Everything the planner reads about a relation when building its base
/// RelOptInfo.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationInfo {
    pub pages: f64,
    pub tuples: f64,
    /// Fraction of pages marked all-visible.
    pub allvisfrac: f64,
    /// Highest user column number.
    pub max_attr: AttrNumber,
    /// Type of each column, indexed by `attno - 1`.
    pub attr_types: Vec<Oid>,
    pub indexes: Vec<IndexInfo>,
    pub notnull_attnums: Vec<AttrNumber>,
    pub foreign_keys: Vec<ForeignKeyInfo>,
    pub partitioning: Option<PartitionInfo>,
    pub column_stats: HashMap<AttrNumber, ColumnStatistics>,
}

impl RelationInfo {
    /// A heap of `tuples` rows over `ncols` integer columns, 100 rows per page.
    pub fn new(tuples: f64, ncols: AttrNumber) -> Self {
        Self {
            pages: (tuples / 100.0).ceil().max(1.0),
            tuples,
            allvisfrac: 0.0,
            max_attr: ncols,
            attr_types: vec![oids::INT4OID; ncols.max(0) as usize],
            indexes: Vec::new(),
            notnull_attnums: Vec::new(),
            foreign_keys: Vec::new(),
            partitioning: None,
            column_stats: HashMap::new(),
        }
    }

    pub fn with_index(mut self, index: IndexInfo) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn with_column_stats(mut self, attno: AttrNumber, stats: ColumnStatistics) -> Self {
        self.column_stats.insert(attno, stats);
        self
    }

    pub fn with_not_null(mut self, attno: AttrNumber) -> Self {
        self.notnull_attnums.push(attno);
        self
    }
}

/// Catalog provides schema, statistics and operator information.
pub trait Catalog: Send + Sync {
    fn get_relation_info(&self, relation: Oid) -> Option<RelationInfo>;

    fn get_operator(&self, opno: Oid) -> Option<OperatorInfo>;

    /// All operators known to the catalog, used by the default family lookup.
    fn operators(&self) -> Vec<OperatorInfo>;

    /// The member of `opfamily` with the given input types and strategy.
    fn get_opfamily_member(
        &self,
        opfamily: Oid,
        left_type: Oid,
        right_type: Oid,
        strategy: BtStrategy,
    ) -> Option<Oid> {
        self.operators()
            .into_iter()
            .filter(|op| op.left_type == left_type && op.right_type == right_type)
            .find(|op| op.btree == Some((opfamily, strategy)))
            .map(|op| op.opno)
    }

    /// Two equality operators agree on what "equal" means if they share a
    /// btree family.
    fn equality_ops_are_compatible(&self, op1: Oid, op2: Oid) -> bool {
        if op1 == op2 {
            return true;
        }
        match (self.get_operator(op1), self.get_operator(op2)) {
            (Some(a), Some(b)) => a
                .mergejoin_opfamilies
                .iter()
                .any(|f| b.mergejoin_opfamilies.contains(f)),
            _ => false,
        }
    }
}

/// In-memory catalog for testing and development.
#[derive(Debug, Clone)]
pub struct InMemoryCatalog {
    pub relations: HashMap<Oid, RelationInfo>,
    pub operators: HashMap<Oid, OperatorInfo>,
}

impl Default for InMemoryCatalog {
    fn default() -> Self {
        let mut catalog = Self {
            relations: HashMap::new(),
            operators: HashMap::new(),
        };
        catalog.add_builtin_operators();
        catalog
    }
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_relation(&mut self, relation: Oid, info: RelationInfo) {
        self.relations.insert(relation, info);
    }

    pub fn add_operator(&mut self, info: OperatorInfo) {
        self.operators.insert(info.opno, info);
    }

    fn add_builtin_operators(&mut self) {
        use oids::*;
        let comparisons: [(Oid, &str, Oid, Oid, Oid, Oid, BtStrategy, Option<Oid>); 14] = [
            (INT4EQ, "=", INT4OID, INT4OID, INTEGER_BTREE_FAM, INT4EQ, BtStrategy::Equal, Some(INT4NE)),
            (INT4NE, "<>", INT4OID, INT4OID, 0, INT4NE, BtStrategy::Equal, Some(INT4EQ)),
            (INT4LT, "<", INT4OID, INT4OID, INTEGER_BTREE_FAM, INT4GT, BtStrategy::Less, Some(INT4GE)),
            (INT4GT, ">", INT4OID, INT4OID, INTEGER_BTREE_FAM, INT4LT, BtStrategy::Greater, Some(INT4LE)),
            (INT4LE, "<=", INT4OID, INT4OID, INTEGER_BTREE_FAM, INT4GE, BtStrategy::LessEqual, Some(INT4GT)),
            (INT4GE, ">=", INT4OID, INT4OID, INTEGER_BTREE_FAM, INT4LE, BtStrategy::GreaterEqual, Some(INT4LT)),
            (INT8EQ, "=", INT8OID, INT8OID, INTEGER_BTREE_FAM, INT8EQ, BtStrategy::Equal, None),
            (INT8LT, "<", INT8OID, INT8OID, INTEGER_BTREE_FAM, INT8GT, BtStrategy::Less, None),
            (INT8GT, ">", INT8OID, INT8OID, INTEGER_BTREE_FAM, INT8LT, BtStrategy::Greater, None),
            (INT48EQ, "=", INT4OID, INT8OID, INTEGER_BTREE_FAM, INT84EQ, BtStrategy::Equal, None),
            (INT84EQ, "=", INT8OID, INT4OID, INTEGER_BTREE_FAM, INT48EQ, BtStrategy::Equal, None),
            (TEXTEQ, "=", TEXTOID, TEXTOID, TEXT_BTREE_FAM, TEXTEQ, BtStrategy::Equal, None),
            (TEXTLT, "<", TEXTOID, TEXTOID, TEXT_BTREE_FAM, TEXTGT, BtStrategy::Less, None),
            (TEXTGT, ">", TEXTOID, TEXTOID, TEXT_BTREE_FAM, TEXTLT, BtStrategy::Greater, None),
        ];
        for (opno, name, left, right, family, commutator, strategy, negator) in comparisons {
            let is_eq = family != 0 && strategy == BtStrategy::Equal;
            let hash_family = if family == TEXT_BTREE_FAM {
                TEXT_HASH_FAM
            } else {
                INTEGER_HASH_FAM
            };
            self.add_operator(OperatorInfo {
                opno,
                name: name.to_string(),
                left_type: left,
                right_type: right,
                commutator: Some(commutator),
                negator,
                mergejoin_opfamilies: if is_eq { vec![family] } else { Vec::new() },
                hashjoinable: is_eq && hash_family != 0,
                btree: (family != 0).then_some((family, strategy)),
                leakproof: true,
            });
        }
    }
}

impl Catalog for InMemoryCatalog {
    fn get_relation_info(&self, relation: Oid) -> Option<RelationInfo> {
        self.relations.get(&relation).cloned()
    }

    fn get_operator(&self, opno: Oid) -> Option<OperatorInfo> {
        self.operators.get(&opno).cloned()
    }

    fn operators(&self) -> Vec<OperatorInfo> {
        let mut ops: Vec<OperatorInfo> = self.operators.values().cloned().collect();
        ops.sort_by_key(|op| op.opno);
        ops
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_equality_is_mergejoinable() {
        let catalog = InMemoryCatalog::new();
        let eq = catalog.get_operator(oids::INT4EQ).unwrap();
        assert!(eq.is_equality());
        assert!(eq.hashjoinable);
        assert_eq!(eq.mergejoin_opfamilies, vec![oids::INTEGER_BTREE_FAM]);
        let lt = catalog.get_operator(oids::INT4LT).unwrap();
        assert!(lt.is_inequality());
        assert!(lt.mergejoin_opfamilies.is_empty());
        let ne = catalog.get_operator(oids::INT4NE).unwrap();
        assert!(!ne.is_equality());
    }

    #[test]
    fn test_opfamily_member_lookup() {
        let catalog = InMemoryCatalog::new();
        assert_eq!(
            catalog.get_opfamily_member(
                oids::INTEGER_BTREE_FAM,
                oids::INT4OID,
                oids::INT8OID,
                BtStrategy::Equal
            ),
            Some(oids::INT48EQ)
        );
        assert_eq!(
            catalog.get_opfamily_member(
                oids::TEXT_BTREE_FAM,
                oids::INT4OID,
                oids::INT4OID,
                BtStrategy::Equal
            ),
            None
        );
    }

    #[test]
    fn test_equality_compatibility() {
        let catalog = InMemoryCatalog::new();
        assert!(catalog.equality_ops_are_compatible(oids::INT4EQ, oids::INT8EQ));
        assert!(!catalog.equality_ops_are_compatible(oids::INT4EQ, oids::TEXTEQ));
    }

    #[test]
    fn test_relation_lookup() {
        let mut catalog = InMemoryCatalog::new();
        catalog.add_relation(
            1000,
            RelationInfo::new(5000.0, 3).with_index(IndexInfo::unique_btree(1001, vec![1], 5000.0)),
        );
        let info = catalog.get_relation_info(1000).unwrap();
        assert_eq!(info.pages, 50.0);
        assert!(info.indexes[0].unique);
        assert!(catalog.get_relation_info(1).is_none());
    }
}
