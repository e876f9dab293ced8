use ethers::types::{Address, H256};
use sea_orm::prelude::TimeDateTime;

use crate::{Confirmations, Cursor};

/// Comparison applied by a primitive expression.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Comparator {
    /// `=`
    Eq,
    /// `!=`
    Neq,
    /// `<`
    Lt,
    /// `<=`
    Lte,
    /// `>`
    Gt,
    /// `>=`
    Gte,
}

impl Comparator {
    /// SQL operator
    pub fn as_sql(&self) -> &'static str {
        match self {
            Comparator::Eq => "=",
            Comparator::Neq => "!=",
            Comparator::Lt => "<",
            Comparator::Lte => "<=",
            Comparator::Gt => ">",
            Comparator::Gte => ">=",
        }
    }

    /// Apply to two ordered values, `lhs op rhs`.
    pub fn compare<T: Ord>(&self, lhs: &T, rhs: &T) -> bool {
        match self {
            Comparator::Eq => lhs == rhs,
            Comparator::Neq => lhs != rhs,
            Comparator::Lt => lhs < rhs,
            Comparator::Lte => lhs <= rhs,
            Comparator::Gt => lhs > rhs,
            Comparator::Gte => lhs >= rhs,
        }
    }
}

/// A log filter expression. Evaluated against the stored logs of one chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Expression {
    /// All sub-expressions hold, true when empty
    And(Vec<Expression>),
    /// Any sub-expression holds, false when empty
    Or(Vec<Expression>),
    /// Emitted by this contract
    Address(Address),
    /// Topic 0 equals this
    EventSig(H256),
    /// Indexed topic at `index` (1..=3) compared with `value`
    Topic {
        /// Topic position
        index: usize,
        /// Comparison
        op: Comparator,
        /// Right hand side
        value: H256,
    },
    /// 32 byte data word at `index` compared with `value`
    DataWord {
        /// Word position, 0 based
        index: usize,
        /// Comparison
        op: Comparator,
        /// Right hand side
        value: H256,
    },
    /// Block number compared with `number`
    Block {
        /// Right hand side
        number: u64,
        /// Comparison
        op: Comparator,
    },
    /// Block timestamp compared with `at`
    Timestamp {
        /// Right hand side
        at: TimeDateTime,
        /// Comparison
        op: Comparator,
    },
    /// Row creation time compared with `at`
    CreatedAt {
        /// Right hand side
        at: TimeDateTime,
        /// Comparison
        op: Comparator,
    },
    /// Emitted by this transaction
    TxHash(H256),
    /// Deep enough below the latest saved block
    Confirmations(Confirmations),
}

impl Expression {
    /// Logs of any of `event_sigs`.
    pub fn event_sigs(event_sigs: &[H256]) -> Self {
        Expression::Or(event_sigs.iter().copied().map(Expression::EventSig).collect())
    }

    /// Logs of any of `addresses`.
    pub fn addresses(addresses: &[Address]) -> Self {
        Expression::Or(addresses.iter().copied().map(Expression::Address).collect())
    }

    /// Logs whose topic at `index` equals any of `values`.
    pub fn topic_in(index: usize, values: &[H256]) -> Self {
        Expression::Or(
            values
                .iter()
                .map(|value| Expression::Topic {
                    index,
                    op: Comparator::Eq,
                    value: *value,
                })
                .collect(),
        )
    }

    /// Logs in the inclusive block range.
    pub fn block_range(start: u64, end: u64) -> Self {
        Expression::And(vec![
            Expression::Block {
                number: start,
                op: Comparator::Gte,
            },
            Expression::Block {
                number: end,
                op: Comparator::Lte,
            },
        ])
    }

    /// Walk the tree, yielding every topic index used.
    pub fn topic_indices(&self) -> Vec<usize> {
        match self {
            Expression::And(exprs) | Expression::Or(exprs) => {
                exprs.iter().flat_map(Expression::topic_indices).collect()
            }
            Expression::Topic { index, .. } => vec![*index],
            _ => vec![],
        }
    }
}

/// Sort direction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SortDirection {
    /// Ascending
    #[default]
    Asc,
    /// Descending
    Desc,
}

/// Ordering of query results.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortBy {
    /// By block number
    Block(SortDirection),
    /// By block timestamp
    Timestamp(SortDirection),
    /// By `(block_number, tx_hash, log_index)`
    Sequence(SortDirection),
}

/// Cursor based page request. Results continue after `cursor` in
/// `direction` and are ordered by sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Limit {
    /// Maximum rows
    pub count: u64,
    /// Last row of the previous page
    pub cursor: Option<Cursor>,
    /// Paging direction
    pub direction: SortDirection,
}

/// Ordering and paging of a query. Without any ordering, results come in
/// ascending `(block_number, log_index)` order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LimitAndSort {
    /// Orderings applied in turn
    pub sort_by: Vec<SortBy>,
    /// Page request
    pub limit: Option<Limit>,
}

impl LimitAndSort {
    /// Order by `sort_by`, no paging.
    pub fn sorted(sort_by: impl IntoIterator<Item = SortBy>) -> Self {
        Self {
            sort_by: sort_by.into_iter().collect(),
            limit: None,
        }
    }

    /// First `count` rows.
    pub fn with_count(mut self, count: u64) -> Self {
        self.limit = Some(Limit {
            count,
            cursor: None,
            direction: SortDirection::Asc,
        });
        self
    }

    /// `count` rows after `cursor` going in `direction`.
    pub fn with_cursor(mut self, cursor: Cursor, direction: SortDirection, count: u64) -> Self {
        self.limit = Some(Limit {
            count,
            cursor: Some(cursor),
            direction,
        });
        self
    }
}
