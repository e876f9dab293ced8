//! Translation of query expressions into sea-query conditions on the log
//! table.

use sea_orm::sea_query::{Expr, SimpleExpr};
use sea_orm::{prelude::*, Condition, Order, QueryOrder, QuerySelect, Select, Value};

use super::generated::log;
use crate::conversions::{address_to_bytes, h256_to_bytes, u64_to_db};
use crate::db::{DbError, DbResult};
use crate::query::{Comparator, Expression, LimitAndSort, SortBy, SortDirection};
use crate::Confirmations;

/// All of `exprs` must hold.
pub(super) fn expressions_condition(exprs: &[Expression], chain_id: i64) -> DbResult<Condition> {
    exprs.iter().try_fold(Condition::all(), |cond, expr| {
        Ok(cond.add(condition(expr, chain_id)?))
    })
}

fn condition(expr: &Expression, chain_id: i64) -> DbResult<Condition> {
    let simple = match expr {
        Expression::And(exprs) => return expressions_condition(exprs, chain_id),
        Expression::Or(exprs) => {
            return exprs.iter().try_fold(Condition::any(), |cond, expr| {
                Ok(cond.add(condition(expr, chain_id)?))
            })
        }
        Expression::Address(address) => log::Column::Address.eq(address_to_bytes(address)),
        Expression::EventSig(sig) => log::Column::EventSig.eq(h256_to_bytes(sig)),
        Expression::Topic { index, op, value } => {
            if !(1..=3).contains(index) {
                return Err(DbError::InvalidQuery(format!("topic index {index}")));
            }
            // postgres arrays are 1 based
            Expr::cust_with_values(
                format!("topics[{}] {} $1", index + 1, op.as_sql()),
                [h256_to_bytes(value)],
            )
        }
        Expression::DataWord { index, op, value } => Expr::cust_with_values(
            format!(
                "substring(data from {} for 32) {} $1",
                index * 32 + 1,
                op.as_sql()
            ),
            [h256_to_bytes(value)],
        ),
        Expression::Block { number, op } => {
            compare(log::Column::BlockNumber, *op, u64_to_db(*number))
        }
        Expression::Timestamp { at, op } => compare(log::Column::BlockTimestamp, *op, *at),
        Expression::CreatedAt { at, op } => compare(log::Column::TimeCreated, *op, *at),
        Expression::TxHash(hash) => log::Column::TxHash.eq(h256_to_bytes(hash)),
        Expression::Confirmations(confs) => match confs {
            Confirmations::Unconfirmed => return Ok(Condition::all()),
            Confirmations::Finalized => Expr::cust_with_values(
                "block_number <= (SELECT finalized_block_number FROM log_poller_block \
                 WHERE evm_chain_id = $1 ORDER BY block_number DESC LIMIT 1)",
                [chain_id],
            ),
            Confirmations::Blocks(n) => Expr::cust_with_values(
                "block_number <= (SELECT block_number - $1 FROM log_poller_block \
                 WHERE evm_chain_id = $2 ORDER BY block_number DESC LIMIT 1)",
                [u64_to_db(*n), chain_id],
            ),
        },
    };
    Ok(Condition::all().add(simple))
}

fn compare<V: Into<Value>>(column: log::Column, op: Comparator, value: V) -> SimpleExpr {
    match op {
        Comparator::Eq => column.eq(value),
        Comparator::Neq => column.ne(value),
        Comparator::Lt => column.lt(value),
        Comparator::Lte => column.lte(value),
        Comparator::Gt => column.gt(value),
        Comparator::Gte => column.gte(value),
    }
}

fn order(direction: SortDirection) -> Order {
    match direction {
        SortDirection::Asc => Order::Asc,
        SortDirection::Desc => Order::Desc,
    }
}

fn order_by_sequence(select: Select<log::Entity>, direction: SortDirection) -> Select<log::Entity> {
    select
        .order_by(log::Column::BlockNumber, order(direction))
        .order_by(log::Column::TxHash, order(direction))
        .order_by(log::Column::LogIndex, order(direction))
}

pub(super) fn apply_limit_and_sort(
    mut select: Select<log::Entity>,
    limit_and_sort: &LimitAndSort,
) -> Select<log::Entity> {
    let cursor = limit_and_sort.limit.and_then(|limit| {
        limit.cursor.map(|cursor| (cursor, limit.direction))
    });
    if let Some((cursor, direction)) = cursor {
        let op = match direction {
            SortDirection::Asc => Comparator::Gt,
            SortDirection::Desc => Comparator::Lt,
        };
        select = select.filter(Expr::cust_with_values(
            format!(
                "(block_number, tx_hash, log_index) {} ($1, $2, $3)",
                op.as_sql()
            ),
            [
                Value::from(u64_to_db(cursor.block_number)),
                Value::from(h256_to_bytes(&cursor.tx_hash)),
                Value::from(u64_to_db(cursor.log_index)),
            ],
        ));
        select = order_by_sequence(select, direction);
    }

    if limit_and_sort.sort_by.is_empty() && cursor.is_none() {
        select = select
            .order_by_asc(log::Column::BlockNumber)
            .order_by_asc(log::Column::LogIndex);
    }
    for sort in &limit_and_sort.sort_by {
        select = match *sort {
            SortBy::Block(direction) => select.order_by(log::Column::BlockNumber, order(direction)),
            SortBy::Timestamp(direction) => {
                select.order_by(log::Column::BlockTimestamp, order(direction))
            }
            SortBy::Sequence(direction) => order_by_sequence(select, direction),
        };
    }

    if let Some(limit) = limit_and_sort.limit {
        select = select.limit(limit.count);
    }
    select
}
