use sea_orm_migration::prelude::*;

/// Hashes are to be stored as binary.
#[allow(non_upper_case_globals)]
pub const Hash: ColumnType = ColumnType::Blob;
/// Addresses are to be stored as binary.
#[allow(non_upper_case_globals)]
pub const Address: ColumnType = ColumnType::Blob;
/// Raw event payloads.
#[allow(non_upper_case_globals)]
pub const Bytes: ColumnType = ColumnType::Blob;
