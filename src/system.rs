//! Virtual `system.local` / `system.peers` tables.
//!
//! Drivers introspect cluster topology by querying these tables right after
//! connecting. The proxy answers them from a row cache built once at startup
//! so that every client sees a single-node "cluster" (the proxy itself) no
//! matter what the backend looks like. `system.peers` is always empty.

use std::collections::HashMap;
use std::net::IpAddr;

use crate::cluster::ClusterInfo;
use crate::frame::{
    encode_inet, encode_int, encode_string_list, encode_uuid, encode_varchar, ColumnSpec, DataType,
    Row,
};
use crate::parse::Selector;

/// Fixed schema version reported to clients. The proxy does not track the
/// backend's real schema version.
pub const SCHEMA_VERSION_UUID: [u8; 16] = [
    0x4f, 0x2b, 0x29, 0xe6, 0x59, 0xb5, 0x4e, 0x2d, 0x8f, 0xd6, 0x01, 0xe3, 0x2e, 0x67, 0xf0, 0xd7,
]; // 4f2b29e6-59b5-4e2d-8fd6-01e32e67f0d7

/// Fixed host id for the proxy's virtual node.
pub const HOST_ID_UUID: [u8; 16] = [
    0x19, 0xe2, 0x69, 0x44, 0xff, 0xb1, 0x40, 0xa9, 0xa1, 0x84, 0xa9, 0xb0, 0x65, 0xe5, 0xe0, 0x6b,
]; // 19e26944-ffb1-40a9-a184-a9b065e5e06b

const CLUSTER_NAME: &str = "cqlgate";
const DATA_CENTER: &str = "dc1";
const RACK: &str = "rack1";

fn varchar_col(table: &str, name: &str) -> ColumnSpec {
    ColumnSpec::new("system", table, name, DataType::Varchar)
}

fn uuid_col(table: &str, name: &str) -> ColumnSpec {
    ColumnSpec::new("system", table, name, DataType::Uuid)
}

fn inet_col(table: &str, name: &str) -> ColumnSpec {
    ColumnSpec::new("system", table, name, DataType::Inet)
}

fn tokens_col(table: &str) -> ColumnSpec {
    ColumnSpec::new(
        "system",
        table,
        "tokens",
        DataType::List(Box::new(DataType::Varchar)),
    )
}

fn local_schema() -> Vec<ColumnSpec> {
    vec![
        varchar_col("local", "key"),
        varchar_col("local", "cluster_name"),
        varchar_col("local", "cql_version"),
        varchar_col("local", "data_center"),
        uuid_col("local", "host_id"),
        varchar_col("local", "native_protocol_version"),
        varchar_col("local", "partitioner"),
        varchar_col("local", "rack"),
        varchar_col("local", "release_version"),
        inet_col("local", "rpc_address"),
        uuid_col("local", "schema_version"),
        tokens_col("local"),
    ]
}

fn peers_schema() -> Vec<ColumnSpec> {
    vec![
        inet_col("peers", "peer"),
        varchar_col("peers", "data_center"),
        uuid_col("peers", "host_id"),
        varchar_col("peers", "rack"),
        varchar_col("peers", "release_version"),
        inet_col("peers", "rpc_address"),
        uuid_col("peers", "schema_version"),
        tokens_col("peers"),
    ]
}

/// Column name → pre-encoded value for the single virtual `system.local`
/// row, plus the fixed schemas of both virtual tables. Built once at
/// startup, read concurrently by every connection afterwards.
pub struct LocalRowCache {
    values: HashMap<String, Vec<u8>>,
    local_schema: Vec<ColumnSpec>,
    peers_schema: Vec<ColumnSpec>,
}

impl LocalRowCache {
    pub fn build(info: &ClusterInfo, negotiated_version: u8) -> Self {
        let mut values = HashMap::new();
        values.insert("key".to_string(), encode_varchar("local"));
        values.insert("cluster_name".to_string(), encode_varchar(CLUSTER_NAME));
        values.insert("cql_version".to_string(), encode_varchar(&info.cql_version));
        values.insert("data_center".to_string(), encode_varchar(DATA_CENTER));
        values.insert("host_id".to_string(), encode_uuid(HOST_ID_UUID));
        values.insert(
            "native_protocol_version".to_string(),
            encode_varchar(&negotiated_version.to_string()),
        );
        values.insert("partitioner".to_string(), encode_varchar(&info.partitioner));
        values.insert("rack".to_string(), encode_varchar(RACK));
        values.insert(
            "release_version".to_string(),
            encode_varchar(&info.release_version),
        );
        values.insert("schema_version".to_string(), encode_uuid(SCHEMA_VERSION_UUID));
        // Single fake token; the proxy owns the whole virtual ring.
        values.insert("tokens".to_string(), encode_string_list(&["0"]));
        // rpc_address is intentionally absent: it depends on which local
        // address the client connected to and is derived per-connection.

        LocalRowCache {
            values,
            local_schema: local_schema(),
            peers_schema: peers_schema(),
        }
    }

    pub fn value(&self, name: &str) -> Option<&[u8]> {
        self.values.get(name).map(|v| v.as_slice())
    }

    pub fn local_schema(&self) -> &[ColumnSpec] {
        &self.local_schema
    }

    pub fn peers_schema(&self) -> &[ColumnSpec] {
        &self.peers_schema
    }
}

// ============================================================================
// Selector evaluation
// ============================================================================

fn column_value(
    cache: Option<&LocalRowCache>,
    name: &str,
    table: &str,
    local_addr: Option<IpAddr>,
) -> Option<Vec<u8>> {
    if let Some(cache) = cache {
        if let Some(v) = cache.value(name) {
            return Some(v.to_vec());
        }
    }
    // rpc_address on `local` is the one per-connection value: the address
    // the client reached the proxy on.
    if name == "rpc_address" && table == "local" {
        return local_addr.map(encode_inet);
    }
    None
}

/// Evaluate a selector list against a virtual table. Returns the single
/// synthesized row and the output column metadata, or the message for an
/// invalid-request reply. Any failure aborts the whole query; partial rows
/// are never returned.
pub fn evaluate_selectors(
    selectors: &[Selector],
    cache: Option<&LocalRowCache>,
    schema: &[ColumnSpec],
    table: &str,
    row_count: i32,
    local_addr: Option<IpAddr>,
) -> Result<(Row, Vec<ColumnSpec>), String> {
    if selectors.is_empty() {
        return Err("no selectors in query".to_string());
    }

    if selectors[0] == Selector::Star {
        let row = schema
            .iter()
            .map(|col| column_value(cache, &col.name, table, local_addr))
            .collect();
        return Ok((row, schema.to_vec()));
    }

    let mut row = Vec::with_capacity(selectors.len());
    let mut columns = Vec::with_capacity(selectors.len());
    for selector in selectors {
        let (value, column) =
            evaluate_selector(selector, cache, schema, table, row_count, local_addr)?;
        row.push(value);
        columns.push(column);
    }
    Ok((row, columns))
}

/// Whether any selector is an aggregate. Aggregates produce a row even on
/// an empty table; plain column reads of `peers` produce none.
pub fn contains_aggregate(selectors: &[Selector]) -> bool {
    fn is_aggregate(selector: &Selector) -> bool {
        match selector {
            Selector::CountStar { .. } => true,
            Selector::Alias { inner, .. } => is_aggregate(inner),
            _ => false,
        }
    }
    selectors.iter().any(is_aggregate)
}

fn evaluate_selector(
    selector: &Selector,
    cache: Option<&LocalRowCache>,
    schema: &[ColumnSpec],
    table: &str,
    row_count: i32,
    local_addr: Option<IpAddr>,
) -> Result<(Option<Vec<u8>>, ColumnSpec), String> {
    match selector {
        Selector::CountStar { display } => Ok((
            Some(encode_int(row_count)),
            ColumnSpec::new("system", table, display, DataType::Int),
        )),
        Selector::Column(name) => match schema.iter().find(|col| &col.name == name) {
            Some(column) => Ok((
                column_value(cache, name, table, local_addr),
                column.clone(),
            )),
            None => Err(format!("invalid column {}", name)),
        },
        Selector::Alias { inner, alias } => {
            let (value, mut column) =
                evaluate_selector(inner, cache, schema, table, row_count, local_addr)?;
            column.name = alias.clone();
            Ok((value, column))
        }
        // `*` anywhere but the sole selector position.
        Selector::Star => Err("unhandled selector type".to_string()),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod system_tests {
    use super::*;
    use crate::frame::encode_inet;
    use std::net::Ipv4Addr;

    fn test_cache() -> LocalRowCache {
        LocalRowCache::build(
            &ClusterInfo {
                release_version: "4.0.7".to_string(),
                partitioner: "org.apache.cassandra.dht.Murmur3Partitioner".to_string(),
                cql_version: "3.4.5".to_string(),
            },
            4,
        )
    }

    fn local_ip() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7))
    }

    #[test]
    fn test_star_expands_full_schema_in_order() {
        let cache = test_cache();
        let (row, columns) = evaluate_selectors(
            &[Selector::Star],
            Some(&cache),
            cache.local_schema(),
            "local",
            1,
            Some(local_ip()),
        )
        .unwrap();

        assert_eq!(columns.len(), cache.local_schema().len());
        assert_eq!(row.len(), columns.len());
        // Cached columns carry the cached value; every cached column is
        // present in the row at its schema position.
        for (value, column) in row.iter().zip(columns.iter()) {
            if column.name == "rpc_address" {
                assert_eq!(value.as_deref(), Some(&encode_inet(local_ip())[..]));
            } else {
                assert_eq!(value.as_deref(), cache.value(&column.name));
            }
        }
    }

    #[test]
    fn test_identifier_selector() {
        let cache = test_cache();
        let (row, columns) = evaluate_selectors(
            &[Selector::Column("release_version".to_string())],
            Some(&cache),
            cache.local_schema(),
            "local",
            1,
            None,
        )
        .unwrap();
        assert_eq!(columns.len(), 1);
        assert_eq!(columns[0].name, "release_version");
        assert_eq!(row[0].as_deref(), Some(&b"4.0.7"[..]));
    }

    #[test]
    fn test_invalid_column_aborts_whole_query() {
        let cache = test_cache();
        let err = evaluate_selectors(
            &[
                Selector::Column("key".to_string()),
                Selector::Column("nosuchcol".to_string()),
            ],
            Some(&cache),
            cache.local_schema(),
            "local",
            1,
            None,
        )
        .unwrap_err();
        assert_eq!(err, "invalid column nosuchcol");
    }

    #[test]
    fn test_count_star_uses_caller_row_count() {
        let cache = test_cache();
        let (row, columns) = evaluate_selectors(
            &[Selector::CountStar {
                display: "count(*)".to_string(),
            }],
            None,
            cache.peers_schema(),
            "peers",
            0,
            None,
        )
        .unwrap();
        assert_eq!(columns[0].name, "count(*)");
        assert_eq!(columns[0].data_type, DataType::Int);
        assert_eq!(row[0].as_deref(), Some(&encode_int(0)[..]));
    }

    #[test]
    fn test_alias_renames_only_metadata() {
        let cache = test_cache();
        let (row, columns) = evaluate_selectors(
            &[Selector::Alias {
                inner: Box::new(Selector::Column("cluster_name".to_string())),
                alias: "name".to_string(),
            }],
            Some(&cache),
            cache.local_schema(),
            "local",
            1,
            None,
        )
        .unwrap();
        assert_eq!(columns[0].name, "name");
        assert_eq!(columns[0].data_type, DataType::Varchar);
        assert_eq!(row[0].as_deref(), cache.value("cluster_name"));
    }

    #[test]
    fn test_rpc_address_fallback_from_local_addr() {
        let cache = test_cache();
        let (row, _) = evaluate_selectors(
            &[Selector::Column("rpc_address".to_string())],
            Some(&cache),
            cache.local_schema(),
            "local",
            1,
            Some(local_ip()),
        )
        .unwrap();
        assert_eq!(row[0].as_deref(), Some(&[10u8, 0, 0, 7][..]));
    }

    #[test]
    fn test_contains_aggregate_sees_through_alias() {
        assert!(contains_aggregate(&[Selector::CountStar {
            display: "count(*)".to_string(),
        }]));
        assert!(contains_aggregate(&[Selector::Alias {
            inner: Box::new(Selector::CountStar {
                display: "count(*)".to_string(),
            }),
            alias: "n".to_string(),
        }]));
        assert!(!contains_aggregate(&[
            Selector::Star,
            Selector::Column("key".to_string()),
        ]));
    }

    #[test]
    fn test_star_in_non_first_position_is_rejected() {
        let cache = test_cache();
        let err = evaluate_selectors(
            &[Selector::Column("key".to_string()), Selector::Star],
            Some(&cache),
            cache.local_schema(),
            "local",
            1,
            None,
        )
        .unwrap_err();
        assert_eq!(err, "unhandled selector type");
    }
}
