use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use snmp2::{AsyncSession, Value};
use tokio::time::timeout;

use crate::config::SnmpVersion;
use crate::error::PollError;
use crate::oid::{oid_starts_with, oid_suffix, oid_to_string, parse_oid, split_column};
use crate::query::{MetricQuery, QueryResult, QuerySource, RawValue};

use super::DataSource;

/// SNMP v1/v2c source for a single device.
pub struct SnmpSource {
    address: String,
    session: AsyncSession,
    request_timeout: Duration,
}

impl SnmpSource {
    /// Create an SNMP session for a device.
    pub async fn connect(
        address: &str,
        community: &str,
        version: SnmpVersion,
        request_timeout: Duration,
    ) -> Result<Self, PollError> {
        let community = community.as_bytes();

        let session = match version {
            SnmpVersion::V1 => AsyncSession::new_v1(address, community, 0).await,
            SnmpVersion::V2c => AsyncSession::new_v2c(address, community, 0).await,
        }
        .map_err(|e| PollError::from_io(address, &e))?;

        Ok(Self {
            address: address.to_string(),
            session,
            request_timeout,
        })
    }

    /// Perform an SNMP GET operation.
    async fn get(&mut self, query: &str, oid_str: &str) -> Result<Option<RawValue>, PollError> {
        let oid = parse_oid(oid_str)?;
        let request_timeout = self.request_timeout;

        let response = timeout(request_timeout, self.session.get(&oid))
            .await
            .map_err(|_| PollError::Timeout(request_timeout.as_millis() as u64))?
            .map_err(|e| request_error(&self.address, query, "GET", oid_str, e))?;

        Ok(response
            .varbinds
            .into_iter()
            .next()
            .and_then(|(_, value)| snmp_value_to_raw(&value)))
    }

    /// Perform an SNMP WALK operation (using GETNEXT).
    async fn walk(
        &mut self,
        query: &str,
        subtree_str: &str,
    ) -> Result<Vec<(String, RawValue)>, PollError> {
        let subtree = parse_oid(subtree_str)?;
        let mut results = Vec::new();
        let mut current_oid = subtree.clone();
        let request_timeout = self.request_timeout;

        loop {
            let response = timeout(request_timeout, self.session.getnext(&current_oid))
                .await
                .map_err(|_| PollError::Timeout(request_timeout.as_millis() as u64))?
                .map_err(|e| request_error(&self.address, query, "GETNEXT", subtree_str, e))?;

            let Some((resp_oid, value)) = response.varbinds.into_iter().next() else {
                break;
            };

            if !oid_starts_with(&resp_oid, &subtree) || matches!(value, Value::EndOfMibView) {
                break;
            }

            let oid_string = oid_to_string(&resp_oid);

            // Agents that answer GETNEXT with the requested OID would loop forever.
            if oid_string == oid_to_string(&current_oid) {
                return Err(PollError::Protocol(format!(
                    "{} returned a non-increasing OID during walk of {}",
                    self.address, subtree_str
                )));
            }

            if let Some(raw) = snmp_value_to_raw(&value) {
                results.push((oid_string, raw));
            }

            current_oid = resp_oid.to_owned();
        }

        Ok(results)
    }
}

/// Socket failures and a rejected community void the device; anything else
/// only fails the query.
fn request_error(address: &str, query: &str, op: &str, oid: &str, err: snmp2::Error) -> PollError {
    match err {
        snmp2::Error::Send | snmp2::Error::Receive => {
            PollError::Connection(format!("{}: {} {}: {}", address, op, oid, err))
        }
        snmp2::Error::CommunityMismatch => {
            PollError::Auth(format!("{}: community string mismatch", address))
        }
        _ => PollError::query(query, format!("{} {}: {}", op, oid, err)),
    }
}

#[async_trait]
impl DataSource for SnmpSource {
    async fn fetch(&mut self, query: &MetricQuery) -> Result<Vec<QueryResult>, PollError> {
        let QuerySource::Snmp { oids, walk } = &query.source else {
            return Err(PollError::Config(format!(
                "query '{}' is not an SNMP query",
                query.name
            )));
        };

        let mut rows = Vec::new();

        if !oids.is_empty() {
            let mut row = QueryResult::new();
            for oid in oids {
                match self.get(&query.name, oid).await? {
                    Some(value) => row.insert(oid.clone(), value),
                    None => {
                        tracing::debug!(device = %self.address, oid = %oid, "No value returned");
                    }
                }
            }
            rows.push(row);
        }

        if let Some(entry) = walk {
            let entries = self.walk(&query.name, entry).await?;
            rows.extend(group_table_rows(entry, entries));
        }

        if rows.is_empty() {
            tracing::trace!(device = %self.address, query = %query.name, "Query returned no rows");
        }

        Ok(rows)
    }
}

/// Group walked `(oid, value)` pairs of a table entry into one row per index.
///
/// `1.3.6.1.2.1.2.2.1.10.3` under entry `1.3.6.1.2.1.2.2.1` becomes field
/// `"10"` of the row with `index = "3"`. Rows keep the order in which their
/// index was first seen.
pub(crate) fn group_table_rows(entry: &str, entries: Vec<(String, RawValue)>) -> Vec<QueryResult> {
    let mut rows: Vec<QueryResult> = Vec::new();
    let mut by_index: HashMap<String, usize> = HashMap::new();

    for (oid, value) in entries {
        let Some(suffix) = oid_suffix(&oid, entry) else {
            continue;
        };
        let Some((column, index)) = split_column(&suffix) else {
            continue;
        };

        let position = *by_index.entry(index.to_string()).or_insert_with(|| {
            rows.push(QueryResult::new().with("index", index));
            rows.len() - 1
        });
        rows[position].insert(column, value);
    }

    rows
}

/// Convert an SNMP Value to a RawValue.
pub fn snmp_value_to_raw(value: &Value) -> Option<RawValue> {
    match value {
        Value::Integer(n) => Some(RawValue::Int(*n)),
        Value::OctetString(s) => Some(RawValue::Text(String::from_utf8_lossy(s).into_owned())),
        Value::ObjectIdentifier(oid) => Some(RawValue::Text(oid_to_string(oid))),
        Value::IpAddress(ip) => Some(RawValue::Text(format!(
            "{}.{}.{}.{}",
            ip[0], ip[1], ip[2], ip[3]
        ))),
        Value::Counter32(n) => Some(RawValue::UInt(*n as u64)),
        Value::Unsigned32(n) => Some(RawValue::UInt(*n as u64)),
        Value::Timeticks(n) => Some(RawValue::UInt(*n as u64)),
        Value::Counter64(n) => Some(RawValue::UInt(*n)),
        Value::Null => Some(RawValue::Null),
        Value::NoSuchObject | Value::NoSuchInstance | Value::EndOfMibView => None,
        _ => None,
    }
}
