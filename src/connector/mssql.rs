// SQL Server connector backed by tiberius
//
// Targets are ADO connection strings (`Server=host,port;User Id=...;Password=...;`).
// Every call to `connect` opens a brand new TCP connection; nothing is pooled.

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use futures_util::{future, StreamExt, TryStreamExt};
use std::sync::Arc;
use tiberius::{Client, ColumnData, Config, FromSql, QueryItem};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::debug;

use super::{Connection, Connector, ConnectorError, RowStream, ServerTarget};
use crate::decode::{RawRow, Value};

type MssqlClient = Client<Compat<TcpStream>>;

/// Connector for Microsoft SQL Server and Azure SQL DB
#[derive(Debug, Clone, Default)]
pub struct MssqlConnector;

impl MssqlConnector {
    pub fn new() -> Self {
        MssqlConnector
    }

    async fn open(config: Config) -> tiberius::Result<MssqlClient> {
        let tcp = TcpStream::connect(config.get_addr()).await?;
        tcp.set_nodelay(true)?;
        Client::connect(config, tcp.compat_write()).await
    }
}

#[async_trait]
impl Connector for MssqlConnector {
    async fn connect(&self, target: &ServerTarget) -> Result<Box<dyn Connection>, ConnectorError> {
        let config = Config::from_ado_string(target.as_str()).map_err(connect_error)?;

        let client = match Self::open(config.clone()).await {
            Ok(client) => client,
            // Azure gateways answer the login with a redirect to the actual node
            Err(tiberius::error::Error::Routing { host, port }) => {
                debug!("Server {} redirected us to {}:{}", target, host, port);
                let mut config = config;
                config.host(&host);
                config.port(port);
                Self::open(config).await.map_err(connect_error)?
            }
            Err(e) => return Err(connect_error(e)),
        };

        Ok(Box::new(MssqlConnection { client }))
    }
}

struct MssqlConnection {
    client: MssqlClient,
}

#[async_trait]
impl Connection for MssqlConnection {
    async fn query<'a>(&'a mut self, text: &'a str) -> Result<RowStream<'a>, ConnectorError> {
        let stream = self.client.simple_query(text).await.map_err(execute_error)?;

        // Metadata arrives once per result set, ahead of its rows
        let mut columns: Arc<[String]> = Arc::from(Vec::new());
        let rows = stream
            .map_err(execute_error)
            .try_filter_map(move |item| {
                let row = match item {
                    QueryItem::Metadata(meta) => {
                        columns = meta
                            .columns()
                            .iter()
                            .map(|column| column.name().to_string())
                            .collect();
                        None
                    }
                    QueryItem::Row(row) => {
                        let values = row
                            .into_iter()
                            .zip(columns.iter())
                            .map(|(data, column)| {
                                to_value(&data).map_err(|e| {
                                    ConnectorError::Conversion(format!("column '{}': {}", column, e))
                                })
                            })
                            .collect::<Result<Vec<_>, _>>();
                        Some(values.map(|values| RawRow::new(Arc::clone(&columns), values)))
                    }
                };
                future::ready(row.transpose())
            });

        Ok(rows.boxed())
    }

    async fn close(self: Box<Self>) -> Result<(), ConnectorError> {
        self.client.close().await.map_err(connect_error)
    }
}

fn connect_error(e: tiberius::error::Error) -> ConnectorError {
    ConnectorError::Connect(e.to_string())
}

fn execute_error(e: tiberius::error::Error) -> ConnectorError {
    ConnectorError::Execute(e.to_string())
}

/// Maps a TDS column value onto the collector's dynamic value type
///
/// SQL NULL of any type becomes `Value::Null`. Decimals are reported as floats,
/// dates and timestamps as UTC timestamps, times of day, XML, GUIDs and
/// binaries as text. A value the driver cannot convert is an error, never a null.
fn to_value(data: &ColumnData<'static>) -> tiberius::Result<Value> {
    let value = match data {
        ColumnData::U8(v) => v.map(|v| Value::Integer(i64::from(v))),
        ColumnData::I16(v) => v.map(|v| Value::Integer(i64::from(v))),
        ColumnData::I32(v) => v.map(|v| Value::Integer(i64::from(v))),
        ColumnData::I64(v) => v.map(Value::Integer),
        ColumnData::F32(v) => v.map(|v| Value::Float(f64::from(v))),
        ColumnData::F64(v) => v.map(Value::Float),
        ColumnData::Bit(v) => v.map(Value::Boolean),
        ColumnData::String(v) => v.as_ref().map(|s| Value::Text(s.to_string())),
        ColumnData::Xml(v) => v.as_ref().map(|xml| Value::Text(xml.to_string())),
        ColumnData::Guid(v) => v.as_ref().map(|guid| Value::Text(guid.to_string())),
        ColumnData::Numeric(v) => v.as_ref().map(|n| {
            Value::Float(n.value() as f64 / 10f64.powi(i32::from(n.scale())))
        }),
        ColumnData::Binary(v) => v.as_ref().map(|bytes| {
            Value::Text(bytes.iter().map(|b| format!("{:02x}", b)).collect())
        }),
        ColumnData::Time(_) => {
            NaiveTime::from_sql(data)?.map(|time| Value::Text(time.to_string()))
        }
        // The wire carries UTC plus the offset, so read it with the offset attached
        ColumnData::DateTimeOffset(_) => DateTime::<FixedOffset>::from_sql(data)?
            .map(|dt| Value::Timestamp(dt.with_timezone(&Utc))),
        ColumnData::Date(_) => match NaiveDate::from_sql(data)? {
            Some(date) => {
                let midnight = date.and_hms_opt(0, 0, 0).ok_or_else(|| {
                    let message = format!("date {} has no midnight", date);
                    tiberius::error::Error::Conversion(message.into())
                })?;
                Some(Value::Timestamp(midnight.and_utc()))
            }
            None => None,
        },
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            NaiveDateTime::from_sql(data)?.map(|dt| Value::Timestamp(dt.and_utc()))
        }
    };

    Ok(value.unwrap_or(Value::Null))
}
