//! toHTTP: streaming line-protocol sink
//!
//! Each incoming block is encoded row by row into line-protocol records and
//! streamed as the HTTP request body through a bounded channel of byte
//! chunks, so a large block never materializes as one contiguous body.
//! Requests share a keep-alive pool unless the spec opts out.

use crate::block::{Block, ColumnData, PartitionKey};
use crate::dataset::Dataset;
use crate::line_protocol::encode_record;
use crate::transform::Transformation;
use async_trait::async_trait;
use std::sync::{Arc, LazyLock};
use tokio::sync::mpsc;
use tracing::{debug, error};
use virga_core::{Error, Result, Time, Value};
use virga_query::ops::ToHttpSpec;
use virga_query::DatasetID;

/// Idle connections kept per host in the shared pool.
fn pool_idle_per_host() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        + 1
}

fn build_client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_idle_timeout(std::time::Duration::from_secs(90))
        .pool_max_idle_per_host(pool_idle_per_host())
        .connect_timeout(std::time::Duration::from_secs(10))
        .build()
        .expect("default client configuration is valid")
}

/// Shared keep-alive client for every `toHTTP` sink in the process.
static KEEP_ALIVE_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(build_client);

/// How much of an error response body is carried into the terminal error.
const ERROR_BODY_LIMIT: usize = 4096;

pub struct ToHttpTransformation {
    dataset: Dataset,
    spec: ToHttpSpec,
}

impl ToHttpTransformation {
    pub fn new(dataset: Dataset, spec: ToHttpSpec) -> Self {
        ToHttpTransformation { dataset, spec }
    }

    fn url(&self) -> String {
        if self.spec.url_params.is_empty() {
            return self.spec.addr.clone();
        }
        let mut url = self.spec.addr.clone();
        url.push(if url.contains('?') { '&' } else { '?' });
        for (i, (k, v)) in self.spec.url_params.iter().enumerate() {
            if i > 0 {
                url.push('&');
            }
            url.push_str(k);
            url.push('=');
            url.push_str(v);
        }
        url
    }

    /// Check the block's columns against the spec before any bytes move.
    fn check_schema(&self, block: &Block) -> Result<()> {
        match block.col_data(&self.spec.time_column) {
            Some(ColumnData::Time(_)) => {}
            Some(other) => {
                return Err(Error::Type(format!(
                    "column {:?} is not of type time, got {}",
                    self.spec.time_column,
                    other.data_type()
                )))
            }
            None => {
                return Err(Error::Type(format!(
                    "missing time column {:?}",
                    self.spec.time_column
                )))
            }
        }
        for tag in &self.spec.tag_columns {
            match block.col_data(tag) {
                Some(ColumnData::String(_)) | None => {}
                Some(other) => {
                    return Err(Error::Type(format!(
                        "tag column {:?} must be a string, got {}",
                        tag,
                        other.data_type()
                    )))
                }
            }
        }
        Ok(())
    }
}

/// Encode every row of `block` into the chunk channel, one record per chunk.
fn encode_rows(block: &Block, spec: &ToHttpSpec) -> Result<Vec<Vec<u8>>> {
    let times = match block.col_data(&spec.time_column) {
        Some(ColumnData::Time(v)) => v,
        _ => return Err(Error::Type(format!("missing time column {:?}", spec.time_column))),
    };

    let mut chunks = Vec::with_capacity(block.nrows());
    for row in 0..block.nrows() {
        let mut tags: Vec<(&str, &str)> = Vec::with_capacity(spec.tag_columns.len());
        for tag in &spec.tag_columns {
            if let Some(ColumnData::String(v)) = block.col_data(tag) {
                tags.push((tag.as_str(), v[row].as_str()));
            }
        }
        let mut fields: Vec<(&str, Value)> = Vec::with_capacity(spec.value_columns.len());
        for field in &spec.value_columns {
            if let Some(data) = block.col_data(field) {
                fields.push((field.as_str(), data.value(row)));
            }
        }
        let mut record = String::new();
        encode_record(&mut record, &spec.name, &tags, &fields, times[row])?;
        chunks.push(record.into_bytes());
    }
    Ok(chunks)
}

#[async_trait]
impl Transformation for ToHttpTransformation {
    async fn process(&mut self, _parent: DatasetID, block: Arc<Block>) -> Result<()> {
        self.check_schema(&block)?;

        // Encoder task feeds the bounded chunk channel; the request body
        // drains it. Backpressure from the server throttles the encoder.
        let (tx, rx) = mpsc::channel::<Vec<u8>>(64);
        let spec = self.spec.clone();
        let encode_block = Arc::clone(&block);
        let encoder = tokio::spawn(async move {
            let chunks = encode_rows(&encode_block, &spec)?;
            for chunk in chunks {
                if tx.send(chunk).await.is_err() {
                    break;
                }
            }
            Ok::<(), Error>(())
        });

        let body_stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv()
                .await
                .map(|chunk| (Ok::<_, std::io::Error>(chunk), rx))
        });

        let method = reqwest::Method::from_bytes(self.spec.method.as_bytes())
            .map_err(|_| Error::InvalidArgument(format!("bad method {:?}", self.spec.method)))?;
        let client = if self.spec.no_keep_alive {
            build_client()
        } else {
            KEEP_ALIVE_CLIENT.clone()
        };

        let mut request = client
            .request(method, self.url())
            .timeout(self.spec.timeout.to_std())
            .body(reqwest::Body::wrap_stream(body_stream));
        for (k, v) in &self.spec.headers {
            request = request.header(k, v);
        }

        debug!(dataset = %self.dataset.id(), addr = %self.spec.addr, rows = block.nrows(), "toHTTP write");
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Timeout(format!("toHTTP request to {}", self.spec.addr))
            } else {
                Error::Io(format!("toHTTP request to {}: {}", self.spec.addr, e))
            }
        })?;

        match encoder.await {
            Ok(result) => result?,
            Err(e) => return Err(Error::internal(format!("encoder task failed: {}", e))),
        }

        let status = response.status();
        if !status.is_success() {
            let mut body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<unreadable body>"));
            body.truncate(ERROR_BODY_LIMIT);
            error!(dataset = %self.dataset.id(), %status, "toHTTP write rejected");
            return Err(Error::Io(format!(
                "toHTTP {} responded {}: {}",
                self.spec.addr, status, body
            )));
        }
        Ok(())
    }

    async fn retract_block(&mut self, _parent: DatasetID, key: &PartitionKey) -> Result<()> {
        // Records already on the wire cannot be unsent; tell downstream.
        self.dataset.retract(key).await
    }

    async fn update_watermark(&mut self, _parent: DatasetID, t: Time) -> Result<()> {
        self.dataset.update_watermark(t).await
    }

    async fn update_processing_time(&mut self, _parent: DatasetID, t: Time) -> Result<()> {
        self.dataset.update_processing_time(t).await
    }

    async fn finish(&mut self, _parent: DatasetID, err: Option<Error>) -> Result<()> {
        self.dataset.finish(err).await
    }

    async fn abort(&mut self, err: Error) {
        let _ = self.dataset.finish(Some(err)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{Column, TIME_COL, VALUE_COL};
    use virga_core::{Bounds, DataType, Duration};

    fn spec() -> ToHttpSpec {
        ToHttpSpec {
            addr: "http://localhost:9999/write".into(),
            method: "POST".into(),
            name: "m".into(),
            headers: Default::default(),
            url_params: Default::default(),
            timeout: Duration::from_secs(1),
            no_keep_alive: false,
            time_column: TIME_COL.into(),
            tag_columns: vec!["t1".into()],
            value_columns: vec![VALUE_COL.into()],
        }
    }

    fn block() -> Block {
        Block::new(
            PartitionKey::empty(),
            Bounds::new(Time(0), Time(3_000_000_000)),
            vec![
                Column::new(TIME_COL, DataType::Time),
                Column::new("t1", DataType::String),
                Column::new(VALUE_COL, DataType::Float),
            ],
            vec![
                ColumnData::Time(vec![Time(1_000_000_000), Time(2_000_000_000)]),
                ColumnData::String(vec!["a".into(), "b".into()]),
                ColumnData::Float(vec![1.5, 2.5]),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_encode_rows_matches_wire_format() {
        let chunks = encode_rows(&block(), &spec()).unwrap();
        let body: String = chunks
            .into_iter()
            .map(|c| String::from_utf8(c).unwrap())
            .collect();
        assert_eq!(
            body,
            "m,t1=a _value=1.5 1000000000\nm,t1=b _value=2.5 2000000000\n"
        );
    }

    #[test]
    fn test_url_params_appended() {
        let mut s = spec();
        s.url_params.insert("db".into(), "mydb".into());
        s.url_params.insert("rp".into(), "auto".into());
        let (tx, _rx) = tokio::sync::mpsc::channel(1);
        let t = ToHttpTransformation::new(
            Dataset::new(
                DatasetID(1),
                Default::default(),
                vec![crate::dataset::Subscriber::new(tx)],
            ),
            s,
        );
        assert_eq!(t.url(), "http://localhost:9999/write?db=mydb&rp=auto");
    }

    #[test]
    fn test_schema_check_rejects_non_time_column() {
        let mut s = spec();
        s.time_column = VALUE_COL.into();
        let (tx, _rx) = tokio::sync::mpsc::channel(1);
        let t = ToHttpTransformation::new(
            Dataset::new(
                DatasetID(1),
                Default::default(),
                vec![crate::dataset::Subscriber::new(tx)],
            ),
            s,
        );
        assert!(matches!(t.check_schema(&block()), Err(Error::Type(_))));
    }
}
