use async_trait::async_trait;
use dpgate_query::{Dataset, DatasetId};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} answered with status {status}")]
    Status { url: String, status: u16 },
    #[error("malformed csv: {0}")]
    Csv(#[from] csv::Error),
}

/// Source of dataset rows for the engine. Datasets arrive as string cells
/// and are only parsed when a step needs a typed value.
#[async_trait]
pub trait DatasetProvider: Send + Sync {
    async fn fetch(&self, dataset: DatasetId, url: &str) -> Result<Dataset, ProviderError>;
}

/// Downloads a CSV from the callback URL carried by each request.
#[derive(Clone, Debug, Default)]
pub struct HttpCsvProvider {
    http: reqwest::Client,
}

impl HttpCsvProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DatasetProvider for HttpCsvProvider {
    async fn fetch(&self, dataset: DatasetId, url: &str) -> Result<Dataset, ProviderError> {
        let http_err = |source| ProviderError::Http {
            url: url.to_owned(),
            source,
        };
        let response = self.http.get(url).send().await.map_err(http_err)?;
        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::Status {
                url: url.to_owned(),
                status: status.as_u16(),
            });
        }
        let body = response.bytes().await.map_err(http_err)?;
        let data = parse_csv(&body)?;
        debug!(dataset, rows = data.len(), "fetched dataset");
        Ok(data)
    }
}

/// Parses CSV text whose first record is a header. Records may differ in
/// width; short rows surface as data errors when a missing cell is read.
pub fn parse_csv(body: &[u8]) -> Result<Dataset, ProviderError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::None)
        .from_reader(body);
    let records = reader
        .records()
        .map(|record| record.map(|record| record.iter().map(str::to_owned).collect()))
        .collect::<Result<Vec<Vec<String>>, _>>()?;
    Ok(Dataset::from_records_with_header(records))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn header_row_is_stripped() {
        let data = parse_csv(b"age,city\n31,Oslo\n42,\"Bergen, Vestland\"\n").unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(data.rows()[1].0, vec!["42".to_owned(), "Bergen, Vestland".to_owned()]);
    }

    #[test]
    fn header_only_yields_no_rows() {
        assert!(parse_csv(b"age\n").unwrap().is_empty());
        assert!(parse_csv(b"").unwrap().is_empty());
    }
}
