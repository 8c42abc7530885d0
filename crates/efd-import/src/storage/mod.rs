//! S3 access for uploaded ledger files

use aws_sdk_s3::{
    config::{http::HttpResponse, Credentials, Region},
    error::{DisplayErrorContext, SdkError},
    operation::get_object::GetObjectError,
    Client,
};
use tracing::{debug, info, instrument};

use crate::error::ImportError;
use crate::framework::source::SourceStream;

pub mod config;

pub use config::StorageConfig;

/// HTTP status S3 answers when the requested range starts past the object end
const RANGE_NOT_SATISFIABLE: u16 = 416;

#[derive(Clone)]
pub struct Storage {
    client: Client,
    bucket: String,
}

impl Storage {
    pub async fn new(config: StorageConfig) -> anyhow::Result<Self> {
        debug!(
            bucket = %config.bucket,
            endpoint = ?config.endpoint,
            "Initializing storage"
        );

        let mut s3_config_builder = match (&config.access_key, &config.secret_key) {
            (Some(access_key), Some(secret_key)) => {
                let credentials =
                    Credentials::new(access_key, secret_key, None, None, "efd-storage");
                aws_sdk_s3::Config::builder()
                    .credentials_provider(credentials)
                    .region(Region::new(config.region.clone()))
            },
            _ => {
                let shared = aws_config::from_env()
                    .region(Region::new(config.region.clone()))
                    .load()
                    .await;
                aws_sdk_s3::config::Builder::from(&shared)
            },
        };

        s3_config_builder = s3_config_builder.force_path_style(config.path_style);
        if let Some(endpoint) = &config.endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(s3_config_builder.build());

        info!("Storage client initialized for bucket: {}", config.bucket);

        Ok(Self {
            client,
            bucket: config.bucket,
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Stream an object starting at `offset`.
    ///
    /// An offset at or past the end of the object yields an empty stream.
    #[instrument(skip(self))]
    pub async fn read_from(&self, key: &str, offset: u64) -> Result<SourceStream, ImportError> {
        debug!("Opening s3://{}/{} at byte {}", self.bucket, key, offset);

        let mut request = self.client.get_object().bucket(&self.bucket).key(key);
        if offset > 0 {
            request = request.range(format!("bytes={}-", offset));
        }

        match request.send().await {
            Ok(output) => Ok(Box::pin(output.body.into_async_read())),
            Err(err) if is_range_not_satisfiable(&err) => {
                debug!(key, offset, "Range starts past the end of the object");
                Ok(Box::pin(tokio::io::empty()))
            },
            Err(err) => Err(classify_get_error(key, err)),
        }
    }
}

fn is_range_not_satisfiable(err: &SdkError<GetObjectError, HttpResponse>) -> bool {
    err.raw_response()
        .is_some_and(|response| response.status().as_u16() == RANGE_NOT_SATISFIABLE)
}

fn classify_get_error(key: &str, err: SdkError<GetObjectError, HttpResponse>) -> ImportError {
    match &err {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) | SdkError::ResponseError(_) => {
            ImportError::Transport(format!("reading {}: {}", key, DisplayErrorContext(&err)))
        },
        SdkError::ServiceError(service) if service.err().is_no_such_key() => {
            ImportError::Source(format!("object {} does not exist", key))
        },
        _ => ImportError::Source(format!("reading {}: {}", key, DisplayErrorContext(&err))),
    }
}
