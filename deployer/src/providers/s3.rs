//! S3 object store using the AWS SDK.
//!
//! Supports AWS S3 and S3-compatible services (MinIO, etc.) through a custom
//! endpoint. Conditional writes rely on S3's `If-Match` / `If-None-Match`
//! support for `PutObject`.

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use secrecy::ExposeSecret;
use tracing::debug;

use super::{
    classify_code, classify_status, ObjectHeaders, ObjectMetadata, ObjectStore, ObjectSummary,
    Precondition, VersionedObject,
};
use crate::errors::DeployError;
use crate::storage::settings::StaticCredentials;
use crate::utils::sha256_base64;

/// Load shared AWS configuration for a region
pub async fn load_sdk_config(region: &str, credentials: Option<&StaticCredentials>) -> SdkConfig {
    let mut loader =
        aws_config::defaults(BehaviorVersion::latest()).region(Region::new(region.to_string()));
    if let Some(creds) = credentials {
        loader = loader.credentials_provider(Credentials::new(
            creds.access_key_id.clone(),
            creds.secret_access_key.expose_secret().to_string(),
            None,
            None,
            "site-deploy-settings",
        ));
    }
    loader.load().await
}

/// Map an SDK error into the pipeline taxonomy
pub(crate) fn map_sdk_error<E>(err: SdkError<E>, context: &str) -> DeployError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let message = format!("{context}: {}", DisplayErrorContext(&err));

    if let Some(mapped) = err.code().and_then(|code| classify_code(code, message.clone())) {
        return mapped;
    }
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            return DeployError::TransientProvider(message);
        }
        _ => {}
    }
    match err.raw_response().map(|r| r.status().as_u16()) {
        Some(status) => classify_status(status, message),
        None => DeployError::Provider(message),
    }
}

/// S3 object store
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
    prefix: String,
}

impl S3ObjectStore {
    pub fn new(client: Client, bucket: impl Into<String>, prefix: Option<String>) -> Self {
        let prefix = prefix
            .map(|p| p.trim_matches('/').to_string())
            .filter(|p| !p.is_empty())
            .map(|p| format!("{p}/"))
            .unwrap_or_default();
        Self {
            client,
            bucket: bucket.into(),
            prefix,
        }
    }

    /// Connect using region, optional endpoint and optional static credentials
    pub async fn connect(
        bucket: &str,
        region: &str,
        endpoint: Option<&str>,
        prefix: Option<String>,
        credentials: Option<&StaticCredentials>,
    ) -> Self {
        let sdk_config = load_sdk_config(region, credentials).await;
        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(endpoint) = endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        Self::new(Client::from_conf(builder.build()), bucket, prefix)
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn relative_key<'a>(&self, key: &'a str) -> &'a str {
        key.strip_prefix(self.prefix.as_str()).unwrap_or(key)
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    fn describe(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.prefix)
    }

    async fn check(&self) -> Result<(), DeployError> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| {
                DeployError::Environment(format!(
                    "bucket {} is not reachable: {}",
                    self.bucket,
                    DisplayErrorContext(&e)
                ))
            })?;
        Ok(())
    }

    async fn put_object(&self, key: &str, body: Bytes, headers: &ObjectHeaders) -> Result<(), DeployError> {
        debug!("PUT s3://{}/{}", self.bucket, self.full_key(key));
        let checksum = sha256_base64(&body);
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .set_cache_control(headers.cache_control.clone())
            .set_content_type(headers.content_type.clone())
            .checksum_sha256(checksum)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| map_sdk_error(e, &format!("put {key}")))?;
        Ok(())
    }

    async fn put_object_if(
        &self,
        key: &str,
        body: Bytes,
        headers: &ObjectHeaders,
        precondition: Precondition,
    ) -> Result<String, DeployError> {
        let checksum = sha256_base64(&body);
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .set_cache_control(headers.cache_control.clone())
            .set_content_type(headers.content_type.clone())
            .checksum_sha256(checksum)
            .body(ByteStream::from(body));
        request = match precondition {
            Precondition::DoesNotExist => request.if_none_match("*"),
            Precondition::Matches(etag) => request.if_match(etag),
        };

        let output = request
            .send()
            .await
            .map_err(|e| map_sdk_error(e, &format!("conditional put {key}")))?;
        Ok(output.e_tag().unwrap_or_default().to_string())
    }

    async fn get_object(&self, key: &str) -> Result<VersionedObject, DeployError> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(|e| map_sdk_error(e, &format!("get {key}")))?;

        let etag = output.e_tag().unwrap_or_default().to_string();
        let body = output
            .body
            .collect()
            .await
            .map_err(|e| DeployError::TransientProvider(format!("read {key}: {e}")))?
            .into_bytes();
        Ok(VersionedObject { body, etag })
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectSummary>, DeployError> {
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let output = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(self.full_key(prefix))
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| map_sdk_error(e, &format!("list {prefix}")))?;

            for object in output.contents() {
                if let Some(key) = object.key() {
                    objects.push(ObjectSummary {
                        key: self.relative_key(key).to_string(),
                        size: object.size().unwrap_or(0).max(0) as u64,
                    });
                }
            }

            match output.next_continuation_token() {
                Some(token) if output.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        Ok(objects)
    }

    async fn delete_object(&self, key: &str) -> Result<(), DeployError> {
        debug!("DELETE s3://{}/{}", self.bucket, self.full_key(key));
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(|e| map_sdk_error(e, &format!("delete {key}")))?;
        Ok(())
    }

    async fn get_object_metadata(&self, key: &str) -> Result<ObjectMetadata, DeployError> {
        let output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(|e| map_sdk_error(e, &format!("head {key}")))?;

        Ok(ObjectMetadata {
            headers: ObjectHeaders {
                cache_control: output.cache_control().map(str::to_string),
                content_type: output.content_type().map(str::to_string),
            },
            size: output.content_length().unwrap_or(0).max(0) as u64,
            etag: output.e_tag().map(str::to_string),
        })
    }
}
