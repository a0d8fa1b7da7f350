//! DynamoDB lock table

use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_dynamodb::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_dynamodb::types::AttributeValue;
use aws_sdk_dynamodb::Client as DynamoClient;

use super::{LockRecord, LockStore};
use crate::error::{GrafanaLambdaError, Result};

const THROTTLE_CODES: &[&str] = &[
    "ProvisionedThroughputExceededException",
    "ThrottlingException",
    "RequestLimitExceeded",
];

/// Map an SDK failure onto the store error taxonomy
pub(crate) fn classify_sdk_error<E, R>(err: SdkError<E, R>) -> GrafanaLambdaError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug,
{
    let message = DisplayErrorContext(&err).to_string();
    match err.code() {
        Some("ConditionalCheckFailedException") => GrafanaLambdaError::ConditionFailed(message),
        Some(code) if THROTTLE_CODES.contains(&code) => GrafanaLambdaError::StoreThrottled(message),
        _ => GrafanaLambdaError::Store(message),
    }
}

/// Lock records in a table keyed by `Id` (string) with numeric `Expire`
pub struct DynamoLockStore {
    client: DynamoClient,
    table: String,
}

impl DynamoLockStore {
    pub fn new(config: &SdkConfig, table: impl Into<String>) -> Self {
        Self {
            client: DynamoClient::new(config),
            table: table.into(),
        }
    }
}

#[async_trait]
impl LockStore for DynamoLockStore {
    async fn put_if_vacant(&self, record: &LockRecord, now: i64) -> Result<()> {
        self.client
            .put_item()
            .table_name(&self.table)
            .item("Id", AttributeValue::S(record.id.clone()))
            .item("Expire", AttributeValue::N(record.expire_at.to_string()))
            .condition_expression("attribute_not_exists(Id) OR :now > Expire")
            .expression_attribute_values(":now", AttributeValue::N(now.to_string()))
            .send()
            .await
            .map_err(classify_sdk_error)?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.client
            .delete_item()
            .table_name(&self.table)
            .key("Id", AttributeValue::S(id.to_string()))
            .send()
            .await
            .map_err(classify_sdk_error)?;
        Ok(())
    }
}
