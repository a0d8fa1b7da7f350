//! DynamoDB file index table

use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_dynamodb::types::AttributeValue;
use aws_sdk_dynamodb::Client as DynamoClient;

use super::{FileIndex, IndexStore};
use crate::error::{GrafanaLambdaError, Result};
use crate::lock::classify_sdk_error;

/// Index stored as a JSON string attribute `Files` on the row `Id = files_id`
pub struct DynamoIndexStore {
    client: DynamoClient,
    table: String,
    files_id: String,
}

impl DynamoIndexStore {
    pub fn new(config: &SdkConfig, table: impl Into<String>, files_id: impl Into<String>) -> Self {
        Self {
            client: DynamoClient::new(config),
            table: table.into(),
            files_id: files_id.into(),
        }
    }
}

#[async_trait]
impl IndexStore for DynamoIndexStore {
    async fn load(&self) -> Result<FileIndex> {
        let response = self
            .client
            .get_item()
            .table_name(&self.table)
            .key("Id", AttributeValue::S(self.files_id.clone()))
            .consistent_read(true)
            .send()
            .await
            .map_err(classify_sdk_error)?;

        let Some(item) = response.item() else {
            tracing::info!(table = %self.table, "No file index found, starting empty");
            return Ok(FileIndex::new());
        };

        let json = item
            .get("Files")
            .and_then(|value| value.as_s().ok())
            .ok_or_else(|| {
                GrafanaLambdaError::Store(format!(
                    "file index row {} has no string Files attribute",
                    self.files_id
                ))
            })?;

        FileIndex::from_json(json)
    }

    async fn save(&self, index: &FileIndex) -> Result<()> {
        self.client
            .put_item()
            .table_name(&self.table)
            .item("Id", AttributeValue::S(self.files_id.clone()))
            .item("Files", AttributeValue::S(index.to_json()?))
            .send()
            .await
            .map_err(classify_sdk_error)?;
        Ok(())
    }
}
