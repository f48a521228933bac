use crate::intake::{RecordWriter, ShopDiagnostics};
use crate::shopify::client::{ShopifyClient, ShopifyError, UserError, check_user_errors};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

const METAFIELDS_SET: &str = r#"
mutation metafieldsSet($metafields: [MetafieldsSetInput!]!) {
  metafieldsSet(metafields: $metafields) {
    metafields { id namespace key }
    userErrors { field message code }
  }
}
"#;

const SHOP_INFO: &str = "query shopInfo { shop { id name myshopifyDomain } }";

/// A namespaced JSON metafield ready to be written to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetafieldRecord {
    pub namespace: String,
    pub key: String,
    /// JSON-serialized document.
    pub value: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MetafieldsSetInput<'a> {
    owner_id: &'a str,
    namespace: &'a str,
    key: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    value: &'a str,
}

#[derive(Serialize)]
struct MetafieldsSetVariables<'a> {
    metafields: Vec<MetafieldsSetInput<'a>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetafieldsSetData {
    metafields_set: Option<MetafieldsSetPayload>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetafieldsSetPayload {
    #[serde(default)]
    metafields: Vec<CreatedMetafield>,
    #[serde(default)]
    user_errors: Vec<UserError>,
}

#[derive(Deserialize)]
struct CreatedMetafield {
    id: String,
}

#[derive(Deserialize)]
struct ShopInfoData {
    shop: Value,
}

fn into_metafield_id(data: MetafieldsSetData) -> Result<String, ShopifyError> {
    let payload = data
        .metafields_set
        .ok_or(ShopifyError::MissingData("metafieldsSet"))?;
    check_user_errors(payload.user_errors)?;
    payload
        .metafields
        .into_iter()
        .next()
        .map(|m| m.id)
        .ok_or(ShopifyError::MissingData("metafieldsSet.metafields"))
}

#[async_trait]
impl RecordWriter for ShopifyClient {
    async fn write_record(&self, record: &MetafieldRecord) -> Result<String, ShopifyError> {
        let variables = MetafieldsSetVariables {
            metafields: vec![MetafieldsSetInput {
                owner_id: &self.owner_id,
                namespace: &record.namespace,
                key: &record.key,
                kind: "json",
                value: &record.value,
            }],
        };
        let data: MetafieldsSetData = self
            .execute("metafieldsSet", METAFIELDS_SET, variables)
            .await?;
        let id = into_metafield_id(data)?;
        info!(
            target: "appraisal.shopify",
            namespace = %record.namespace,
            key = %record.key,
            metafield_id = %id,
            "metafield_written"
        );
        Ok(id)
    }
}

#[async_trait]
impl ShopDiagnostics for ShopifyClient {
    async fn shop_info(&self) -> Result<Value, ShopifyError> {
        let data: ShopInfoData = self
            .execute("shopInfo", SHOP_INFO, serde_json::json!({}))
            .await?;
        Ok(data.shop)
    }
}
