use crate::intake::{ImageUpload, ImageUploader, RemoteFile};
use crate::shopify::client::{ShopifyClient, ShopifyError, UserError, check_user_errors};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

const FILE_CREATE: &str = r#"
mutation fileCreate($files: [FileCreateInput!]!) {
  fileCreate(files: $files) {
    files {
      id
      alt
      fileStatus
      ... on MediaImage {
        image { url }
        preview { image { url } }
      }
      ... on GenericFile {
        url
      }
    }
    userErrors { field message code }
  }
}
"#;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileCreateInput {
    pub filename: String,
    pub mime_type: String,
    pub file_size: String,
    pub content_type: &'static str,
    pub alt: String,
    pub original_source: String,
}

impl FileCreateInput {
    pub fn from_upload(upload: &ImageUpload) -> Self {
        Self {
            filename: upload.filename.clone(),
            mime_type: upload.content_type.clone(),
            file_size: upload.byte_size.to_string(),
            content_type: "IMAGE",
            alt: format!("Item submission image ({})", upload.slot),
            original_source: format!(
                "data:{};base64,{}",
                upload.content_type, upload.data_base64
            ),
        }
    }
}

#[derive(Serialize)]
struct FileCreateVariables {
    files: Vec<FileCreateInput>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileCreateData {
    file_create: Option<FileCreatePayload>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileCreatePayload {
    #[serde(default)]
    files: Vec<CreatedFile>,
    #[serde(default)]
    user_errors: Vec<UserError>,
}

#[derive(Deserialize)]
struct CreatedFile {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    image: Option<ImageRef>,
    #[serde(default)]
    preview: Option<PreviewRef>,
}

#[derive(Deserialize)]
struct ImageRef {
    #[serde(default)]
    url: Option<String>,
}

#[derive(Deserialize)]
struct PreviewRef {
    #[serde(default)]
    image: Option<ImageRef>,
}

impl CreatedFile {
    fn public_url(self) -> Option<String> {
        self.image
            .and_then(|image| image.url)
            .or(self.url)
            .or_else(|| self.preview.and_then(|p| p.image).and_then(|i| i.url))
    }
}

fn into_remote_file(data: FileCreateData) -> Result<RemoteFile, ShopifyError> {
    let payload = data
        .file_create
        .ok_or(ShopifyError::MissingData("fileCreate"))?;
    check_user_errors(payload.user_errors)?;
    let file = payload
        .files
        .into_iter()
        .next()
        .ok_or(ShopifyError::MissingData("fileCreate.files"))?;
    let id = file.id.clone();
    let url = file
        .public_url()
        .ok_or(ShopifyError::MissingData("file url"))?;
    Ok(RemoteFile { id, url })
}

#[async_trait]
impl ImageUploader for ShopifyClient {
    async fn upload_image(&self, upload: &ImageUpload) -> Result<RemoteFile, ShopifyError> {
        let variables = FileCreateVariables {
            files: vec![FileCreateInput::from_upload(upload)],
        };
        let data: FileCreateData = self.execute("fileCreate", FILE_CREATE, variables).await?;
        let file = into_remote_file(data)?;
        info!(
            target: "appraisal.shopify",
            slot = %upload.slot,
            bytes = upload.byte_size,
            file_id = file.id.as_deref().unwrap_or("-"),
            "file_created"
        );
        Ok(file)
    }
}
