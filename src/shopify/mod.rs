pub mod client;
pub mod files;
pub mod metafields;

pub use client::{ShopifyClient, ShopifyError, UserError};
pub use metafields::MetafieldRecord;
