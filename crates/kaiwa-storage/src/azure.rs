//! Azure Blob Storage over plain REST: SharedKey-signed Put Blob and
//! service-SAS read URLs.

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use kaiwa_core::config::StorageConfig;
use sha2::Sha256;
use tracing::{debug, warn};

use crate::error::{Result, StorageError};
use crate::{validate_key, BlobStorage, StoredObject};

type HmacSha256 = Hmac<Sha256>;

const API_VERSION: &str = "2021-08-06";
const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

pub struct AzureBlobStorage {
    client: reqwest::Client,
    account: String,
    key: Vec<u8>,
    container: String,
    /// Blob service root, without a trailing slash.
    endpoint: String,
    sas_ttl: Duration,
}

impl AzureBlobStorage {
    /// `endpoint_override` replaces the public endpoint (Azurite and other
    /// emulators); nothing else about the client changes.
    pub fn from_config(cfg: &StorageConfig) -> Result<Self> {
        let account = cfg
            .account
            .clone()
            .ok_or_else(|| StorageError::Config("storage.account is required for azure".into()))?;
        let key = cfg
            .account_key
            .as_deref()
            .ok_or_else(|| StorageError::Config("storage.account_key is required for azure".into()))?;
        let key = B64
            .decode(key)
            .map_err(|e| StorageError::Config(format!("storage.account_key is not base64: {e}")))?;

        let endpoint = match &cfg.endpoint_override {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("https://{account}.blob.core.windows.net"),
        };

        Ok(Self {
            client: reqwest::Client::new(),
            account,
            key,
            container: cfg.container.clone(),
            endpoint,
            sas_ttl: Duration::seconds(cfg.sas_ttl_secs),
        })
    }

    fn blob_url(&self, key: &str) -> String {
        format!("{}/{}/{}", self.endpoint, self.container, key)
    }

    /// Path part of the blob URL. Emulators put the account in the path,
    /// which the canonical resource must then repeat.
    fn blob_path(&self, key: &str) -> String {
        let url = self.blob_url(key);
        let after_scheme = url.split_once("://").map_or(url.as_str(), |(_, rest)| rest);
        match after_scheme.find('/') {
            Some(i) => after_scheme[i..].to_string(),
            None => "/".to_string(),
        }
    }

    fn sign(&self, string_to_sign: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("HMAC accepts any key size");
        mac.update(string_to_sign.as_bytes());
        B64.encode(mac.finalize().into_bytes())
    }

    /// String to sign for a Put Blob request under SharedKey auth.
    fn put_string_to_sign(&self, key: &str, content_length: usize, mime: &str, date: &str) -> String {
        let length = if content_length == 0 {
            String::new()
        } else {
            content_length.to_string()
        };
        format!(
            "PUT\n\n\n{length}\n\n{mime}\n\n\n\n\n\n\n\
             x-ms-blob-type:BlockBlob\n\
             x-ms-date:{date}\n\
             x-ms-version:{API_VERSION}\n\
             /{account}{path}",
            account = self.account,
            path = self.blob_path(key),
        )
    }

    /// Read-only service SAS for one blob, valid until `expiry`.
    fn sas_query(&self, key: &str, expiry: DateTime<Utc>) -> String {
        let se = expiry.to_rfc3339_opts(SecondsFormat::Secs, true);
        let resource = format!("/blob/{}/{}/{}", self.account, self.container, key);
        // sp, st, se, resource, si, sip, spr, sv, sr, snapshot, ses, rscc, rscd, rsce, rscl, rsct
        let string_to_sign =
            format!("r\n\n{se}\n{resource}\n\n\n\n{API_VERSION}\nb\n\n\n\n\n\n\n");
        let sig = self.sign(&string_to_sign);
        format!(
            "sv={API_VERSION}&sr=b&sp=r&se={}&sig={}",
            urlencoding::encode(&se),
            urlencoding::encode(&sig)
        )
    }
}

#[async_trait]
impl BlobStorage for AzureBlobStorage {
    async fn upload(&self, key: &str, bytes: Vec<u8>, mime: &str) -> Result<StoredObject> {
        validate_key(key)?;
        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        let signature = self.sign(&self.put_string_to_sign(key, bytes.len(), mime, &date));

        debug!(key, size = bytes.len(), "uploading blob");
        let resp = self
            .client
            .put(self.blob_url(key))
            .header("x-ms-blob-type", "BlockBlob")
            .header("x-ms-date", &date)
            .header("x-ms-version", API_VERSION)
            .header("content-type", mime)
            .header("authorization", format!("SharedKey {}:{}", self.account, signature))
            .body(bytes)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let message = resp.text().await.unwrap_or_default();
            warn!(status, key, "blob upload rejected");
            return Err(StorageError::Api { status, message });
        }

        Ok(StoredObject {
            key: key.to_string(),
            url: self.read_url(key).await?,
        })
    }

    async fn read_url(&self, key: &str) -> Result<String> {
        validate_key(key)?;
        let expiry = Utc::now() + self.sas_ttl;
        Ok(format!("{}?{}", self.blob_url(key), self.sas_query(key, expiry)))
    }
}
