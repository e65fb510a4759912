//! Mobile Image Mounter
//!
//! Uploads and mounts personalized developer images and answers the
//! personalization queries that precede a mount on modern devices.

use log::debug;

use crate::plist::{Dictionary, PlistValue};
use crate::RemoteXpcError;

use super::{RsdServiceClient, ServiceConnection};

/// Client for the mobile image mounter service
///
/// Runs over a dedicated lockdown-style plist session advertised through
/// RSD.
pub struct ImageMounterService {
    pub service: ServiceConnection,
}

impl RsdServiceClient for ImageMounterService {
    fn service_name() -> &'static str {
        "com.apple.mobile.mobile_image_mounter.shim.remote"
    }

    fn from_service(service: ServiceConnection) -> Self {
        Self { service }
    }
}

impl ImageMounterService {
    /// Image type used for personalized developer images
    pub const PERSONALIZED: &'static str = "Personalized";

    pub fn new(service: ServiceConnection) -> Self {
        Self { service }
    }

    /// Retrieves the signatures of mounted images
    ///
    /// # Arguments
    /// * `image_type` - Restricts the lookup to one image type
    pub async fn lookup(
        &mut self,
        image_type: Option<&str>,
    ) -> Result<Vec<Vec<u8>>, RemoteXpcError> {
        let mut req = Dictionary::new();
        req.insert("Command", "LookupImage");
        req.insert("ImageType", image_type.unwrap_or(Self::PERSONALIZED));
        let mut res = self
            .service
            .send_plist_request(&PlistValue::Dictionary(req), None)
            .await?;

        let signatures = match res.remove("ImageSignature") {
            Some(PlistValue::Array(entries)) => entries
                .into_iter()
                .filter_map(|e| e.into_data())
                .collect(),
            Some(PlistValue::Data(d)) => vec![d],
            _ => Vec::new(),
        };
        Ok(signatures)
    }

    /// Whether a personalized image is currently mounted
    pub async fn is_personalized_image_mounted(&mut self) -> Result<bool, RemoteXpcError> {
        Ok(!self.lookup(Some(Self::PERSONALIZED)).await?.is_empty())
    }

    /// Retrieves a list of currently mounted devices
    pub async fn copy_devices(&mut self) -> Result<Vec<PlistValue>, RemoteXpcError> {
        let req = crate::plist!({ "Command": "CopyDevices" });
        let mut res = self.service.send_plist_request(&req, None).await?;
        match res.remove("EntryList") {
            Some(PlistValue::Array(entries)) => Ok(entries),
            _ => Err(RemoteXpcError::MissingField("EntryList")),
        }
    }

    /// Queries the personalization nonce
    pub async fn query_nonce(
        &mut self,
        personalized_image_type: Option<&str>,
    ) -> Result<Vec<u8>, RemoteXpcError> {
        let mut req = Dictionary::new();
        req.insert("Command", "QueryNonce");
        if let Some(image_type) = personalized_image_type {
            req.insert("PersonalizedImageType", image_type);
        }
        let mut res = self
            .service
            .send_plist_request(&PlistValue::Dictionary(req), None)
            .await?;
        match res.remove("PersonalizationNonce") {
            Some(PlistValue::Data(d)) => Ok(d),
            _ => Err(RemoteXpcError::MissingField("PersonalizationNonce")),
        }
    }

    /// Queries the identifiers personalization requests must carry
    pub async fn query_personalization_identifiers(
        &mut self,
    ) -> Result<Dictionary, RemoteXpcError> {
        let req = crate::plist!({
            "Command": "QueryPersonalizationIdentifiers",
            "PersonalizedImageType": Self::PERSONALIZED,
        });
        let mut res = self.service.send_plist_request(&req, None).await?;
        match res
            .remove("PersonalizationIdentifiers")
            .and_then(|x| x.into_dictionary())
        {
            Some(d) => Ok(d),
            None => Err(RemoteXpcError::MissingField("PersonalizationIdentifiers")),
        }
    }

    /// Retrieves a previously personalized manifest for an image, when the
    /// device has one cached
    pub async fn query_personalization_manifest(
        &mut self,
        image_type: &str,
        signature: Vec<u8>,
    ) -> Result<Vec<u8>, RemoteXpcError> {
        let req = crate::plist!({
            "Command": "QueryPersonalizationManifest",
            "PersonalizedImageType": image_type,
            "ImageType": image_type,
            "ImageSignature": signature,
        });
        let mut res = self.service.send_plist_request(&req, None).await?;
        match res.remove("ImageSignature") {
            Some(PlistValue::Data(d)) => Ok(d),
            _ => Err(RemoteXpcError::MissingField("ImageSignature")),
        }
    }

    /// Queries whether developer mode is enabled on the device
    pub async fn query_developer_mode_status(&mut self) -> Result<bool, RemoteXpcError> {
        let req = crate::plist!({ "Command": "QueryDeveloperModeStatus" });
        let res = self.service.send_plist_request(&req, None).await?;
        match res
            .get("DeveloperModeStatus")
            .and_then(|x| x.as_boolean())
        {
            Some(status) => Ok(status),
            None => Err(RemoteXpcError::MissingField("DeveloperModeStatus")),
        }
    }

    /// Uploads and mounts a personalized image
    ///
    /// # Arguments
    /// * `image` - The image bytes
    /// * `manifest` - The personalized (TSS-signed) manifest, used as the
    ///   image signature
    /// * `trust_cache` - The image trust cache
    pub async fn mount(
        &mut self,
        image: &[u8],
        manifest: Vec<u8>,
        trust_cache: Vec<u8>,
    ) -> Result<(), RemoteXpcError> {
        self.upload_image(Self::PERSONALIZED, image, manifest.clone())
            .await?;

        let req = crate::plist!({
            "Command": "MountImage",
            "ImageType": Self::PERSONALIZED,
            "ImageSignature": manifest,
            "ImageTrustCache": trust_cache,
        });
        let res = self.service.send_plist_request(&req, None).await?;
        expect_status(&res, "Complete")
    }

    /// Unmounts the image at a mount path
    ///
    /// `/System/Developer` for personalized images, `/Developer` for the
    /// pre-iOS 17 developer images.
    pub async fn unmount_image(&mut self, mount_path: &str) -> Result<(), RemoteXpcError> {
        let req = crate::plist!({
            "Command": "UnmountImage",
            "MountPath": mount_path,
        });
        let res = self.service.send_plist_request(&req, None).await?;
        expect_status(&res, "Complete")
    }

    /// Streams image bytes to the device
    async fn upload_image(
        &mut self,
        image_type: &str,
        image: &[u8],
        signature: Vec<u8>,
    ) -> Result<(), RemoteXpcError> {
        let req = crate::plist!({
            "Command": "ReceiveBytes",
            "ImageType": image_type,
            "ImageSize": image.len() as u64,
            "ImageSignature": signature,
        });
        let res = self.service.send_plist_request(&req, None).await?;
        expect_status(&res, "ReceiveBytesAck")?;

        debug!("Sending {} image bytes", image.len());
        self.service.conn.send_raw(image).await?;

        let res = self.service.read_plist().await?;
        expect_status(&res, "Complete")
    }

    pub async fn close(&mut self) {
        self.service.close().await;
    }
}

fn expect_status(res: &Dictionary, wanted: &str) -> Result<(), RemoteXpcError> {
    match res.get("Status").and_then(|x| x.as_string()) {
        Some(status) if status == wanted => Ok(()),
        _ => Err(RemoteXpcError::UnexpectedResponse),
    }
}
