//! Payload decoding seam.
//!
//! Decoding a crop (QR text, barcode payload, a classifier label) is an
//! external capability. The engine only calls through this trait and attaches
//! whatever label comes back to the matched detection.

use crate::message::CropRecord;

pub trait CropDecoder: Send {
    /// Decoder identifier, for logs.
    fn name(&self) -> &'static str;

    /// Decode one crop. `None` when nothing readable was found.
    ///
    /// Implementations must treat the crop as read-only and must not retain it.
    fn decode(&mut self, crop: &CropRecord) -> Option<String>;
}
