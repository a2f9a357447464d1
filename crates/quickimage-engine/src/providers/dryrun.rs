use std::io::Cursor;

use async_trait::async_trait;
use image::{ImageFormat, Rgb, RgbImage};
use quickimage_contracts::models::{ImageModel, ProviderKind, UnsupportedModel};
use quickimage_contracts::runs::{GenerationRequest, ProviderOptions};
use sha2::{Digest, Sha256};

use super::{ImageProvider, RawImage};
use crate::error::GenerationError;

const DEFAULT_DIM: u32 = 1024;
const MAX_DIM: u32 = 4096;

/// Offline provider: a solid frame with a centred block, both colours taken
/// from a hash of the prompt. Same prompt, same bytes.
pub struct DryrunProvider;

impl DryrunProvider {
    fn parse_dims(size: Option<&str>) -> Result<(u32, u32), GenerationError> {
        let Some(raw) = size.map(str::trim).filter(|value| !value.is_empty()) else {
            return Ok((DEFAULT_DIM, DEFAULT_DIM));
        };
        let lowered = raw.to_ascii_lowercase();
        let parsed = lowered
            .split_once('x')
            .and_then(|(w, h)| Some((w.trim().parse::<u32>().ok()?, h.trim().parse::<u32>().ok()?)));
        match parsed {
            Some((width, height))
                if (1..=MAX_DIM).contains(&width) && (1..=MAX_DIM).contains(&height) =>
            {
                Ok((width, height))
            }
            _ => Err(GenerationError::InvalidRequest(format!(
                "size '{raw}' must be WIDTHxHEIGHT with both sides in 1..={MAX_DIM}"
            ))),
        }
    }

    fn render(prompt: &str, width: u32, height: u32) -> Result<Vec<u8>, GenerationError> {
        let digest = Sha256::digest(prompt.as_bytes());
        let background = Rgb([digest[0], digest[1], digest[2]]);
        // Inverted so the subject always contrasts with the frame.
        let subject = Rgb([255 - digest[0], 255 - digest[1], 255 - digest[2]]);
        let (x0, x1) = (width / 4, width - width / 4);
        let (y0, y1) = (height / 4, height - height / 4);
        let image = RgbImage::from_fn(width, height, |x, y| {
            if (x0..x1).contains(&x) && (y0..y1).contains(&y) {
                subject
            } else {
                background
            }
        });
        let mut bytes = Cursor::new(Vec::new());
        image
            .write_to(&mut bytes, ImageFormat::Png)
            .map_err(|err| GenerationError::invalid_response("dryrun", format!("png encode failed: {err}")))?;
        Ok(bytes.into_inner())
    }
}

#[async_trait]
impl ImageProvider for DryrunProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Dryrun
    }

    fn has_credentials(&self) -> bool {
        true
    }

    async fn generate(
        &self,
        model: ImageModel,
        request: &GenerationRequest,
    ) -> Result<RawImage, GenerationError> {
        if model != ImageModel::Dryrun {
            return Err(UnsupportedModel(model.name().to_string()).into());
        }
        let (width, height) = Self::parse_dims(request.provider_options.size.as_deref())?;
        let bytes = Self::render(&request.prompt, width, height)?;
        Ok(RawImage {
            bytes,
            mime_type: Some("image/png".to_string()),
            extension: "png",
            revised_prompt: None,
            temporary_url: None,
            applied: ProviderOptions {
                size: Some(format!("{width}x{height}")),
                output_format: Some("png".to_string()),
                ..ProviderOptions::default()
            },
        })
    }
}
