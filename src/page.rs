//! A page image loaded into memory.

use image::ImageFormat;

use crate::prelude::*;

/// The raw bytes of one page, plus where they came from.
///
/// We keep the encoded bytes rather than a decoded image: OCR engines may
/// only want the path, and decoding is left to whoever needs pixels.
#[derive(Clone, Debug)]
pub struct PageImage {
    /// The source file.
    pub path: PathBuf,
    /// Encoded image data.
    pub data: Vec<u8>,
}

impl PageImage {
    /// Read a page from disk.
    pub async fn load(path: &Path) -> Result<Self> {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("cannot read page image {:?}", path))?;
        Ok(Self {
            path: path.to_owned(),
            data,
        })
    }

    /// The encoding of this page. We trust the file contents over the
    /// extension, but fall back to the extension for truncated headers.
    pub fn format(&self) -> Result<ImageFormat> {
        image::guess_format(&self.data)
            .or_else(|_| ImageFormat::from_path(&self.path))
            .with_context(|| format!("cannot determine image format of {:?}", self.path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_prefers_magic_bytes() {
        let page = PageImage {
            path: PathBuf::from("mislabelled.jpg"),
            data: b"\x89PNG\r\n\x1a\n".to_vec(),
        };
        assert_eq!(page.format().unwrap(), ImageFormat::Png);
    }

    #[test]
    fn format_falls_back_to_extension() {
        let page = PageImage {
            path: PathBuf::from("page.webp"),
            data: vec![],
        };
        assert_eq!(page.format().unwrap(), ImageFormat::WebP);
    }
}
