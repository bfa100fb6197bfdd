use lopdf::{Document, Object};

use super::{ExtractedDocument, TextExtractor};
use crate::model::DocumentMetadata;

/// PDF text extraction backed by `lopdf`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PdfTextExtractor;

impl TextExtractor for PdfTextExtractor {
    fn extract(&self, bytes: &[u8]) -> Result<ExtractedDocument, String> {
        let doc = Document::load_mem(bytes).map_err(|e| e.to_string())?;
        let pages = doc.get_pages();

        let mut texts = Vec::with_capacity(pages.len());
        for number in pages.keys() {
            match doc.extract_text(&[*number]) {
                Ok(t) => texts.push(t),
                Err(e) => {
                    tracing::warn!(target: "converter", page = *number, "page text extraction failed: {e}");
                    texts.push(String::new());
                }
            }
        }

        let metadata = DocumentMetadata {
            num_pages: pages.len(),
            file_size: bytes.len(),
            title: info_field(&doc, b"Title"),
            author: info_field(&doc, b"Author"),
            subject: info_field(&doc, b"Subject"),
            creation_date: info_field(&doc, b"CreationDate"),
            producer: info_field(&doc, b"Producer"),
        };
        Ok(ExtractedDocument { pages: texts, metadata })
    }
}

/// A string entry of the Info dictionary, or empty when absent or malformed.
fn info_field(doc: &Document, key: &[u8]) -> String {
    let info = match doc.trailer.get(b"Info") {
        Ok(Object::Reference(id)) => doc.get_object(*id).ok(),
        Ok(obj) => Some(obj),
        Err(_) => None,
    };
    let Some(dict) = info.and_then(|o| o.as_dict().ok()) else {
        return String::new();
    };
    let value = match dict.get(key) {
        Ok(Object::Reference(id)) => doc.get_object(*id).ok(),
        Ok(obj) => Some(obj),
        Err(_) => None,
    };
    match value {
        Some(Object::String(raw, _)) => decode_pdf_string(raw).trim().to_string(),
        Some(Object::Name(raw)) => String::from_utf8_lossy(raw).trim().to_string(),
        _ => String::new(),
    }
}

/// UTF-16BE when BOM-prefixed, otherwise one byte per char.
pub(crate) fn decode_pdf_string(raw: &[u8]) -> String {
    if raw.len() >= 2 && raw[0] == 0xFE && raw[1] == 0xFF {
        let units: Vec<u16> = raw[2..]
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();
        return String::from_utf16_lossy(&units);
    }
    raw.iter().map(|&b| b as char).collect()
}
