// tests/common/mod.rs
//
// Shared builders for integration tests: minimal PDFs and disclosures.
#![allow(dead_code)]

use chrono::{FixedOffset, TimeZone};
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, Stream};

use disclosure_pipeline::model::Disclosure;

/// A small valid PDF with one page per entry of `pages` and an Info title.
pub fn pdf_bytes(title: &str, pages: &[&str]) -> Vec<u8> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Courier",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! {
            "F1" => font_id,
        },
    });

    let mut kids: Vec<Object> = Vec::with_capacity(pages.len());
    for text in pages {
        let content = Content {
            operations: vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["F1".into(), 14.into()]),
                Operation::new("Td", vec![72.into(), 720.into()]),
                Operation::new("Tj", vec![Object::string_literal(*text)]),
                Operation::new("ET", vec![]),
            ],
        };
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
        });
        kids.push(page_id.into());
    }

    let pages_dict = dictionary! {
        "Type" => "Pages",
        "Kids" => kids,
        "Count" => pages.len() as i64,
        "Resources" => resources_id,
        "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
    };
    doc.objects.insert(pages_id, Object::Dictionary(pages_dict));
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);
    let info_id = doc.add_object(dictionary! {
        "Title" => Object::string_literal(title),
        "Producer" => Object::string_literal("integration tests"),
    });
    doc.trailer.set("Info", info_id);

    let mut out = Vec::new();
    doc.save_to(&mut out).unwrap();
    out
}

/// A price-sensitive disclosure announced 10 Nov 2025 09:15 AEDT.
pub fn disclosure(code: &str, url: &str) -> Disclosure {
    let aedt = FixedOffset::east_opt(11 * 3600).unwrap();
    Disclosure {
        issuer_code: code.to_string(),
        issuer_name: format!("{code} Limited"),
        title: format!("{code} Quarterly Activities Report"),
        announced_at: aedt.with_ymd_and_hms(2025, 11, 10, 9, 15, 0).unwrap(),
        document_url: url.to_string(),
        price_sensitive: true,
        page_count: Some(2),
        file_size: Some("120KB".into()),
        timestamp_estimated: false,
    }
}

pub fn listing_fixture() -> &'static str {
    include_str!("../fixtures/asx_announcements.html")
}
