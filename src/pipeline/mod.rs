//! Pipeline stages for appending a conversation page to a PDF archive.
//!
//! Each submodule implements exactly one step and can be tested on its own.
//!
//! ## Data Flow
//!
//! ```text
//! text ──▶ generate ──▶ scratch .html ──▶ render ──▶ scratch .pdf ──▶ merge ──▶ archive
//!          (comrak)                     (Chrome)                    (lopdf)
//! ```
//!
//! 1. [`markdown`] — Markdown → HTML fragment with highlighted code blocks
//! 2. [`generate`] — wraps the fragments in a standalone HTML document
//! 3. [`scratch`]  — owns the scratch file paths and removes them on every exit
//! 4. [`render`]   — prints the HTML to an A4 PDF in headless Chrome; runs in
//!    `spawn_blocking` because the CDP client is synchronous
//! 5. [`merge`]    — appends the rendered pages to the archive and replaces it
//!    atomically

pub mod generate;
pub mod markdown;
pub mod merge;
pub mod render;
pub mod scratch;

#[cfg(test)]
pub(crate) mod test_support {
    use lopdf::content::{Content, Operation};
    use lopdf::{Dictionary, Document, Object, Stream};

    /// A PDF with one A4 page per entry, each showing its text.
    ///
    /// `MediaBox` and `Resources` sit on the page tree node, so every page
    /// inherits them, as many producers do.
    pub fn pdf_with_pages(texts: &[&str]) -> Vec<u8> {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();

        let font_id = doc.add_object(Dictionary::from_iter([
            ("Type", Object::Name(b"Font".to_vec())),
            ("Subtype", Object::Name(b"Type1".to_vec())),
            ("BaseFont", Object::Name(b"Helvetica".to_vec())),
        ]));
        let resources_id = doc.add_object(Dictionary::from_iter([(
            "Font",
            Object::Dictionary(Dictionary::from_iter([("F1", Object::Reference(font_id))])),
        )]));

        let mut kids = Vec::new();
        for text in texts {
            let content = Content {
                operations: vec![
                    Operation::new("BT", vec![]),
                    Operation::new("Tf", vec!["F1".into(), 24.into()]),
                    Operation::new("Td", vec![72.into(), 760.into()]),
                    Operation::new("Tj", vec![Object::string_literal(*text)]),
                    Operation::new("ET", vec![]),
                ],
            };
            let content_id =
                doc.add_object(Stream::new(Dictionary::new(), content.encode().unwrap()));
            let page_id = doc.add_object(Dictionary::from_iter([
                ("Type", Object::Name(b"Page".to_vec())),
                ("Parent", Object::Reference(pages_id)),
                ("Contents", Object::Reference(content_id)),
            ]));
            kids.push(Object::Reference(page_id));
        }

        let count = kids.len() as i64;
        doc.objects.insert(
            pages_id,
            Object::Dictionary(Dictionary::from_iter([
                ("Type", Object::Name(b"Pages".to_vec())),
                ("Kids", Object::Array(kids)),
                ("Count", Object::Integer(count)),
                ("Resources", Object::Reference(resources_id)),
                (
                    "MediaBox",
                    Object::Array(vec![0.into(), 0.into(), 595.into(), 842.into()]),
                ),
            ])),
        );
        let catalog_id = doc.add_object(Dictionary::from_iter([
            ("Type", Object::Name(b"Catalog".to_vec())),
            ("Pages", Object::Reference(pages_id)),
        ]));
        doc.trailer.set("Root", Object::Reference(catalog_id));

        let mut out = Vec::new();
        doc.save_to(&mut out).unwrap();
        out
    }

    /// Decoded content stream of page `number` (1-based) of `doc`.
    pub fn page_content(doc: &Document, number: u32) -> String {
        let pages = doc.get_pages();
        let id = pages[&number];
        String::from_utf8_lossy(&doc.get_page_content(id).unwrap()).into_owned()
    }
}
