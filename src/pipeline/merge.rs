//! Appending rendered pages to the archive PDF.
//!
//! The merge is done with `lopdf` at the object level: the new page's objects
//! are renumbered above the archive's highest object id and hung off the
//! archive's root page tree. Nothing else in the archive changes, so existing
//! pages, outlines and metadata survive byte-for-byte in content.
//!
//! The merged document is written to a temporary file next to the target and
//! renamed over it, so the archive on disk is either the old file or the
//! complete new one, never a partial write.
//!
//! Everything here is synchronous; the orchestrator calls it from
//! `spawn_blocking`.

use crate::error::MergeError;
use crate::output::{ArchiveMetadata, MergeSummary};
use lopdf::{Dictionary, Document, Object, ObjectId};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};

/// Page attributes a page may inherit from its ancestors in the page tree.
const INHERITABLE: [&[u8]; 4] = [b"Resources", b"MediaBox", b"CropBox", b"Rotate"];

/// Page trees deeper than this are treated as cyclic.
const MAX_TREE_DEPTH: usize = 64;

/// Append every page of `new_page` to `existing` and write the result to `target`.
///
/// When `existing` is `None` or names a file that does not exist yet, the new
/// page becomes the archive's initial content and is copied to `target`
/// unchanged.
///
/// `target` may be the existing archive itself. On error it is never modified.
pub fn merge_page(
    existing: Option<&Path>,
    new_page: &Path,
    target: &Path,
) -> Result<MergeSummary, MergeError> {
    let page_bytes = read_page(new_page)?;
    let page_doc = Document::load_mem(&page_bytes).map_err(|e| MergeError::InvalidPage {
        path: new_page.to_path_buf(),
        detail: e.to_string(),
    })?;
    let pages_added = page_doc.get_pages().len();
    if pages_added == 0 {
        return Err(MergeError::EmptyPage {
            path: new_page.to_path_buf(),
        });
    }

    let archive_path = match existing {
        Some(path) if path.exists() => path,
        _ => {
            write_atomically(target, |file| file.write_all(&page_bytes))?;
            info!(
                "Created archive {} with {} page(s)",
                target.display(),
                pages_added
            );
            return Ok(MergeSummary {
                pages_before: 0,
                pages_added,
                total_pages: pages_added,
                created: true,
            });
        }
    };

    let mut archive = load_archive(archive_path)?;
    let pages_before = archive.get_pages().len();

    append_pages(&mut archive, page_doc).map_err(|detail| MergeError::CorruptArchive {
        path: archive_path.to_path_buf(),
        detail,
    })?;

    let total_pages = archive.get_pages().len();
    if total_pages != pages_before + pages_added {
        return Err(MergeError::Internal(format!(
            "expected {} pages after merge, found {}",
            pages_before + pages_added,
            total_pages
        )));
    }

    write_atomically(target, |file| {
        archive
            .save_to(file)
            .map(|_| ())
            .map_err(|e| std::io::Error::other(e.to_string()))
    })?;

    info!(
        "Appended {} page(s) to {}: {} → {} pages",
        pages_added,
        target.display(),
        pages_before,
        total_pages
    );
    Ok(MergeSummary {
        pages_before,
        pages_added,
        total_pages,
        created: false,
    })
}

/// Read page count and document info from an archive without modifying it.
pub fn inspect_archive(path: &Path) -> Result<ArchiveMetadata, MergeError> {
    if !path.exists() {
        return Err(MergeError::ArchiveNotFound {
            path: path.to_path_buf(),
        });
    }
    let file_size = std::fs::metadata(path)
        .map(|m| m.len())
        .unwrap_or_default();
    let doc = load_archive_allow_encrypted(path)?;

    let info = doc
        .trailer
        .get(b"Info")
        .and_then(Object::as_reference)
        .and_then(|id| doc.get_dictionary(id))
        .ok();
    let field = |key: &[u8]| info.and_then(|d| d.get(key).ok()).and_then(text_string);

    Ok(ArchiveMetadata {
        title: field(b"Title"),
        author: field(b"Author"),
        creator: field(b"Creator"),
        producer: field(b"Producer"),
        page_count: doc.get_pages().len(),
        pdf_version: doc.version.clone(),
        is_encrypted: doc.is_encrypted(),
        file_size,
    })
}

fn read_page(path: &Path) -> Result<Vec<u8>, MergeError> {
    let bytes = std::fs::read(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => MergeError::MissingPage {
            path: path.to_path_buf(),
        },
        _ => MergeError::InvalidPage {
            path: path.to_path_buf(),
            detail: e.to_string(),
        },
    })?;
    if !bytes.starts_with(b"%PDF") {
        return Err(MergeError::InvalidPage {
            path: path.to_path_buf(),
            detail: "missing %PDF header".into(),
        });
    }
    Ok(bytes)
}

fn check_magic(path: &Path) -> Result<(), MergeError> {
    let mut file = std::fs::File::open(path).map_err(|e| MergeError::CorruptArchive {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })?;
    let mut magic = [0u8; 4];
    if file.read_exact(&mut magic).is_ok() && &magic != b"%PDF" {
        return Err(MergeError::NotAPdf {
            path: path.to_path_buf(),
            magic,
        });
    }
    Ok(())
}

fn load_archive_allow_encrypted(path: &Path) -> Result<Document, MergeError> {
    check_magic(path)?;
    Document::load(path).map_err(|e| MergeError::CorruptArchive {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })
}

fn load_archive(path: &Path) -> Result<Document, MergeError> {
    let doc = load_archive_allow_encrypted(path)?;
    ensure_unencrypted(&doc, path)?;
    debug!(
        "Loaded archive {} (PDF {}, {} objects)",
        path.display(),
        doc.version,
        doc.objects.len()
    );
    Ok(doc)
}

// Rewriting would silently drop the encryption.
fn ensure_unencrypted(doc: &Document, path: &Path) -> Result<(), MergeError> {
    if doc.is_encrypted() {
        return Err(MergeError::EncryptedArchive {
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

/// Move every page of `page_doc` to the end of `archive`'s root page tree.
fn append_pages(archive: &mut Document, mut page_doc: Document) -> Result<(), String> {
    let root_pages = root_pages_id(archive)?;

    // Imported pages get a new parent, so anything they inherited from their
    // old page tree has to move onto the page itself first.
    let source_pages: Vec<ObjectId> = page_doc.get_pages().into_values().collect();
    for page_id in source_pages {
        flatten_inherited(&mut page_doc, page_id).map_err(|e| e.to_string())?;
    }

    page_doc.renumber_objects_with(archive.max_id + 1);
    let new_pages: Vec<ObjectId> = page_doc.get_pages().into_values().collect();
    let skipped: Vec<ObjectId> = ["Root", "Info"]
        .iter()
        .filter_map(|key| page_doc.trailer.get(key.as_bytes()).ok())
        .filter_map(|obj| obj.as_reference().ok())
        .collect();
    let new_max_id = page_doc.max_id;

    for (id, object) in std::mem::take(&mut page_doc.objects) {
        if skipped.contains(&id) {
            continue;
        }
        if new_pages.contains(&id) {
            let Object::Dictionary(mut page) = object else {
                return Err(format!("page object {id:?} is not a dictionary"));
            };
            page.set("Parent", Object::Reference(root_pages));
            // Indexes into the rendered file's structure tree, which is not imported.
            page.remove(b"StructParents");
            archive.objects.insert(id, Object::Dictionary(page));
            continue;
        }
        match object.type_name().unwrap_or(b"") {
            b"Catalog" | b"Pages" | b"Outlines" | b"Outline" | b"StructTreeRoot"
            | b"StructElem" => {}
            _ => {
                archive.objects.insert(id, object);
            }
        }
    }
    archive.max_id = archive.max_id.max(new_max_id);

    let root = archive
        .get_dictionary_mut(root_pages)
        .map_err(|e| format!("root page tree: {e}"))?;
    let count = root
        .get(b"Count")
        .and_then(Object::as_i64)
        .map_err(|e| format!("root page tree /Count: {e}"))?;
    let kids = root
        .get_mut(b"Kids")
        .and_then(Object::as_array_mut)
        .map_err(|e| format!("root page tree /Kids: {e}"))?;
    kids.extend(new_pages.iter().map(|&id| Object::Reference(id)));
    root.set("Count", Object::Integer(count + new_pages.len() as i64));

    Ok(())
}

fn root_pages_id(doc: &Document) -> Result<ObjectId, String> {
    doc.trailer
        .get(b"Root")
        .and_then(Object::as_reference)
        .and_then(|id| doc.get_dictionary(id))
        .and_then(|catalog| catalog.get(b"Pages"))
        .and_then(Object::as_reference)
        .map_err(|e| format!("no page tree: {e}"))
}

fn flatten_inherited(doc: &mut Document, page_id: ObjectId) -> lopdf::Result<()> {
    let inherited: Vec<(&[u8], Object)> = {
        let page = doc.get_dictionary(page_id)?;
        INHERITABLE
            .iter()
            .filter(|key| !page.has(key))
            .filter_map(|&key| inherited_value(doc, page, key).map(|v| (key, v)))
            .collect()
    };
    if inherited.is_empty() {
        return Ok(());
    }
    let page = doc.get_dictionary_mut(page_id)?;
    for (key, value) in inherited {
        page.set(key, value);
    }
    Ok(())
}

fn inherited_value(doc: &Document, page: &Dictionary, key: &[u8]) -> Option<Object> {
    let mut parent = page.get(b"Parent").and_then(Object::as_reference).ok();
    for _ in 0..MAX_TREE_DEPTH {
        let node = doc.get_dictionary(parent?).ok()?;
        if let Ok(value) = node.get(key) {
            return Some(value.clone());
        }
        parent = node.get(b"Parent").and_then(Object::as_reference).ok();
    }
    None
}

/// Write `target` via a temporary file in the same directory, then rename.
fn write_atomically<F>(target: &Path, write: F) -> Result<(), MergeError>
where
    F: FnOnce(&mut std::fs::File) -> std::io::Result<()>,
{
    let write_err = |source: std::io::Error| MergeError::Write {
        path: target.to_path_buf(),
        source,
    };

    let dir = match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let mut tmp = NamedTempFile::new_in(&dir).map_err(write_err)?;
    write(tmp.as_file_mut()).map_err(write_err)?;
    // The replacement keeps the permissions of the file it replaces.
    if let Ok(existing) = std::fs::metadata(target) {
        tmp.as_file()
            .set_permissions(existing.permissions())
            .map_err(write_err)?;
    }
    tmp.as_file().sync_all().map_err(write_err)?;
    tmp.persist(target).map_err(|e| write_err(e.error))?;
    Ok(())
}

// PDF text strings are either UTF-16BE with a BOM or PDFDocEncoding, which
// matches Latin-1 for printable characters.
fn text_string(obj: &Object) -> Option<String> {
    let Object::String(bytes, _) = obj else {
        return None;
    };
    let text = match bytes.strip_prefix(&[0xFE, 0xFF]) {
        Some(utf16) => {
            let units: Vec<u16> = utf16
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect();
            String::from_utf16_lossy(&units)
        }
        None => bytes.iter().map(|&b| char::from(b)).collect(),
    };
    let text = text.trim().to_string();
    (!text.is_empty()).then_some(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::test_support::{page_content, pdf_with_pages};

    fn write(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    /// One page carrying a structure tree, the way Chrome tags its output.
    fn tagged_pdf(text: &str) -> Vec<u8> {
        let mut doc = Document::load_mem(&pdf_with_pages(&[text])).unwrap();
        let page_id = doc.get_pages()[&1];
        doc.get_dictionary_mut(page_id)
            .unwrap()
            .set("StructParents", Object::Integer(0));

        let elem_id = doc.add_object(Dictionary::from_iter([
            ("Type", Object::Name(b"StructElem".to_vec())),
            ("S", Object::Name(b"P".to_vec())),
            ("Pg", Object::Reference(page_id)),
            ("K", Object::Integer(0)),
        ]));
        let tree_id = doc.add_object(Dictionary::from_iter([
            ("Type", Object::Name(b"StructTreeRoot".to_vec())),
            ("K", Object::Reference(elem_id)),
        ]));
        let catalog_id = doc.trailer.get(b"Root").unwrap().as_reference().unwrap();
        let catalog = doc.get_dictionary_mut(catalog_id).unwrap();
        catalog.set("StructTreeRoot", Object::Reference(tree_id));
        catalog.set(
            "MarkInfo",
            Object::Dictionary(Dictionary::from_iter([("Marked", Object::Boolean(true))])),
        );

        let mut out = Vec::new();
        doc.save_to(&mut out).unwrap();
        out
    }

    #[test]
    fn first_page_is_copied_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let page_bytes = pdf_with_pages(&["Hello"]);
        let page = write(dir.path(), "_temp_page.pdf", &page_bytes);
        let archive = dir.path().join("archive.pdf");

        let summary = merge_page(Some(&archive), &page, &archive).unwrap();

        assert!(summary.created);
        assert_eq!(summary.total_pages, 1);
        assert_eq!(std::fs::read(&archive).unwrap(), page_bytes);
    }

    #[test]
    fn no_existing_archive_copies_to_target() {
        let dir = tempfile::tempdir().unwrap();
        let page = write(dir.path(), "p.pdf", &pdf_with_pages(&["Hello"]));
        let target = dir.path().join("new.pdf");

        let summary = merge_page(None, &page, &target).unwrap();
        assert_eq!(summary.pages_before, 0);
        assert!(target.exists());
    }

    #[test]
    fn append_keeps_order_and_existing_content() {
        let dir = tempfile::tempdir().unwrap();
        let archive = write(dir.path(), "archive.pdf", &pdf_with_pages(&["Hello"]));
        let before = page_content(&Document::load(&archive).unwrap(), 1);
        let page = write(dir.path(), "p.pdf", &pdf_with_pages(&["World"]));

        let summary = merge_page(Some(&archive), &page, &archive).unwrap();
        assert_eq!(
            summary,
            MergeSummary {
                pages_before: 1,
                pages_added: 1,
                total_pages: 2,
                created: false,
            }
        );

        let merged = Document::load(&archive).unwrap();
        assert_eq!(merged.get_pages().len(), 2);
        assert_eq!(page_content(&merged, 1), before);
        assert!(page_content(&merged, 2).contains("World"));
    }

    #[test]
    fn inherited_attributes_move_onto_imported_pages() {
        let dir = tempfile::tempdir().unwrap();
        let archive = write(dir.path(), "archive.pdf", &pdf_with_pages(&["a"]));
        let page = write(dir.path(), "p.pdf", &pdf_with_pages(&["b"]));

        merge_page(Some(&archive), &page, &archive).unwrap();

        let merged = Document::load(&archive).unwrap();
        let pages = merged.get_pages();
        let imported = merged.get_dictionary(pages[&2]).unwrap();
        assert!(imported.has(b"MediaBox"));
        assert!(imported.has(b"Resources"));
    }

    #[test]
    fn multi_page_render_is_appended_whole() {
        let dir = tempfile::tempdir().unwrap();
        let archive = write(dir.path(), "archive.pdf", &pdf_with_pages(&["1", "2"]));
        let page = write(dir.path(), "p.pdf", &pdf_with_pages(&["3", "4"]));

        let summary = merge_page(Some(&archive), &page, &archive).unwrap();
        assert_eq!(summary.total_pages, 4);

        let merged = Document::load(&archive).unwrap();
        assert!(page_content(&merged, 3).contains('3'));
        assert!(page_content(&merged, 4).contains('4'));
    }

    #[test]
    fn repeated_appends_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("archive.pdf");
        for (i, text) in ["one", "two", "three"].iter().enumerate() {
            let page = write(dir.path(), "p.pdf", &pdf_with_pages(&[*text]));
            let summary = merge_page(Some(&archive), &page, &archive).unwrap();
            assert_eq!(summary.total_pages, i + 1);
        }
        let merged = Document::load(&archive).unwrap();
        assert!(page_content(&merged, 1).contains("one"));
        assert!(page_content(&merged, 3).contains("three"));
    }

    #[test]
    fn separate_target_leaves_source_alone() {
        let dir = tempfile::tempdir().unwrap();
        let original = pdf_with_pages(&["Hello"]);
        let archive = write(dir.path(), "archive.pdf", &original);
        let page = write(dir.path(), "p.pdf", &pdf_with_pages(&["World"]));
        let target = dir.path().join("out.pdf");

        merge_page(Some(&archive), &page, &target).unwrap();

        assert_eq!(std::fs::read(&archive).unwrap(), original);
        assert_eq!(Document::load(&target).unwrap().get_pages().len(), 2);
    }

    #[test]
    fn corrupt_archive_is_left_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let garbage = b"%PDF-1.7\nthis is not really a pdf".to_vec();
        let archive = write(dir.path(), "archive.pdf", &garbage);
        let page = write(dir.path(), "p.pdf", &pdf_with_pages(&["World"]));

        let err = merge_page(Some(&archive), &page, &archive).unwrap_err();
        assert!(matches!(err, MergeError::CorruptArchive { .. }), "got: {err}");
        assert_eq!(std::fs::read(&archive).unwrap(), garbage);
    }

    #[test]
    fn non_pdf_archive_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let archive = write(dir.path(), "notes.pdf", b"hello world");
        let page = write(dir.path(), "p.pdf", &pdf_with_pages(&["World"]));

        let err = merge_page(Some(&archive), &page, &archive).unwrap_err();
        assert!(matches!(err, MergeError::NotAPdf { magic, .. } if &magic == b"hell"));
        assert_eq!(std::fs::read(&archive).unwrap(), b"hello world");
    }

    #[test]
    fn missing_page_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let archive = write(dir.path(), "archive.pdf", &pdf_with_pages(&["Hello"]));
        let err = merge_page(Some(&archive), &dir.path().join("nope.pdf"), &archive).unwrap_err();
        assert!(matches!(err, MergeError::MissingPage { .. }));
    }

    #[test]
    fn invalid_page_does_not_create_archive() {
        let dir = tempfile::tempdir().unwrap();
        let page = write(dir.path(), "p.pdf", b"<html>oops</html>");
        let archive = dir.path().join("archive.pdf");

        let err = merge_page(Some(&archive), &page, &archive).unwrap_err();
        assert!(matches!(err, MergeError::InvalidPage { .. }));
        assert!(!archive.exists());
    }

    #[test]
    fn no_temp_files_left_after_merge() {
        let dir = tempfile::tempdir().unwrap();
        let archive = write(dir.path(), "archive.pdf", &pdf_with_pages(&["a"]));
        let page = write(dir.path(), "p.pdf", &pdf_with_pages(&["b"]));
        merge_page(Some(&archive), &page, &archive).unwrap();

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 2, "unexpected files: {names:?}");
    }

    #[test]
    fn page_without_pages_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let original = pdf_with_pages(&["Hello"]);
        let archive = write(dir.path(), "archive.pdf", &original);
        let page = write(dir.path(), "p.pdf", &pdf_with_pages(&[]));

        let err = merge_page(Some(&archive), &page, &archive).unwrap_err();
        assert!(matches!(err, MergeError::EmptyPage { .. }), "got: {err}");
        assert_eq!(std::fs::read(&archive).unwrap(), original);

        let fresh = dir.path().join("fresh.pdf");
        assert!(merge_page(None, &page, &fresh).is_err());
        assert!(!fresh.exists());
    }

    #[test]
    fn unwritable_target_leaves_archive_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let original = pdf_with_pages(&["Hello"]);
        let archive = write(dir.path(), "archive.pdf", &original);
        let page = write(dir.path(), "p.pdf", &pdf_with_pages(&["World"]));
        let target = dir.path().join("missing/out.pdf");

        let err = merge_page(Some(&archive), &page, &target).unwrap_err();
        assert!(
            matches!(&err, MergeError::Write { path, .. } if path == &target),
            "got: {err}"
        );
        assert_eq!(std::fs::read(&archive).unwrap(), original);
        assert!(!dir.path().join("missing").exists());
    }

    #[test]
    fn encrypted_archive_is_refused() {
        let mut doc = Document::load_mem(&pdf_with_pages(&["secret"])).unwrap();
        let path = Path::new("locked.pdf");
        assert!(ensure_unencrypted(&doc, path).is_ok());

        let encrypt_id = doc.add_object(Dictionary::from_iter([
            ("Filter", Object::Name(b"Standard".to_vec())),
            ("V", Object::Integer(2)),
            ("R", Object::Integer(3)),
        ]));
        doc.trailer.set("Encrypt", Object::Reference(encrypt_id));

        let err = ensure_unencrypted(&doc, path).unwrap_err();
        assert!(matches!(err, MergeError::EncryptedArchive { .. }), "got: {err}");
    }

    #[cfg(unix)]
    #[test]
    fn append_keeps_archive_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let archive = write(dir.path(), "archive.pdf", &pdf_with_pages(&["Hello"]));
        std::fs::set_permissions(&archive, std::fs::Permissions::from_mode(0o644)).unwrap();
        let page = write(dir.path(), "p.pdf", &pdf_with_pages(&["World"]));

        merge_page(Some(&archive), &page, &archive).unwrap();

        let mode = std::fs::metadata(&archive).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o644);
    }

    #[test]
    fn structure_tree_of_tagged_page_is_not_imported() {
        let dir = tempfile::tempdir().unwrap();
        let archive = write(dir.path(), "archive.pdf", &pdf_with_pages(&["Hello"]));
        let page = write(dir.path(), "p.pdf", &tagged_pdf("World"));

        merge_page(Some(&archive), &page, &archive).unwrap();

        let merged = Document::load(&archive).unwrap();
        let imported = merged.get_dictionary(merged.get_pages()[&2]).unwrap();
        assert!(!imported.has(b"StructParents"));
        let structure = merged
            .objects
            .values()
            .filter(|o| matches!(o.type_name(), Ok(b"StructTreeRoot" | b"StructElem")))
            .count();
        assert_eq!(structure, 0);
    }

    #[test]
    fn inspect_reports_page_count() {
        let dir = tempfile::tempdir().unwrap();
        let archive = write(dir.path(), "archive.pdf", &pdf_with_pages(&["a", "b", "c"]));
        let meta = inspect_archive(&archive).unwrap();
        assert_eq!(meta.page_count, 3);
        assert_eq!(meta.pdf_version, "1.5");
        assert!(!meta.is_encrypted);
        assert!(meta.file_size > 0);
        assert_eq!(meta.title, None);
    }

    #[test]
    fn inspect_missing_archive() {
        assert!(matches!(
            inspect_archive(Path::new("/definitely/not/here.pdf")),
            Err(MergeError::ArchiveNotFound { .. })
        ));
    }

    #[test]
    fn text_strings_decode() {
        let latin = Object::string_literal("Chat log");
        assert_eq!(text_string(&latin).as_deref(), Some("Chat log"));

        let mut utf16 = vec![0xFE, 0xFF];
        for unit in "Ünïcode".encode_utf16() {
            utf16.extend_from_slice(&unit.to_be_bytes());
        }
        let obj = Object::String(utf16, lopdf::StringFormat::Hexadecimal);
        assert_eq!(text_string(&obj).as_deref(), Some("Ünïcode"));

        assert_eq!(text_string(&Object::Integer(3)), None);
    }
}
