use lopdf::{Dictionary, Document, Object, ObjectId};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tracing::info;

use crate::errors::{DigestError, Result};
use crate::models::dashboard::PageRule;
use crate::models::run::{ConsolidatedReport, ProcessedDocument};

/// Page attributes a page may inherit from its ancestors in the page tree.
const INHERITABLE: &[&[u8]] = &[b"Resources", b"MediaBox", b"CropBox", b"Rotate"];

fn load_pdf<P: AsRef<Path>>(path: P) -> std::result::Result<Document, lopdf::Error> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    Document::load_from(reader)
}

pub fn page_count<P: AsRef<Path>>(path: P) -> Result<u32> {
    let path = path.as_ref();
    let doc = load_pdf(path).map_err(|e| DigestError::pdf(path, e))?;
    Ok(doc.get_pages().len() as u32)
}

/// 1-indexed page numbers of a `total`-page document that `rule` removes.
pub fn pages_to_remove(rule: &PageRule, total: u32) -> Result<Vec<u32>> {
    match rule {
        PageRule::KeepAll => Ok(Vec::new()),
        PageRule::ExtractPage(index) => {
            if *index < 1 || *index > total {
                return Err(DigestError::PageIndexOutOfRange {
                    index: *index,
                    total,
                });
            }
            Ok((1..=total).filter(|p| p != index).collect())
        }
        PageRule::DropPages(pages) => {
            if let Some(&bad) = pages.iter().find(|&&p| p < 1 || p > total) {
                return Err(DigestError::PageIndexOutOfRange { index: bad, total });
            }
            if pages.len() as u32 >= total {
                return Err(DigestError::EmptyDocument { total });
            }
            Ok(pages.iter().copied().collect())
        }
        PageRule::DropLastPages(n) => {
            if *n >= total {
                return Err(DigestError::EmptyDocument { total });
            }
            Ok(((total - n + 1)..=total).collect())
        }
    }
}

/// Write the pages `rule` keeps from `source` into a new file at `destination`.
/// The source file is left untouched.
pub fn apply_rule(source: &Path, rule: &PageRule, destination: &Path) -> Result<ProcessedDocument> {
    let mut doc = load_pdf(source).map_err(|e| DigestError::pdf(source, e))?;
    let total = doc.get_pages().len() as u32;

    info!(
        "Applying '{}' to {} ({} page(s))",
        rule,
        source.display(),
        total
    );

    if let Some(parent) = destination.parent() {
        std::fs::create_dir_all(parent)?;
    }

    if *rule == PageRule::KeepAll {
        std::fs::copy(source, destination)?;
        return Ok(ProcessedDocument {
            path: destination.to_path_buf(),
            page_count: total,
        });
    }

    let remove = pages_to_remove(rule, total)?;
    doc.delete_pages(&remove);
    doc.prune_objects();
    doc.save(destination)
        .map_err(|e| DigestError::pdf(destination, e))?;

    let kept = doc.get_pages().len() as u32;
    info!("Wrote {} with {} page(s)", destination.display(), kept);

    Ok(ProcessedDocument {
        path: destination.to_path_buf(),
        page_count: kept,
    })
}

/// Concatenate `documents` in the given order into a single PDF at `output`,
/// replacing any previous file there.
pub fn merge_documents(documents: &[ProcessedDocument], output: &Path) -> Result<ConsolidatedReport> {
    if documents.is_empty() {
        return Err(DigestError::NothingToMerge);
    }

    info!("Merging {} PDF(s) into {}", documents.len(), output.display());

    let mut merged = Document::with_version("1.5");
    let mut next_id = 1;
    let mut pages: Vec<(ObjectId, Dictionary)> = Vec::new();

    for member in documents {
        let invalid = |reason: String| DigestError::MergeInputInvalid {
            document: member.path.clone(),
            reason,
        };

        let mut doc = load_pdf(&member.path).map_err(|e| invalid(e.to_string()))?;
        if doc.get_pages().is_empty() {
            return Err(invalid("document has no pages".into()));
        }

        doc.renumber_objects_with(next_id);
        next_id = doc.max_id + 1;

        // get_pages is keyed by page number, so this walks pages in reading order.
        for (_, page_id) in doc.get_pages() {
            let page = flatten_page(&doc, page_id).map_err(|e| invalid(e.to_string()))?;
            pages.push((page_id, page));
        }

        for (id, object) in doc.objects {
            let tree_node = matches!(
                node_type(&object),
                Some(b"Catalog" | b"Pages" | b"Page" | b"Outlines" | b"Outline")
            );
            if !tree_node {
                merged.objects.insert(id, object);
            }
        }
    }

    let pages_id: ObjectId = (next_id, 0);
    let catalog_id: ObjectId = (next_id + 1, 0);
    let mut kids = Vec::with_capacity(pages.len());
    let page_count = pages.len() as u32;

    for (id, mut page) in pages {
        page.set("Parent", Object::Reference(pages_id));
        merged.objects.insert(id, Object::Dictionary(page));
        kids.push(Object::Reference(id));
    }

    let mut pages_dict = Dictionary::new();
    pages_dict.set("Type", Object::Name(b"Pages".to_vec()));
    pages_dict.set("Kids", Object::Array(kids));
    pages_dict.set("Count", Object::Integer(page_count as i64));
    merged.objects.insert(pages_id, Object::Dictionary(pages_dict));

    let mut catalog = Dictionary::new();
    catalog.set("Type", Object::Name(b"Catalog".to_vec()));
    catalog.set("Pages", Object::Reference(pages_id));
    merged.objects.insert(catalog_id, Object::Dictionary(catalog));

    merged.trailer.set("Root", Object::Reference(catalog_id));
    merged.max_id = catalog_id.0;
    merged.prune_objects();
    merged.renumber_objects();
    merged.compress();

    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }
    merged
        .save(output)
        .map_err(|e| DigestError::pdf(output, e))?;

    info!(
        "Merged report {} has {} page(s)",
        output.display(),
        page_count
    );

    Ok(ConsolidatedReport {
        path: output.to_path_buf(),
        page_count,
        source_count: documents.len(),
    })
}

fn node_type(object: &Object) -> Option<&[u8]> {
    object.as_dict().ok()?.get(b"Type").ok()?.as_name().ok()
}

/// Copy of a page dictionary with inherited attributes made explicit, so the
/// page survives being re-parented under a new page tree.
fn flatten_page(doc: &Document, page_id: ObjectId) -> std::result::Result<Dictionary, lopdf::Error> {
    let mut page = doc.get_dictionary(page_id)?.clone();
    let mut parent = page.get(b"Parent").and_then(Object::as_reference).ok();

    while let Some(parent_id) = parent {
        let node = doc.get_dictionary(parent_id)?;
        for key in INHERITABLE {
            if !page.has(key) {
                if let Ok(value) = node.get(key) {
                    page.set(key.to_vec(), value.clone());
                }
            }
        }
        parent = node.get(b"Parent").and_then(Object::as_reference).ok();
    }

    Ok(page)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lopdf::{Stream, dictionary};
    use std::collections::BTreeSet;
    use std::path::PathBuf;

    /// Build a PDF whose pages carry a `Label` entry of `"<tag>-<n>"`.
    fn sample_pdf(path: &Path, tag: &str, pages: u32) -> PathBuf {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
        });
        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! { "F1" => font_id },
        });

        let mut kids: Vec<Object> = Vec::new();
        for n in 1..=pages {
            let body = format!("BT /F1 24 Tf 72 720 Td ({tag} page {n}) Tj ET");
            let content_id = doc.add_object(Stream::new(dictionary! {}, body.into_bytes()));
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
                "Label" => Object::string_literal(format!("{tag}-{n}")),
            });
            kids.push(page_id.into());
        }

        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => pages as i64,
                "Resources" => resources_id,
                "MediaBox" => vec![
                    Object::Integer(0),
                    Object::Integer(0),
                    Object::Integer(595),
                    Object::Integer(842),
                ],
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);
        doc.save(path).unwrap();
        path.to_path_buf()
    }

    fn labels(path: &Path) -> Vec<String> {
        let doc = load_pdf(path).unwrap();
        doc.get_pages()
            .values()
            .map(|id| {
                let page = doc.get_dictionary(*id).unwrap();
                let label = page.get(b"Label").unwrap().as_str().unwrap();
                String::from_utf8_lossy(label).into_owned()
            })
            .collect()
    }

    #[test]
    fn keep_all_is_a_copy_with_the_same_page_count() {
        let dir = tempfile::tempdir().unwrap();
        let src = sample_pdf(&dir.path().join("src.pdf"), "A", 4);
        let before = std::fs::read(&src).unwrap();

        let out = apply_rule(&src, &PageRule::KeepAll, &dir.path().join("out/a.pdf")).unwrap();

        assert_eq!(out.page_count, 4);
        assert_eq!(page_count(&out.path).unwrap(), 4);
        assert_eq!(std::fs::read(&src).unwrap(), before);
    }

    #[test]
    fn extract_page_keeps_exactly_that_page() {
        let dir = tempfile::tempdir().unwrap();
        let src = sample_pdf(&dir.path().join("src.pdf"), "A", 5);

        let out = apply_rule(&src, &PageRule::ExtractPage(2), &dir.path().join("a.pdf")).unwrap();

        assert_eq!(out.page_count, 1);
        assert_eq!(labels(&out.path), ["A-2"]);
        assert_eq!(page_count(&src).unwrap(), 5);
    }

    #[test]
    fn extract_page_outside_the_document_fails() {
        for index in [0, 6] {
            let err = pages_to_remove(&PageRule::ExtractPage(index), 5).unwrap_err();
            assert!(matches!(err, DigestError::PageIndexOutOfRange { total: 5, .. }));
        }
    }

    #[test]
    fn drop_pages_removes_the_listed_pages() {
        let dir = tempfile::tempdir().unwrap();
        let src = sample_pdf(&dir.path().join("src.pdf"), "B", 5);
        let rule = PageRule::DropPages(BTreeSet::from([2, 4]));

        let out = apply_rule(&src, &rule, &dir.path().join("b.pdf")).unwrap();

        assert_eq!(labels(&out.path), ["B-1", "B-3", "B-5"]);
    }

    #[test]
    fn drop_pages_validates_indices_and_emptiness() {
        let err = pages_to_remove(&PageRule::DropPages(BTreeSet::from([1, 9])), 5).unwrap_err();
        assert!(matches!(err, DigestError::PageIndexOutOfRange { index: 9, total: 5 }));

        let err = pages_to_remove(&PageRule::DropPages(BTreeSet::from([0])), 5).unwrap_err();
        assert!(matches!(err, DigestError::PageIndexOutOfRange { index: 0, .. }));

        let err = pages_to_remove(&PageRule::DropPages((1..=3).collect()), 3).unwrap_err();
        assert!(matches!(err, DigestError::EmptyDocument { total: 3 }));
    }

    #[test]
    fn drop_last_pages_leaves_total_minus_n() {
        for n in 0..5 {
            let removed = pages_to_remove(&PageRule::DropLastPages(n), 5).unwrap();
            assert_eq!(5 - removed.len() as u32, 5 - n);
        }
        for n in [5, 6] {
            let err = pages_to_remove(&PageRule::DropLastPages(n), 5).unwrap_err();
            assert!(matches!(err, DigestError::EmptyDocument { total: 5 }));
        }
    }

    #[test]
    fn drop_last_pages_writes_the_leading_pages() {
        let dir = tempfile::tempdir().unwrap();
        let src = sample_pdf(&dir.path().join("src.pdf"), "C", 5);

        let out = apply_rule(&src, &PageRule::DropLastPages(2), &dir.path().join("c.pdf")).unwrap();

        assert_eq!(labels(&out.path), ["C-1", "C-2", "C-3"]);
    }

    #[test]
    fn unreadable_source_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("broken.pdf");
        std::fs::write(&src, b"not a pdf").unwrap();

        let err = apply_rule(&src, &PageRule::ExtractPage(1), &dir.path().join("x.pdf")).unwrap_err();
        assert!(matches!(err, DigestError::Pdf { .. }));
    }

    #[test]
    fn merging_nothing_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = merge_documents(&[], &dir.path().join("out.pdf")).unwrap_err();
        assert!(matches!(err, DigestError::NothingToMerge));
    }

    #[test]
    fn merging_one_document_keeps_its_pages() {
        let dir = tempfile::tempdir().unwrap();
        let src = sample_pdf(&dir.path().join("a.pdf"), "A", 3);
        let doc = ProcessedDocument {
            path: src,
            page_count: 3,
        };

        let report = merge_documents(&[doc], &dir.path().join("out.pdf")).unwrap();

        assert_eq!(report.page_count, 3);
        assert_eq!(report.source_count, 1);
        assert_eq!(labels(&report.path), ["A-1", "A-2", "A-3"]);
    }

    #[test]
    fn merge_preserves_document_order_and_inherited_attributes() {
        let dir = tempfile::tempdir().unwrap();
        let docs: Vec<ProcessedDocument> = [("Z", 2), ("A", 1), ("M", 2)]
            .into_iter()
            .map(|(tag, pages)| ProcessedDocument {
                path: sample_pdf(&dir.path().join(format!("{tag}.pdf")), tag, pages),
                page_count: pages,
            })
            .collect();

        let report = merge_documents(&docs, &dir.path().join("out.pdf")).unwrap();

        assert_eq!(report.page_count, 5);
        assert_eq!(labels(&report.path), ["Z-1", "Z-2", "A-1", "M-1", "M-2"]);

        let merged = load_pdf(&report.path).unwrap();
        for id in merged.get_pages().values() {
            let page = merged.get_dictionary(*id).unwrap();
            assert!(page.has(b"MediaBox"));
            assert!(page.has(b"Resources"));
        }
    }

    #[test]
    fn merge_overwrites_a_previous_report() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.pdf");
        let a = ProcessedDocument {
            path: sample_pdf(&dir.path().join("a.pdf"), "A", 3),
            page_count: 3,
        };
        let b = ProcessedDocument {
            path: sample_pdf(&dir.path().join("b.pdf"), "B", 1),
            page_count: 1,
        };

        merge_documents(&[a], &out).unwrap();
        merge_documents(&[b], &out).unwrap();

        assert_eq!(labels(&out), ["B-1"]);
    }

    #[test]
    fn corrupt_member_is_identified() {
        let dir = tempfile::tempdir().unwrap();
        let good = ProcessedDocument {
            path: sample_pdf(&dir.path().join("good.pdf"), "G", 1),
            page_count: 1,
        };
        let bad_path = dir.path().join("bad.pdf");
        std::fs::write(&bad_path, b"%PDF-1.5 garbage").unwrap();
        let bad = ProcessedDocument {
            path: bad_path.clone(),
            page_count: 1,
        };

        let err = merge_documents(&[good, bad], &dir.path().join("out.pdf")).unwrap_err();
        assert!(matches!(err, DigestError::MergeInputInvalid { document, .. } if document == bad_path));
    }
}
