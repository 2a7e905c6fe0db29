//! XMP sidecar read/write discipline.
//!
//! A sidecar lives at `<image_path>.xmp` (double extension, e.g.
//! `photo.cr3.xmp`) and is the authoritative location for user-editable
//! metadata: the rating and the Subject (tag) list. The source image is
//! never written. Creating a new sidecar seeds it from the image's own
//! embedded XMP packet when one is present in the header, so existing
//! metadata carries over; updates edit the document in place and leave
//! unrelated content untouched.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use quick_xml::Reader;
use quick_xml::events::Event;
use tracing::{debug, warn};

use crate::error::{CoreError, Result};
use crate::util::{CONTENT_HASH_BYTES, dotted_extension};

use super::exif::embedded_xmp_packet;

/// Bytes of a sidecar worth reading; real sidecars are a few KB.
const SIDECAR_READ_LIMIT: usize = 64 * 1024;

/// `/dir/photo.cr3` → `/dir/photo.cr3.xmp`.
pub fn sidecar_path_for(image_path: &Path) -> PathBuf {
    let mut os = image_path.as_os_str().to_os_string();
    os.push(".xmp");
    PathBuf::from(os)
}

/// `/dir/photo.cr3.xmp` → `/dir/photo.cr3`, verified to exist with a
/// supported extension.
pub fn find_image_for_sidecar(
    xmp_path: &Path,
    supported_extensions: &HashSet<String>,
) -> Option<PathBuf> {
    let text = xmp_path.to_str()?;
    let candidate = PathBuf::from(text.strip_suffix(".xmp").or_else(|| text.strip_suffix(".XMP"))?);
    let ext = dotted_extension(&candidate)?;
    if supported_extensions.contains(&ext) && candidate.exists() {
        Some(candidate)
    } else {
        None
    }
}

/// User-editable fields carried by an XMP packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XmpFields {
    pub rating: Option<i64>,
    pub subjects: Vec<String>,
}

/// Pull rating and subject list out of an XMP document. Handles both the
/// attribute form (`xmp:Rating="3"`) and the element form
/// (`<xmp:Rating>3</xmp:Rating>`).
pub fn parse_xmp_fields(bytes: &[u8]) -> XmpFields {
    let mut fields = XmpFields::default();
    let mut reader = Reader::from_reader(bytes);
    let mut buf = Vec::new();
    let mut in_rating = false;
    let mut in_subject = false;
    let mut in_li = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => {
                let local = e.name().local_name().as_ref().to_vec();
                match local.as_slice() {
                    b"Description" => {
                        for attr in e.attributes().flatten() {
                            if attr.key.local_name().as_ref() == b"Rating"
                                && let Ok(value) = std::str::from_utf8(&attr.value)
                                && let Ok(rating) = value.trim().parse::<f64>()
                            {
                                fields.rating = Some(rating as i64);
                            }
                        }
                    }
                    b"Rating" => in_rating = true,
                    b"subject" => in_subject = true,
                    b"li" if in_subject => in_li = true,
                    _ => {}
                }
            }
            Ok(Event::Text(ref t)) => {
                if let Ok(text) = t.unescape() {
                    let text = text.trim();
                    if in_rating && !text.is_empty() {
                        if let Ok(rating) = text.parse::<f64>() {
                            fields.rating = Some(rating as i64);
                        }
                    } else if in_li && !text.is_empty() {
                        fields.subjects.push(text.to_string());
                    }
                }
            }
            Ok(Event::End(ref e)) => match e.name().local_name().as_ref() {
                b"Rating" => in_rating = false,
                b"subject" => in_subject = false,
                b"li" => in_li = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(err) => {
                debug!(error = %err, "stopping XMP parse on malformed input");
                break;
            }
            _ => {}
        }
        buf.clear();
    }
    fields
}

/// Read and parse the sidecar of `image_path`, if one exists.
pub async fn read_sidecar(image_path: &Path) -> Option<XmpFields> {
    let path = sidecar_path_for(image_path);
    let bytes = read_head(&path, SIDECAR_READ_LIMIT).await.ok()?;
    Some(parse_xmp_fields(&bytes))
}

/// Write `rating` to the sidecar, creating it if necessary.
pub async fn write_rating(image_path: &Path, rating: u8) -> Result<()> {
    if rating > 5 {
        return Err(CoreError::InvalidRating(rating as i64));
    }
    let document = load_or_seed(image_path).await?;
    let updated = upsert_rating(&document, rating);
    persist(image_path, updated).await
}

/// Replace the sidecar's Subject list with `tags`, creating the sidecar
/// if necessary. The old list is cleared before the new one is written,
/// keeping database and file in sync.
pub async fn write_tags(image_path: &Path, tags: &[String]) -> Result<()> {
    let document = load_or_seed(image_path).await?;
    let cleared = remove_block(&document, "<dc:subject", "</dc:subject>");
    let updated = insert_subject_list(&cleared, tags);
    persist(image_path, updated).await
}

async fn persist(image_path: &Path, document: String) -> Result<()> {
    let path = sidecar_path_for(image_path);
    tokio::fs::write(&path, document).await?;
    debug!(sidecar = %path.display(), "sidecar written");
    Ok(())
}

/// Existing sidecar content, or a new document seeded from the image's
/// embedded XMP packet (falling back to a minimal skeleton).
async fn load_or_seed(image_path: &Path) -> Result<String> {
    let sidecar = sidecar_path_for(image_path);
    if let Ok(bytes) = read_head(&sidecar, SIDECAR_READ_LIMIT).await {
        match String::from_utf8(bytes) {
            Ok(text) if text.contains("<rdf:Description") => return Ok(text),
            Ok(_) | Err(_) => {
                warn!(sidecar = %sidecar.display(), "unusable sidecar content; regenerating");
            }
        }
    }

    if let Ok(head) = read_head(image_path, CONTENT_HASH_BYTES).await
        && let Some(packet) = embedded_xmp_packet(&head)
        && let Ok(text) = std::str::from_utf8(packet)
        && text.contains("<rdf:Description")
    {
        debug!(image = %image_path.display(), "seeding sidecar from embedded XMP");
        return Ok(text.to_string());
    }
    Ok(minimal_template())
}

fn minimal_template() -> String {
    concat!(
        "<x:xmpmeta xmlns:x=\"adobe:ns:meta/\">\n",
        " <rdf:RDF xmlns:rdf=\"http://www.w3.org/1999/02/22-rdf-syntax-ns#\">\n",
        "  <rdf:Description rdf:about=\"\"\n",
        "    xmlns:xmp=\"http://ns.adobe.com/xap/1.0/\"\n",
        "    xmlns:dc=\"http://purl.org/dc/elements/1.1/\">\n",
        "  </rdf:Description>\n",
        " </rdf:RDF>\n",
        "</x:xmpmeta>\n",
    )
    .to_string()
}

fn upsert_rating(document: &str, rating: u8) -> String {
    // Element form first.
    if let Some(start) = document.find("<xmp:Rating>")
        && let Some(end) = document[start..].find("</xmp:Rating>")
    {
        let value_start = start + "<xmp:Rating>".len();
        let mut out = String::with_capacity(document.len() + 4);
        out.push_str(&document[..value_start]);
        out.push_str(&rating.to_string());
        out.push_str(&document[start + end..]);
        return out;
    }
    // Attribute form.
    if let Some(start) = document.find("xmp:Rating=\"") {
        let value_start = start + "xmp:Rating=\"".len();
        if let Some(quote) = document[value_start..].find('"') {
            let mut out = String::with_capacity(document.len() + 4);
            out.push_str(&document[..value_start]);
            out.push_str(&rating.to_string());
            out.push_str(&document[value_start + quote..]);
            return out;
        }
    }
    // Neither present: insert an element into the Description.
    let element = format!("  <xmp:Rating>{rating}</xmp:Rating>\n");
    insert_into_description(document, &element, "xmlns:xmp", XMP_NS_DECL)
}

fn insert_subject_list(document: &str, tags: &[String]) -> String {
    if tags.is_empty() {
        return document.to_string();
    }
    let mut block = String::from("  <dc:subject>\n   <rdf:Bag>\n");
    for tag in tags {
        block.push_str("    <rdf:li>");
        block.push_str(&escape_xml(tag));
        block.push_str("</rdf:li>\n");
    }
    block.push_str("   </rdf:Bag>\n  </dc:subject>\n");
    insert_into_description(document, &block, "xmlns:dc", DC_NS_DECL)
}

const XMP_NS_DECL: &str = " xmlns:xmp=\"http://ns.adobe.com/xap/1.0/\"";
const DC_NS_DECL: &str = " xmlns:dc=\"http://purl.org/dc/elements/1.1/\"";

/// Insert `content` just before `</rdf:Description>`, converting a
/// self-closing Description when needed and declaring `ns_decl` on it if
/// the namespace is not yet bound anywhere in the document.
fn insert_into_description(
    document: &str,
    content: &str,
    ns_attr: &str,
    ns_decl: &str,
) -> String {
    let mut document = document.to_string();

    let Some(desc_start) = document.find("<rdf:Description") else {
        // Degenerate input: fall back to a fresh skeleton carrying the
        // content.
        let skeleton = minimal_template();
        return insert_into_description(&skeleton, content, ns_attr, ns_decl);
    };

    // Bind the namespace on the Description element if missing.
    if !document.contains(ns_attr) {
        let head_end = desc_start
            + document[desc_start..]
                .find('>')
                .unwrap_or(document.len() - desc_start);
        let insert_at = if document[..head_end].ends_with('/') {
            head_end - 1
        } else {
            head_end
        };
        document.insert_str(insert_at, ns_decl);
    }

    if let Some(close) = document.find("</rdf:Description>") {
        document.insert_str(close, content);
        return document;
    }

    // Self-closing form: expand it.
    if let Some(head_end_rel) = document[desc_start..].find("/>") {
        let head_end = desc_start + head_end_rel;
        let mut out = String::with_capacity(document.len() + content.len() + 24);
        out.push_str(&document[..head_end]);
        out.push_str(">\n");
        out.push_str(content);
        out.push_str("  </rdf:Description>");
        out.push_str(&document[head_end + 2..]);
        return out;
    }
    document
}

/// Remove the first `start_tag`..`end_tag` block, inclusive.
fn remove_block(document: &str, start_tag: &str, end_tag: &str) -> String {
    let Some(start) = document.find(start_tag) else {
        return document.to_string();
    };
    let Some(end_rel) = document[start..].find(end_tag) else {
        return document.to_string();
    };
    let end = start + end_rel + end_tag.len();
    let mut out = String::with_capacity(document.len());
    out.push_str(&document[..start]);
    out.push_str(document[end..].trim_start_matches(['\n', ' ']));
    out
}

fn escape_xml(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

async fn read_head(path: &Path, limit: usize) -> std::io::Result<Vec<u8>> {
    use tokio::io::AsyncReadExt;
    let mut file = tokio::fs::File::open(path).await?;
    let mut buf = vec![0u8; limit];
    let mut filled = 0;
    loop {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
        if filled == buf.len() {
            break;
        }
    }
    buf.truncate(filled);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sidecar_path_uses_double_extension() {
        assert_eq!(
            sidecar_path_for(Path::new("/p/photo.cr3")),
            PathBuf::from("/p/photo.cr3.xmp")
        );
    }

    #[test]
    fn rating_roundtrips_through_fresh_document() {
        let doc = upsert_rating(&minimal_template(), 4);
        let fields = parse_xmp_fields(doc.as_bytes());
        assert_eq!(fields.rating, Some(4));
    }

    #[test]
    fn rating_update_replaces_existing_element() {
        let doc = upsert_rating(&minimal_template(), 2);
        let doc = upsert_rating(&doc, 5);
        let fields = parse_xmp_fields(doc.as_bytes());
        assert_eq!(fields.rating, Some(5));
        assert_eq!(doc.matches("<xmp:Rating>").count(), 1);
    }

    #[test]
    fn rating_update_replaces_attribute_form() {
        let doc = concat!(
            "<x:xmpmeta xmlns:x=\"adobe:ns:meta/\">\n",
            " <rdf:RDF xmlns:rdf=\"http://www.w3.org/1999/02/22-rdf-syntax-ns#\">\n",
            "  <rdf:Description rdf:about=\"\"\n",
            "    xmlns:xmp=\"http://ns.adobe.com/xap/1.0/\" xmp:Rating=\"1\"/>\n",
            " </rdf:RDF>\n",
            "</x:xmpmeta>\n",
        );
        let updated = upsert_rating(doc, 3);
        assert_eq!(parse_xmp_fields(updated.as_bytes()).rating, Some(3));
    }

    #[test]
    fn subject_list_is_replaced_not_merged() {
        let doc = insert_subject_list(&minimal_template(), &["alpha".into(), "beta".into()]);
        let fields = parse_xmp_fields(doc.as_bytes());
        assert_eq!(fields.subjects, vec!["alpha", "beta"]);

        let cleared = remove_block(&doc, "<dc:subject", "</dc:subject>");
        let doc = insert_subject_list(&cleared, &["gamma".into()]);
        let fields = parse_xmp_fields(doc.as_bytes());
        assert_eq!(fields.subjects, vec!["gamma"]);
    }

    #[test]
    fn tags_with_xml_specials_are_escaped() {
        let doc = insert_subject_list(&minimal_template(), &["a<b&c".into()]);
        let fields = parse_xmp_fields(doc.as_bytes());
        assert_eq!(fields.subjects, vec!["a<b&c"]);
    }
}
