//! XMP sidecar generation.
//!
//! Sidecars live next to the published file as `<name>.xmp` and carry the
//! metadata downstream catalog tools care about: caption, description,
//! creation date, and a rating derived from the favorite flag. A sidecar
//! written by another tool is never overwritten.

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use tokio::fs;

use crate::error::{SyncError, SyncResult};
use crate::photos::Asset;

const XMP_TOOLKIT: &str = concat!("icsync ", env!("CARGO_PKG_VERSION"));

/// Sidecar path for a published file: full name plus `.xmp`.
pub fn sidecar_path(published: &Path) -> std::path::PathBuf {
    let mut name = published
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".xmp");
    published.with_file_name(name)
}

/// Write the sidecar for a published file, unless a foreign sidecar is
/// already in place.
pub async fn write_sidecar(published: &Path, asset: &Asset) -> SyncResult<()> {
    let path = sidecar_path(published);

    if let Ok(existing) = fs::read_to_string(&path).await {
        if !existing.is_empty() && !existing.contains("x:xmptk=\"icsync") {
            tracing::info!(
                "Not overwriting XMP file {} created by another tool",
                path.display()
            );
            return Ok(());
        }
    }

    let doc = render_sidecar(asset);
    fs::write(&path, doc.as_bytes())
        .await
        .map_err(|e| SyncError::fs(&path, e))?;
    tracing::debug!("Wrote XMP sidecar {}", path.display());
    Ok(())
}

fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn render_sidecar(asset: &Asset) -> String {
    let mut description_block = String::new();
    if let Some(title) = asset.caption() {
        description_block.push_str(&format!(
            "   <dc:title><rdf:Alt><rdf:li xml:lang=\"x-default\">{}</rdf:li></rdf:Alt></dc:title>\n",
            xml_escape(title)
        ));
    }
    if let Some(desc) = asset.description() {
        description_block.push_str(&format!(
            "   <dc:description><rdf:Alt><rdf:li xml:lang=\"x-default\">{}</rdf:li></rdf:Alt></dc:description>\n",
            xml_escape(desc)
        ));
    }
    let create_date = format_date(asset.created_at());
    description_block.push_str(&format!(
        "   <xmp:CreateDate>{create_date}</xmp:CreateDate>\n"
    ));
    if asset.is_favorite() {
        description_block.push_str("   <xmp:Rating>5</xmp:Rating>\n");
    }

    format!(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n\
         <x:xmpmeta xmlns:x=\"adobe:ns:meta/\" x:xmptk=\"{XMP_TOOLKIT}\">\n\
         \x20<rdf:RDF xmlns:rdf=\"http://www.w3.org/1999/02/22-rdf-syntax-ns#\">\n\
         \x20\x20<rdf:Description rdf:about=\"\"\n\
         \x20\x20\x20\x20xmlns:dc=\"http://purl.org/dc/elements/1.1/\"\n\
         \x20\x20\x20\x20xmlns:xmp=\"http://ns.adobe.com/xap/1.0/\">\n\
         {description_block}\
         \x20\x20</rdf:Description>\n\
         \x20</rdf:RDF>\n\
         </x:xmpmeta>\n"
    )
}

fn format_date(date: DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::photos::{AssetItemType, RenditionSize};
    use std::collections::HashMap;

    fn asset() -> Asset {
        let created = DateTime::parse_from_rfc3339("2025-01-02T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        Asset::for_tests(
            "A1",
            Some("IMG_1.JPG"),
            AssetItemType::Image,
            created,
            created,
            HashMap::<RenditionSize, _>::new(),
        )
    }

    #[test]
    fn test_sidecar_path() {
        assert_eq!(
            sidecar_path(Path::new("/out/IMG_1.JPG")),
            std::path::PathBuf::from("/out/IMG_1.JPG.xmp")
        );
    }

    #[test]
    fn test_render_contains_create_date_and_toolkit() {
        let doc = render_sidecar(&asset());
        assert!(doc.contains("<xmp:CreateDate>2025-01-02T10:00:00Z</xmp:CreateDate>"));
        assert!(doc.contains("x:xmptk=\"icsync"));
        // Not a favorite: no rating element.
        assert!(!doc.contains("<xmp:Rating>"));
    }

    #[test]
    fn test_xml_escape() {
        assert_eq!(xml_escape("a<b>&\"c\""), "a&lt;b&gt;&amp;&quot;c&quot;");
    }

    #[tokio::test]
    async fn test_write_and_rewrite_own_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let published = dir.path().join("IMG_1.JPG");
        std::fs::write(&published, b"jpeg").unwrap();

        write_sidecar(&published, &asset()).await.unwrap();
        let path = sidecar_path(&published);
        let first = std::fs::read_to_string(&path).unwrap();
        assert!(first.contains("CreateDate"));

        // Our own sidecar may be refreshed.
        write_sidecar(&published, &asset()).await.unwrap();
    }

    #[tokio::test]
    async fn test_foreign_sidecar_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let published = dir.path().join("IMG_1.JPG");
        std::fs::write(&published, b"jpeg").unwrap();
        let path = sidecar_path(&published);
        let foreign = "<?xml version=\"1.0\"?><x:xmpmeta xmlns:x=\"adobe:ns:meta/\" x:xmptk=\"other-tool\"></x:xmpmeta>";
        std::fs::write(&path, foreign).unwrap();

        write_sidecar(&published, &asset()).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), foreign);
    }
}
