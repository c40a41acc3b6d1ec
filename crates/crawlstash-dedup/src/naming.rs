//! Derive the `original_name` of a record from its source URL.

use url::Url;

use crate::kind::ArtifactKind;

/// Last path segment of `source_identifier`, or a per-kind fallback when the
/// URL has none (`index.html` for pages, `document.bin` for documents without
/// a dotted file name). Query and fragment are ignored; percent-escapes are
/// kept as they appear.
pub fn derive_original_name(source_identifier: &str, kind: ArtifactKind) -> String {
    let segment = match Url::parse(source_identifier) {
        Ok(url) => url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .map(str::to_string),
        Err(_) => source_identifier
            .split(|c: char| c == '?' || c == '#')
            .next()
            .and_then(|path| path.rsplit('/').next())
            .map(str::to_string),
    }
    .unwrap_or_default();

    match kind {
        ArtifactKind::Document if segment.is_empty() || !segment.contains('.') => {
            format!("document.{}", kind.extension())
        }
        _ if segment.is_empty() => format!("index.{}", kind.extension()),
        _ => segment,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_names() {
        assert_eq!(derive_original_name("https://u.tg/a.html", ArtifactKind::RawPage), "a.html");
        assert_eq!(derive_original_name("https://u.tg/", ArtifactKind::RawPage), "index.html");
        assert_eq!(derive_original_name("https://u.tg", ArtifactKind::RawPage), "index.html");
        assert_eq!(
            derive_original_name("https://u.tg/news/item?id=3#top", ArtifactKind::RawPage),
            "item"
        );
        assert_eq!(derive_original_name("https://u.tg/", ArtifactKind::Converted), "index.md");
    }

    #[test]
    fn test_document_names() {
        assert_eq!(
            derive_original_name("https://u.tg/files/guide%202024.pdf", ArtifactKind::Document),
            "guide%202024.pdf"
        );
        assert_eq!(
            derive_original_name("https://u.tg/download?id=9", ArtifactKind::Document),
            "document.bin"
        );
    }

    #[test]
    fn test_unparseable_identifier_uses_last_segment() {
        assert_eq!(derive_original_name("local/path/a.html", ArtifactKind::RawPage), "a.html");
        assert_eq!(derive_original_name("", ArtifactKind::PageText), "index.txt");
    }
}
