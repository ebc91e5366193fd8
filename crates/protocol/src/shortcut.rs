//! URL shortcut records.
//!
//! Shortcut files are served as redirects instead of as bytes. Three layouts
//! are understood: Windows `.url` files, freedesktop `.desktop` link entries
//! and macOS `.webloc` XML property lists. Only the `.url` layout is ever
//! written.

use crate::error::{ProtocolError, Result};

/// Section marker that opens an Internet shortcut record.
pub const INTERNET_SHORTCUT_SECTION: &str = "[InternetShortcut]";

/// Extension given to shortcut files created by the file manager.
pub const SHORTCUT_EXTENSION: &str = "url";

/// Schemes we are willing to redirect a browser to.
const ALLOWED_SCHEMES: &[&str] = &["http", "https", "ftp"];

/// Shortcut file layouts, keyed by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShortcutFormat {
    /// `.url`: INI-style `[InternetShortcut]` with a `URL=` key.
    InternetShortcut,
    /// `.desktop`: `[Desktop Entry]` with `Type=Link` and a `URL=` key.
    Desktop,
    /// `.webloc`: XML plist with a `URL` key.
    Webloc,
}

impl ShortcutFormat {
    /// Match a lower-cased file extension.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "url" => Some(Self::InternetShortcut),
            "desktop" => Some(Self::Desktop),
            "webloc" => Some(Self::Webloc),
            _ => None,
        }
    }
}

/// Encode a `.url` record.
///
/// The layout is fixed: section marker, `URL=` key, CRLF after each line.
pub fn encode_internet_shortcut(url: &str) -> String {
    format!("{INTERNET_SHORTCUT_SECTION}\r\nURL={url}\r\n")
}

/// Extract and validate the target URL from a shortcut file's content.
pub fn extract_url(format: ShortcutFormat, content: &str) -> Result<String> {
    let raw = match format {
        ShortcutFormat::InternetShortcut | ShortcutFormat::Desktop => ini_url(content)?,
        ShortcutFormat::Webloc => plist_url(content)?,
    };
    validate(raw)
}

fn ini_url(content: &str) -> Result<&str> {
    content
        .lines()
        .map(str::trim)
        .find_map(|line| {
            let (key, value) = line.split_once('=')?;
            key.trim().eq_ignore_ascii_case("url").then(|| value.trim())
        })
        .filter(|v| !v.is_empty())
        .ok_or(ProtocolError::MissingUrl)
}

fn plist_url(content: &str) -> Result<&str> {
    if content.starts_with("bplist") {
        return Err(ProtocolError::UnsupportedShortcut(
            "binary property list".to_string(),
        ));
    }

    let after_key = content
        .find("<key>URL</key>")
        .map(|i| &content[i + "<key>URL</key>".len()..])
        .ok_or(ProtocolError::MissingUrl)?;
    let start = after_key
        .find("<string>")
        .map(|i| i + "<string>".len())
        .ok_or(ProtocolError::MissingUrl)?;
    let end = after_key[start..]
        .find("</string>")
        .ok_or(ProtocolError::MissingUrl)?;

    let value = after_key[start..start + end].trim();
    if value.is_empty() {
        return Err(ProtocolError::MissingUrl);
    }
    Ok(value)
}

fn validate(raw: &str) -> Result<String> {
    // plist strings are XML-escaped
    let unescaped = raw.replace("&amp;", "&");
    let parsed =
        url::Url::parse(&unescaped).map_err(|e| ProtocolError::InvalidUrl(e.to_string()))?;
    if !ALLOWED_SCHEMES.contains(&parsed.scheme()) {
        return Err(ProtocolError::InvalidUrl(format!(
            "scheme not allowed: {}",
            parsed.scheme()
        )));
    }
    Ok(parsed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        assert_eq!(
            encode_internet_shortcut("https://example.com/"),
            "[InternetShortcut]\r\nURL=https://example.com/\r\n"
        );
    }

    #[test]
    fn test_encoded_record_extracts_back() {
        let record = encode_internet_shortcut("https://example.com/docs?a=1");
        let url = extract_url(ShortcutFormat::InternetShortcut, &record).unwrap();
        assert_eq!(url, "https://example.com/docs?a=1");
    }

    #[test]
    fn test_desktop_entry() {
        let content = "[Desktop Entry]\nEncoding=UTF-8\nName=Docs\nType=Link\nURL=http://docs.example.org/\nIcon=text-html\n";
        assert_eq!(
            extract_url(ShortcutFormat::Desktop, content).unwrap(),
            "http://docs.example.org/"
        );
    }

    #[test]
    fn test_webloc_plist() {
        let content = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
	<key>URL</key>
	<string>https://example.com/?a=1&amp;b=2</string>
</dict>
</plist>"#;
        assert_eq!(
            extract_url(ShortcutFormat::Webloc, content).unwrap(),
            "https://example.com/?a=1&b=2"
        );
    }

    #[test]
    fn test_binary_webloc_rejected() {
        let result = extract_url(ShortcutFormat::Webloc, "bplist00\u{1}\u{2}");
        assert!(matches!(
            result,
            Err(ProtocolError::UnsupportedShortcut(_))
        ));
    }

    #[test]
    fn test_missing_url() {
        let result = extract_url(ShortcutFormat::InternetShortcut, "[InternetShortcut]\r\n");
        assert_eq!(result, Err(ProtocolError::MissingUrl));
    }

    #[test]
    fn test_script_scheme_rejected() {
        let record = encode_internet_shortcut("javascript:alert(1)");
        let result = extract_url(ShortcutFormat::InternetShortcut, &record);
        assert!(matches!(result, Err(ProtocolError::InvalidUrl(_))));
    }

    #[test]
    fn test_from_extension() {
        assert_eq!(
            ShortcutFormat::from_extension("webloc"),
            Some(ShortcutFormat::Webloc)
        );
        assert_eq!(ShortcutFormat::from_extension("txt"), None);
    }
}
