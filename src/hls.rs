//! Line-oriented HLS manifest parsing and URI rewriting.
//!
//! A manifest is a sequence of tag lines (`#EXT...`), comments, blanks and
//! URI lines. Rewriting substitutes URI lines and the quoted `URI="..."`
//! attribute of the few tags that carry one; every other byte, including
//! line order and line endings, is preserved.

use url::Url;

/// What a referenced URI points at, which decides how it is proxied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UriKind {
  Manifest,
  Segment,
  Key,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Line<'a> {
  Blank(&'a str),
  Tag(&'a str),
  Comment(&'a str),
  Uri(&'a str),
}

impl<'a> Line<'a> {
  pub fn classify(raw: &'a str) -> Self {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
      Line::Blank(raw)
    } else if trimmed.starts_with("#EXT") {
      Line::Tag(raw)
    } else if trimmed.starts_with('#') {
      Line::Comment(raw)
    } else {
      Line::Uri(raw)
    }
  }
}

/// Split into lines without losing the final newline or `\r`.
pub fn lines(text: &str) -> impl Iterator<Item = Line<'_>> {
  text.split('\n').map(Line::classify)
}

/// Whether the payload looks like an HLS manifest.
pub fn is_manifest(body: &[u8]) -> bool {
  let body = body.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(body);
  let start = body.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(body.len());
  body[start..].starts_with(b"#EXTM3U")
}

/// Tag name without the leading `#`, e.g. `EXT-X-KEY`.
fn tag_name(line: &str) -> &str {
  let t = line.trim_start().trim_start_matches('#');
  t.split(':').next().unwrap_or(t).trim_end()
}

fn attribute_kind(tag: &str) -> Option<UriKind> {
  match tag {
    "EXT-X-KEY" | "EXT-X-SESSION-KEY" => Some(UriKind::Key),
    "EXT-X-MEDIA" | "EXT-X-I-FRAME-STREAM-INF" | "EXT-X-RENDITION-REPORT" => Some(UriKind::Manifest),
    "EXT-X-MAP" | "EXT-X-PART" | "EXT-X-PRELOAD-HINT" => Some(UriKind::Segment),
    _ => None,
  }
}

/// Byte range of the `URI` attribute value (inside the quotes) of a tag line.
fn uri_attribute_range(line: &str) -> Option<(usize, usize)> {
  let colon = line.find(':')?;
  let bytes = line.as_bytes();
  let mut i = colon + 1;
  while i < bytes.len() {
    // Attribute name runs up to '='.
    let name_start = i;
    while i < bytes.len() && bytes[i] != b'=' && bytes[i] != b',' {
      i += 1;
    }
    if i >= bytes.len() || bytes[i] == b',' {
      i += 1;
      continue;
    }
    let name = line[name_start..i].trim();
    i += 1;
    if i < bytes.len() && bytes[i] == b'"' {
      let value_start = i + 1;
      let value_end = value_start + line[value_start..].find('"')?;
      if name == "URI" {
        return Some((value_start, value_end));
      }
      i = value_end + 1;
    } else {
      while i < bytes.len() && bytes[i] != b',' {
        i += 1;
      }
    }
    // Skip the separating comma.
    i += 1;
  }
  None
}

/// Resolve `raw` against the manifest URL.
pub fn absolutize(raw: &str, base: &Url) -> String {
  base.join(raw).map(|u| u.to_string()).unwrap_or_else(|_| raw.to_string())
}

/// Rewrites manifest references.
///
/// `link` maps an absolute upstream URL of a given kind to the URL the client
/// should request. With `proxy_content` off, manifest and segment URIs are
/// only made absolute so clients fetch media straight from upstream; keys are
/// always routed through `link` because upstream demands matching headers.
pub struct Rewriter<'a, F>
where
  F: Fn(UriKind, &str) -> String,
{
  base: &'a Url,
  proxy_content: bool,
  link: F,
}

impl<'a, F> Rewriter<'a, F>
where
  F: Fn(UriKind, &str) -> String,
{
  pub fn new(base: &'a Url, proxy_content: bool, link: F) -> Self {
    Self { base, proxy_content, link }
  }

  fn target(&self, kind: UriKind, raw: &str) -> String {
    let absolute = absolutize(raw, self.base);
    if self.proxy_content || kind == UriKind::Key { (self.link)(kind, &absolute) } else { absolute }
  }

  pub fn rewrite(&self, manifest: &str) -> String {
    let mut out = String::with_capacity(manifest.len() + manifest.len() / 2);
    let mut next_uri_is_variant = false;

    for (n, line) in lines(manifest).enumerate() {
      if n > 0 {
        out.push('\n');
      }
      match line {
        Line::Blank(raw) | Line::Comment(raw) => out.push_str(raw),
        Line::Tag(raw) => {
          let tag = tag_name(raw);
          if tag == "EXT-X-STREAM-INF" {
            next_uri_is_variant = true;
          }
          match (attribute_kind(tag), uri_attribute_range(raw)) {
            (Some(kind), Some((start, end))) => {
              out.push_str(&raw[..start]);
              out.push_str(&self.target(kind, &raw[start..end]));
              out.push_str(&raw[end..]);
            }
            _ => out.push_str(raw),
          }
        }
        Line::Uri(raw) => {
          let uri = raw.trim();
          let kind = if next_uri_is_variant || looks_like_manifest(uri) { UriKind::Manifest } else { UriKind::Segment };
          next_uri_is_variant = false;
          // Keep surrounding whitespace, notably a trailing '\r'.
          let lead = &raw[..raw.len() - raw.trim_start().len()];
          let trail = &raw[raw.trim_end().len()..];
          out.push_str(lead);
          out.push_str(&self.target(kind, uri));
          out.push_str(trail);
        }
      }
    }
    out
  }
}

fn looks_like_manifest(uri: &str) -> bool {
  let path = uri.split(['?', '#']).next().unwrap_or(uri).to_ascii_lowercase();
  path.ends_with(".m3u8") || path.ends_with(".m3u")
}
