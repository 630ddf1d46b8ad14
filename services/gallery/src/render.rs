//! HTML rendering of directory listings.
//!
//! Media elements never carry an active `src` in the generated markup; the
//! real URL sits in `data-src` until the lazy-load script promotes it.

use crate::listing::DirectoryListing;
use crate::probe::{EntryKind, FileEntry, MediaCategory};
use maud::{html, Markup, PreEscaped, DOCTYPE};
use std::ffi::OsStr;

/// Query string appended to a video URL to request its thumbnail
pub const POSTER_QUERY: &str = "poster=1";

const STYLE: &str = r#"
body {
  display: flex;
  flex-direction: column;
  gap: 8px;
  font-family: sans-serif;
}
figure {
  margin: 0;
}
video, img {
  width: 100%;
}
.meta {
  margin-left: 1em;
  opacity: 0.7;
}
"#;

// Elements are promoted once they stay in the viewport for SETTLE_MS.
const LAZY_LOAD_SCRIPT: &str = r#"
(() => {
  const SETTLE_MS = 200;
  const pending = new Map();
  const promote = (el) => {
    if (el.tagName === 'VIDEO' && !el.getAttribute('poster') && el.dataset.poster) {
      el.poster = el.dataset.poster;
    }
    if (!el.getAttribute('src') && el.dataset.src) {
      el.src = el.dataset.src;
    }
  };
  const observer = new IntersectionObserver((entries) => {
    entries.forEach((entry) => {
      const el = entry.target;
      if (entry.isIntersecting) {
        if (!pending.has(el)) {
          pending.set(el, setTimeout(() => {
            pending.delete(el);
            observer.unobserve(el);
            promote(el);
          }, SETTLE_MS));
        }
      } else if (pending.has(el)) {
        clearTimeout(pending.get(el));
        pending.delete(el);
      }
    });
  });
  document
    .querySelectorAll('video[data-src], audio[data-src], img[data-src]')
    .forEach((el) => observer.observe(el));
})();
"#;

/// Render a full gallery page.
///
/// `base_href` must end with a slash; it anchors the relative entry links
/// when the page was requested without a trailing slash.
pub fn render_page(title: &str, base_href: &str, listing: &DirectoryListing) -> Markup {
    html! {
        (DOCTYPE)
        html lang="en" {
            head {
                meta charset="UTF-8";
                meta name="viewport" content="width=device-width, initial-scale=1.0";
                meta name="color-scheme" content="light dark";
                base href=(base_href);
                title { (title) }
                style { (PreEscaped(STYLE)) }
            }
            body {
                a href="../" { "../" }
                (render_gallery(listing))
                script { (PreEscaped(LAZY_LOAD_SCRIPT)) }
            }
        }
    }
}

/// Render the entries of a listing, in listing order
pub fn render_gallery(listing: &DirectoryListing) -> Markup {
    html! {
        @for entry in listing.iter() {
            (render_entry(entry))
        }
    }
}

fn render_entry(entry: &FileEntry) -> Markup {
    let href = format!("./{}", encode_name(&entry.name));
    let name = entry.display_name();

    match &entry.kind {
        EntryKind::Directory => plain_link(entry, &format!("{href}/"), None),
        EntryKind::Other => plain_link(entry, &href, None),
        EntryKind::File { size, category } => match category {
            MediaCategory::Unknown => plain_link(entry, &href, Some(*size)),
            MediaCategory::Video => html! {
                figure {
                    video data-src=(href) data-poster=(format!("{href}?{POSTER_QUERY}")) controls preload="none" {}
                    figcaption { (name) }
                }
            },
            MediaCategory::Audio => html! {
                figure {
                    audio data-src=(href) controls preload="none" {}
                    figcaption { (name) }
                }
            },
            MediaCategory::Image => html! {
                figure {
                    img data-src=(href) alt=(name);
                    figcaption { (name) }
                }
            },
        },
    }
}

/// Percent-encode the raw bytes of an on-disk name, so names that are not
/// UTF-8 still link to the file they came from.
#[cfg(unix)]
fn encode_name(name: &OsStr) -> String {
    use std::os::unix::ffi::OsStrExt;
    urlencoding::encode_binary(name.as_bytes()).into_owned()
}

#[cfg(not(unix))]
fn encode_name(name: &OsStr) -> String {
    urlencoding::encode(&name.to_string_lossy()).into_owned()
}

fn plain_link(entry: &FileEntry, href: &str, size: Option<u64>) -> Markup {
    html! {
        div {
            a href=(href) { (entry.display_name()) }
            @if let Some(accessed) = &entry.accessed {
                span.meta { (accessed) }
            }
            @if let Some(size) = size {
                span.meta { (size) }
            }
        }
    }
}
