//! Feed style playlists: JSON directories and OPML outlines.
//!
//! Radio directories describe their stations as trees of items. Only the
//! items that can be played become entries, in depth-first order.

use serde_json::Value;

use super::parse::{xml_nodes, Entry, Node};

/// Keys that hold a playable URL, in order of preference.
const URL_KEYS: [&str; 2] = ["play", "url"];

/// Keys that hold a display title, in order of preference.
const TITLE_KEYS: [&str; 3] = ["title", "name", "text"];

/// Keys that hold an artwork URL, in order of preference.
const ICON_KEYS: [&str; 2] = ["image", "icon"];

/// Keys that hold nested items.
const CHILD_KEYS: [&str; 3] = ["items", "body", "outline"];

fn first_str<'a>(item: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|key| item.get(key).and_then(Value::as_str))
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn flatten(value: &Value, entries: &mut Vec<Entry>) {
    match value {
        Value::Array(items) => {
            for item in items {
                flatten(item, entries);
            }
        }
        Value::Object(_) => {
            if let Some(url) = first_str(value, &URL_KEYS) {
                entries.push(Entry {
                    url: url.to_owned(),
                    title: first_str(value, &TITLE_KEYS).map(ToOwned::to_owned),
                    icon: first_str(value, &ICON_KEYS).map(ToOwned::to_owned),
                });
            }

            for key in CHILD_KEYS {
                if let Some(children) = value.get(key) {
                    flatten(children, entries);
                }
            }
        }
        _ => {}
    }
}

/// Reads a JSON feed.
#[must_use]
pub fn json(body: &str) -> Vec<Entry> {
    match serde_json::from_str::<Value>(body) {
        Ok(value) => {
            let mut entries = Vec::new();
            flatten(&value, &mut entries);
            entries
        }
        Err(e) => {
            debug!("unreadable JSON feed: {e}");
            Vec::new()
        }
    }
}

/// Reads an OPML outline.
#[must_use]
pub fn opml(body: &str) -> Vec<Entry> {
    xml_nodes(body)
        .into_iter()
        .filter_map(|node| match node {
            Node::Open { name, attributes } if name == "outline" => {
                let url = Node::attribute(&attributes, "url").filter(|url| !url.is_empty())?;
                Some(Entry {
                    url,
                    title: Node::attribute(&attributes, "text").filter(|text| !text.is_empty()),
                    icon: Node::attribute(&attributes, "image").filter(|icon| !icon.is_empty()),
                })
            }
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_json_items() {
        let entries = json(
            r#"{
                "head": {"title": "Jazz"},
                "body": [
                    {"text": "Stations", "children": [], "items": [
                        {"play": "http://a.example/1.mp3", "name": "One", "image": "http://a.example/1.png"},
                        {"url": "http://a.example/2.pls", "text": "Two"}
                    ]},
                    {"title": "Browse only"},
                    {"url": "http://a.example/3.m3u"}
                ]
            }"#,
        );
        let urls: Vec<_> = entries.iter().map(|entry| entry.url.as_str()).collect();
        assert_eq!(
            urls,
            [
                "http://a.example/1.mp3",
                "http://a.example/2.pls",
                "http://a.example/3.m3u"
            ]
        );
        assert_eq!(entries[0].title.as_deref(), Some("One"));
        assert_eq!(entries[0].icon.as_deref(), Some("http://a.example/1.png"));
        assert_eq!(entries[1].title.as_deref(), Some("Two"));
        assert_eq!(entries[2].title, None);
    }

    #[test]
    fn play_wins_over_url() {
        let entries = json(r#"[{"play": "http://a.example/stream", "url": "http://a.example/page"}]"#);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].url, "http://a.example/stream");
    }

    #[test]
    fn invalid_json_is_empty() {
        assert!(json("{not json").is_empty());
    }

    #[test]
    fn opml_outlines() {
        let entries = opml(
            r#"<?xml version="1.0"?>
            <opml version="1"><head><title>Local</title></head><body>
                <outline text="News" type="link" URL="http://a.example/news.opml">
                    <outline type="audio" text="Radio A" URL="http://a.example/a.pls" image="http://a.example/a.png"/>
                </outline>
                <outline text="No link"/>
            </body></opml>"#,
        );
        let urls: Vec<_> = entries.iter().map(|entry| entry.url.as_str()).collect();
        assert_eq!(urls, ["http://a.example/news.opml", "http://a.example/a.pls"]);
        assert_eq!(entries[1].title.as_deref(), Some("Radio A"));
        assert_eq!(entries[1].icon.as_deref(), Some("http://a.example/a.png"));
    }
}
