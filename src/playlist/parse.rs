//! Playlist file formats.
//!
//! Readers are lenient: stream servers hand out playlists written by hand,
//! by ancient tools or by web frameworks, so anything that cannot be read
//! is skipped rather than failing the whole playlist. URLs are returned as
//! written and resolved against the playlist URL later.

use quick_xml::{events::Event, Reader};

use super::feed;

/// One playlist item.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Entry {
    pub url: String,
    pub title: Option<String>,

    /// Artwork URL.
    pub icon: Option<String>,
}

impl Entry {
    fn new(url: &str) -> Self {
        Self {
            url: url.trim().to_owned(),
            ..Default::default()
        }
    }

    fn with_title(mut self, title: Option<String>) -> Self {
        self.title = title.filter(|title| !title.is_empty());
        self
    }
}

/// Corrects the playlist type for servers that mislabel their playlists.
#[must_use]
pub fn detect<'a>(tag: &'a str, body: &str) -> &'a str {
    let head = body.trim_start_matches('\u{feff}').trim_start();
    let lower = head.chars().take(16).collect::<String>().to_ascii_lowercase();

    if lower.starts_with("[playlist]") {
        "pls"
    } else if lower.starts_with("<asx") || lower.starts_with("[reference]") {
        "asx"
    } else if lower.starts_with("#extm3u") {
        "m3u"
    } else {
        tag
    }
}

/// Reads the entries of a playlist of type `tag`.
#[must_use]
pub fn read(tag: &str, body: &str) -> Vec<Entry> {
    let body = body.trim_start_matches('\u{feff}');
    match detect(tag, body) {
        "m3u" => m3u(body),
        "pls" => pls(body),
        "asx" => asx(body),
        "wpl" => wpl(body),
        "xspf" => xspf(body),
        "json" => feed::json(body),
        "opml" => feed::opml(body),
        other => {
            debug!("no reader for playlist type {other}");
            Vec::new()
        }
    }
}

/// Reads M3U and extended M3U.
fn m3u(body: &str) -> Vec<Entry> {
    let mut entries = Vec::new();
    let mut title = None;

    for line in body.lines().map(str::trim) {
        if let Some(info) = line.strip_prefix("#EXTINF:") {
            // #EXTINF:<seconds>,<title>
            title = info.split_once(',').map(|(_, title)| title.trim().to_owned());
        } else if line.is_empty() || line.starts_with('#') {
            continue;
        } else if line.contains(['<', '>']) {
            // web pages served as text
            trace!("skipping markup in M3U: {line}");
        } else {
            entries.push(Entry::new(line).with_title(title.take()));
        }
    }

    entries
}

/// Reads PLS, ordering entries by their number.
fn pls(body: &str) -> Vec<Entry> {
    let mut files: Vec<(u32, Entry)> = Vec::new();
    let mut titles = Vec::new();

    for line in body.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let value = value.trim();

        if let Some(n) = key.strip_prefix("file").and_then(|n| n.parse().ok()) {
            files.push((n, Entry::new(value)));
        } else if let Some(n) = key.strip_prefix("title").and_then(|n| n.parse::<u32>().ok()) {
            titles.push((n, value.to_owned()));
        }
    }

    files.sort_by_key(|(n, _)| *n);
    files
        .into_iter()
        .map(|(n, entry)| {
            let title = titles
                .iter()
                .find(|(title_n, _)| *title_n == n)
                .map(|(_, title)| title.clone());
            entry.with_title(title)
        })
        .collect()
}

/// An XML element or text, with lowercased names.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(super) enum Node {
    Open {
        name: String,
        attributes: Vec<(String, String)>,
    },
    Text(String),
    Close(String),
}

impl Node {
    pub(super) fn attribute(attributes: &[(String, String)], name: &str) -> Option<String> {
        attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.trim().to_owned())
    }
}

/// Flattens an XML document into nodes. Empty elements open and close
/// immediately. Reading stops at the first syntax error.
pub(super) fn xml_nodes(body: &str) -> Vec<Node> {
    let mut reader = Reader::from_str(body);
    reader.config_mut().trim_text(true);
    reader.config_mut().check_end_names = false;

    let mut nodes = Vec::new();
    let open = |e: &quick_xml::events::BytesStart| Node::Open {
        name: String::from_utf8_lossy(e.local_name().as_ref()).to_ascii_lowercase(),
        attributes: e
            .attributes()
            .filter_map(Result::ok)
            .filter_map(|attribute| {
                let key = String::from_utf8_lossy(attribute.key.local_name().as_ref())
                    .to_ascii_lowercase();
                let value = attribute.unescape_value().ok()?.into_owned();
                Some((key, value))
            })
            .collect(),
    };

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => nodes.push(open(&e)),
            Ok(Event::Empty(e)) => {
                let node = open(&e);
                if let Node::Open { name, .. } = &node {
                    let close = Node::Close(name.clone());
                    nodes.push(node);
                    nodes.push(close);
                }
            }
            Ok(Event::Text(text)) => {
                if let Ok(text) = text.unescape() {
                    nodes.push(Node::Text(text.into_owned()));
                }
            }
            Ok(Event::CData(data)) => {
                nodes.push(Node::Text(String::from_utf8_lossy(&data).into_owned()));
            }
            Ok(Event::End(e)) => nodes.push(Node::Close(
                String::from_utf8_lossy(e.local_name().as_ref()).to_ascii_lowercase(),
            )),
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("stopped reading XML playlist: {e}");
                break;
            }
        }
    }

    nodes
}

/// Reads ASX, including the INI style `[Reference]` variant.
fn asx(body: &str) -> Vec<Entry> {
    if body.trim_start().to_ascii_lowercase().starts_with("[reference]") {
        return body
            .lines()
            .filter_map(|line| line.split_once('='))
            .filter(|(key, _)| key.trim().to_ascii_lowercase().starts_with("ref"))
            .map(|(_, url)| Entry::new(url))
            .collect();
    }

    let mut entries = Vec::new();
    let mut in_entry = false;
    let mut in_title = false;
    let mut title = None;
    let mut refs = Vec::new();

    for node in xml_nodes(body) {
        match node {
            Node::Open { name, attributes } => match name.as_str() {
                "entry" => {
                    in_entry = true;
                    title = None;
                }
                "title" => in_title = in_entry,
                "ref" | "entryref" => {
                    if let Some(href) = Node::attribute(&attributes, "href") {
                        if in_entry {
                            refs.push(href);
                        } else {
                            entries.push(Entry::new(&href));
                        }
                    }
                }
                _ => {}
            },
            Node::Text(text) if in_title => title = Some(text),
            Node::Close(name) => match name.as_str() {
                "title" => in_title = false,
                "entry" => {
                    in_entry = false;
                    entries.extend(
                        refs.drain(..)
                            .map(|href| Entry::new(&href).with_title(title.clone())),
                    );
                }
                _ => {}
            },
            Node::Text(_) => {}
        }
    }

    entries
}

/// Reads Windows Media Player playlists.
fn wpl(body: &str) -> Vec<Entry> {
    xml_nodes(body)
        .into_iter()
        .filter_map(|node| match node {
            Node::Open { name, attributes } if name == "media" => {
                Node::attribute(&attributes, "src").map(|src| Entry::new(&src))
            }
            _ => None,
        })
        .collect()
}

/// Reads XML shareable playlists.
fn xspf(body: &str) -> Vec<Entry> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Field {
        None,
        Location,
        Title,
        Image,
    }

    let mut entries = Vec::new();
    let mut track: Option<Entry> = None;
    let mut field = Field::None;

    for node in xml_nodes(body) {
        match node {
            Node::Open { name, .. } => match name.as_str() {
                "track" => track = Some(Entry::default()),
                "location" => field = Field::Location,
                "title" => field = Field::Title,
                "image" => field = Field::Image,
                _ => field = Field::None,
            },
            Node::Text(text) => {
                let Some(track) = track.as_mut() else {
                    continue;
                };
                match field {
                    // only the first location is played
                    Field::Location if track.url.is_empty() => track.url = text.trim().to_owned(),
                    Field::Title => track.title = Some(text),
                    Field::Image => track.icon = Some(text.trim().to_owned()),
                    Field::Location | Field::None => {}
                }
            }
            Node::Close(name) => {
                field = Field::None;
                if name == "track" {
                    if let Some(track) = track.take().filter(|track| !track.url.is_empty()) {
                        entries.push(track);
                    }
                }
            }
        }
    }

    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    fn urls(entries: &[Entry]) -> Vec<&str> {
        entries.iter().map(|entry| entry.url.as_str()).collect()
    }

    #[test]
    fn extended_m3u() {
        let entries = read(
            "m3u",
            "#EXTM3U\n#EXTINF:-1,Radio One\nhttp://a.example/one\n\n# comment\nrelative/two.mp3\n",
        );
        assert_eq!(urls(&entries), ["http://a.example/one", "relative/two.mp3"]);
        assert_eq!(entries[0].title.as_deref(), Some("Radio One"));
        assert_eq!(entries[1].title, None);
    }

    #[test]
    fn html_is_not_a_playlist() {
        assert!(read("m3u", "<html>\n<body>Not found</body>\n</html>").is_empty());
    }

    #[test]
    fn pls_is_ordered_by_number() {
        let entries = read(
            "pls",
            "[playlist]\nFile2=http://a.example/2\nTitle2=Two\nFile1=http://a.example/1\nNumberOfEntries=2\n",
        );
        assert_eq!(urls(&entries), ["http://a.example/1", "http://a.example/2"]);
        assert_eq!(entries[1].title.as_deref(), Some("Two"));
    }

    #[test]
    fn pls_served_as_m3u() {
        let entries = read("m3u", "[playlist]\nfile1=http://a.example/1\n");
        assert_eq!(urls(&entries), ["http://a.example/1"]);
    }

    #[test]
    fn asx_entries() {
        let entries = read(
            "asx",
            r#"<ASX version="3.0">
                <Title>Station</Title>
                <Entry>
                    <Title>Morning Show</Title>
                    <Ref href="mms://media.example.com/live" />
                    <REF HREF="http://media.example.com/live" />
                </Entry>
                <EntryRef href="http://a.example/more.asx"/>
            </ASX>"#,
        );
        assert_eq!(
            urls(&entries),
            [
                "mms://media.example.com/live",
                "http://media.example.com/live",
                "http://a.example/more.asx"
            ]
        );
        assert_eq!(entries[0].title.as_deref(), Some("Morning Show"));
        assert_eq!(entries[2].title, None);
    }

    #[test]
    fn asx_reference() {
        let entries = read(
            "asx",
            "[Reference]\r\nRef1=http://media.example.com/live?MSWMExt=.asf\r\nRef2=http://backup.example.com/live\r\n",
        );
        assert_eq!(
            urls(&entries),
            [
                "http://media.example.com/live?MSWMExt=.asf",
                "http://backup.example.com/live"
            ]
        );
    }

    #[test]
    fn wpl_media() {
        let entries = read(
            "wpl",
            r#"<?wpl version="1.0"?><smil><body><seq>
                <media src="http://a.example/1.wma"/>
                <media src="http://a.example/2.wma"/>
            </seq></body></smil>"#,
        );
        assert_eq!(urls(&entries), ["http://a.example/1.wma", "http://a.example/2.wma"]);
    }

    #[test]
    fn xspf_tracks() {
        let entries = read(
            "xspf",
            r#"<?xml version="1.0" encoding="UTF-8"?>
            <playlist version="1" xmlns="http://xspf.org/ns/0/">
              <title>List</title>
              <trackList>
                <track>
                  <location>http://a.example/1.ogg</location>
                  <title>One &amp; Only</title>
                  <image>http://a.example/1.jpg</image>
                </track>
                <track><title>No location</title></track>
              </trackList>
            </playlist>"#,
        );
        assert_eq!(urls(&entries), ["http://a.example/1.ogg"]);
        assert_eq!(entries[0].title.as_deref(), Some("One & Only"));
        assert_eq!(entries[0].icon.as_deref(), Some("http://a.example/1.jpg"));
    }
}
